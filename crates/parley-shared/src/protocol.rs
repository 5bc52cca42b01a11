//! Push-channel protocol.
//!
//! The transport is assumed to be a bidirectional per-connection stream with
//! room-style multicast (framing belongs to the embedding layer).  Events are
//! externally visible JSON: `{ "event": "...", "data": { ... } }`.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Message, MessageBody, MessageStatus};
use crate::types::{ConversationId, MessageId, UserId};

/// Events a client sends over its connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Announce which user owns this connection.  Must be the first event.
    #[serde(rename_all = "camelCase")]
    PresenceHello { user_id: UserId },

    /// Join a conversation's multicast room (used for typing indicators).
    #[serde(rename_all = "camelCase")]
    Subscribe { conversation_id: ConversationId },

    #[serde(rename_all = "camelCase")]
    Unsubscribe { conversation_id: ConversationId },

    /// Send-message intent.  The payload is the tagged `type`/`content`
    /// union, flattened alongside the addressing fields.
    #[serde(rename_all = "camelCase")]
    Send {
        conversation_id: ConversationId,
        sender_id: UserId,
        #[serde(flatten)]
        body: MessageBody,
    },

    /// Read acknowledgement for a single message.
    #[serde(rename_all = "camelCase")]
    AckRead {
        message_id: MessageId,
        conversation_id: ConversationId,
        reader_id: UserId,
    },

    #[serde(rename_all = "camelCase")]
    Typing {
        conversation_id: ConversationId,
        user_name: String,
    },

    #[serde(rename_all = "camelCase")]
    StopTyping {
        conversation_id: ConversationId,
        user_name: String,
    },
}

/// Events the server pushes to connections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// A fully persisted message, echoed to the sender's connections too.
    MessageReceived(Message),

    /// Lightweight preview update so clients can refresh an unopened
    /// conversation without re-fetching history.
    #[serde(rename_all = "camelCase")]
    ConversationSummaryChanged {
        conversation_id: ConversationId,
        last_message: Option<Message>,
        updated_at: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    MessageStatusChanged {
        message_id: MessageId,
        status: MessageStatus,
        read_by: BTreeSet<UserId>,
    },

    #[serde(rename_all = "camelCase")]
    PeerTyping {
        conversation_id: ConversationId,
        user_name: String,
    },

    #[serde(rename_all = "camelCase")]
    PeerStopTyping {
        conversation_id: ConversationId,
        user_name: String,
    },

    /// Normal terminal transition of a group whose last participant left.
    #[serde(rename = "deletedConversation", rename_all = "camelCase")]
    ConversationDeleted { conversation_id: ConversationId },

    /// A send or ack could not be processed; the client should treat the
    /// originating message as unconfirmed.
    SendFailed { reason: String },
}
