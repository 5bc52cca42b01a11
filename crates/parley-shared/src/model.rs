//! Domain models for conversations, messages and users.
//!
//! These structs are what the REST surface returns and what push events
//! carry, so every field uses the camelCase wire names the web client
//! expects.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ConversationId, MessageId, UserId};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A chat participant.  Identity, profile setup and avatars are owned by the
/// external auth/profile services; the chat core only snapshots presence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    /// Reference into the external file service, if the user has an avatar.
    pub avatar_url: Option<String>,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A 1:1 or group conversation, fully expanded for clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub is_group: bool,
    /// Group name; `None` for direct conversations.
    pub name: Option<String>,
    pub participants: BTreeSet<UserId>,
    /// Always empty for direct conversations; never empty for a group with
    /// remaining participants.
    pub admins: BTreeSet<UserId>,
    pub created_by: UserId,
    /// Expanded last message, used for conversation-list previews.
    pub last_message: Option<Message>,
    pub created_at: DateTime<Utc>,
    /// Bumped on every new message or membership change; the sole ordering
    /// key for conversation lists.
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_participant(&self, user: UserId) -> bool {
        self.participants.contains(&user)
    }

    pub fn is_admin(&self, user: UserId) -> bool {
        self.admins.contains(&user)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Aggregate delivery status of a message.  Monotonically non-decreasing:
/// a message never moves back from `Read`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "read" => Some(MessageStatus::Read),
            _ => None,
        }
    }
}

/// Payload of a file-flavoured message.  The blob itself lives in the
/// external file service; we only store the pointer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileAttachment {
    pub url: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
}

/// Message payload, keyed by `type` on the wire.  Each variant declares only
/// the fields it legally needs; unknown or mismatched shapes fail to
/// deserialize instead of being passed through.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "content", rename_all = "lowercase")]
pub enum MessageBody {
    Text { text: String },
    Image(FileAttachment),
    Video(FileAttachment),
    Audio(FileAttachment),
    Pdf(FileAttachment),
    Document(FileAttachment),
    File(FileAttachment),
    /// Server-authored record of a conversation-state transition (group
    /// created, renamed, member added/removed, admin changed).
    System { text: String },
}

/// Content rejected at the store boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContentError {
    #[error("text content must not be empty")]
    EmptyText,
    #[error("file content requires a url")]
    MissingUrl,
    #[error("file content requires a file name")]
    MissingName,
}

impl MessageBody {
    /// The wire `type` tag for this payload.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Text { .. } => "text",
            MessageBody::Image(_) => "image",
            MessageBody::Video(_) => "video",
            MessageBody::Audio(_) => "audio",
            MessageBody::Pdf(_) => "pdf",
            MessageBody::Document(_) => "document",
            MessageBody::File(_) => "file",
            MessageBody::System { .. } => "system",
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, MessageBody::System { .. })
    }

    /// Shape checks beyond what deserialization already enforces.
    pub fn validate(&self) -> Result<(), ContentError> {
        match self {
            MessageBody::Text { text } | MessageBody::System { text } => {
                if text.trim().is_empty() {
                    return Err(ContentError::EmptyText);
                }
            }
            MessageBody::Image(f)
            | MessageBody::Video(f)
            | MessageBody::Audio(f)
            | MessageBody::Pdf(f)
            | MessageBody::Document(f)
            | MessageBody::File(f) => {
                if f.url.is_empty() {
                    return Err(ContentError::MissingUrl);
                }
                if f.name.is_empty() {
                    return Err(ContentError::MissingName);
                }
            }
        }
        Ok(())
    }
}

/// A single chat message.  Immutable once created except for `status` and
/// `read_by`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    /// `None` for system messages, which have no human sender.
    pub sender_id: Option<UserId>,
    #[serde(flatten)]
    pub body: MessageBody,
    pub status: MessageStatus,
    /// Everyone who has read the message.  Always contains the sender.
    pub read_by: BTreeSet<UserId>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// A freshly sent user message: `status = sent`, read by its sender only.
    pub fn outgoing(
        conversation_id: ConversationId,
        sender: UserId,
        body: MessageBody,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            sender_id: Some(sender),
            body,
            status: MessageStatus::Sent,
            read_by: BTreeSet::from([sender]),
            timestamp,
        }
    }

    /// A server-authored system message documenting a state transition.
    pub fn system(
        conversation_id: ConversationId,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            sender_id: None,
            body: MessageBody::System { text: text.into() },
            status: MessageStatus::Sent,
            read_by: BTreeSet::new(),
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_ordered() {
        assert!(MessageStatus::Sent < MessageStatus::Delivered);
        assert!(MessageStatus::Delivered < MessageStatus::Read);
    }

    #[test]
    fn body_wire_shape() {
        let body = MessageBody::Text {
            text: "hi".to_string(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "text", "content": { "text": "hi" } }));

        let body = MessageBody::Image(FileAttachment {
            url: "https://files.example/abc".to_string(),
            name: "cat.png".to_string(),
            mime_type: "image/png".to_string(),
            size: 512,
        });
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["content"]["mimeType"], "image/png");
    }

    #[test]
    fn unknown_body_shape_is_rejected() {
        let raw = serde_json::json!({ "type": "sticker", "content": { "id": 7 } });
        assert!(serde_json::from_value::<MessageBody>(raw).is_err());

        // Mismatched shape: text tag with file fields.
        let raw = serde_json::json!({ "type": "text", "content": { "url": "x" } });
        assert!(serde_json::from_value::<MessageBody>(raw).is_err());
    }

    #[test]
    fn validate_rejects_empty_fields() {
        let body = MessageBody::Text {
            text: "   ".to_string(),
        };
        assert_eq!(body.validate(), Err(ContentError::EmptyText));

        let body = MessageBody::File(FileAttachment {
            url: String::new(),
            name: "f.bin".to_string(),
            mime_type: "application/octet-stream".to_string(),
            size: 1,
        });
        assert_eq!(body.validate(), Err(ContentError::MissingUrl));
    }

    #[test]
    fn message_flattens_body() {
        let msg = Message::outgoing(
            ConversationId::new(),
            UserId::new(),
            MessageBody::Text {
                text: "hello".to_string(),
            },
            Utc::now(),
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["content"]["text"], "hello");
        assert_eq!(json["status"], "sent");
        assert_eq!(json["readBy"].as_array().unwrap().len(), 1);
    }
}
