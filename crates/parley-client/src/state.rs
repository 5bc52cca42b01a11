//! Chat view model: the reconciliation state machine.
//!
//! Holds the conversation list (sorted by recency), the single open
//! conversation with its message history, and the typing indicators.
//! Every push event is routed through [`ChatView::apply`], which checks
//! the *current* open conversation each time, so events racing a local
//! open/close always land in the right branch.

use chrono::{DateTime, Utc};
use serde::Serialize;

use parley_shared::{Conversation, ConversationId, Message, MessageId, ServerEvent, UserId};

use crate::typing::TypingTracker;

/// Side effects the embedding layer must perform after [`ChatView::apply`]
/// or an open/close action.  Ordering within the returned vector matters.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "command", content = "data", rename_all = "camelCase")]
pub enum ClientCommand {
    /// Acknowledge a message as read on the push channel.
    #[serde(rename_all = "camelCase")]
    AckRead {
        message_id: MessageId,
        conversation_id: ConversationId,
    },
    /// Join a conversation's typing-indicator room.
    #[serde(rename_all = "camelCase")]
    Subscribe { conversation_id: ConversationId },
    #[serde(rename_all = "camelCase")]
    Unsubscribe { conversation_id: ConversationId },
    /// The server referenced a conversation this client has never seen;
    /// re-fetch the conversation list over REST.
    RefetchConversations,
}

/// Client-side chat state for one user.
#[derive(Debug)]
pub struct ChatView {
    user: UserId,
    /// All known conversations, most recently updated first.
    conversations: Vec<Conversation>,
    /// The conversation whose history is on screen, if any.
    open: Option<ConversationId>,
    /// Message history of the open conversation, oldest first.
    messages: Vec<Message>,
    pub typing: TypingTracker,
}

impl ChatView {
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            conversations: Vec::new(),
            open: None,
            messages: Vec::new(),
            typing: TypingTracker::new(),
        }
    }

    // -- accessors ----------------------------------------------------------

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn open_id(&self) -> Option<ConversationId> {
        self.open
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    // -- local actions ------------------------------------------------------

    /// Replace the conversation list from a REST fetch.  The open
    /// conversation is closed if it no longer exists.
    pub fn set_conversations(&mut self, mut conversations: Vec<Conversation>) -> Vec<ClientCommand> {
        sort_by_recency(&mut conversations);
        self.conversations = conversations;

        match self.open {
            Some(id) if !self.knows(id) => self.close_conversation(),
            _ => Vec::new(),
        }
    }

    /// Open a conversation with its freshly fetched history.  Emits a
    /// subscribe for the new room, an unsubscribe for the previous one,
    /// and a read ack for every foreign message not yet read by this user.
    pub fn open_conversation(
        &mut self,
        id: ConversationId,
        history: Vec<Message>,
    ) -> Vec<ClientCommand> {
        let mut commands = Vec::new();
        if let Some(previous) = self.open.take() {
            if previous != id {
                commands.push(ClientCommand::Unsubscribe {
                    conversation_id: previous,
                });
            }
        }

        commands.push(ClientCommand::Subscribe {
            conversation_id: id,
        });
        for message in &history {
            if self.needs_ack(message) {
                commands.push(ClientCommand::AckRead {
                    message_id: message.id,
                    conversation_id: id,
                });
            }
        }

        self.open = Some(id);
        self.messages = history;
        commands
    }

    pub fn close_conversation(&mut self) -> Vec<ClientCommand> {
        self.messages.clear();
        match self.open.take() {
            Some(id) => {
                self.typing.clear_conversation(id);
                vec![ClientCommand::Unsubscribe {
                    conversation_id: id,
                }]
            }
            None => Vec::new(),
        }
    }

    // -- push events --------------------------------------------------------

    /// Reconcile one push event.  `now` drives typing-indicator expiry.
    pub fn apply(&mut self, event: ServerEvent, now: DateTime<Utc>) -> Vec<ClientCommand> {
        match event {
            ServerEvent::MessageReceived(message) => self.on_message(message),
            ServerEvent::ConversationSummaryChanged {
                conversation_id,
                last_message,
                updated_at,
            } => self.on_summary(conversation_id, last_message, updated_at),
            ServerEvent::MessageStatusChanged {
                message_id,
                status,
                read_by,
            } => {
                self.on_status(message_id, status, read_by);
                Vec::new()
            }
            ServerEvent::PeerTyping {
                conversation_id,
                user_name,
            } => {
                self.typing.started(conversation_id, user_name, now);
                Vec::new()
            }
            ServerEvent::PeerStopTyping {
                conversation_id,
                user_name,
            } => {
                self.typing.stopped(conversation_id, &user_name);
                Vec::new()
            }
            ServerEvent::ConversationDeleted { conversation_id } => {
                self.on_deleted(conversation_id)
            }
            ServerEvent::SendFailed { reason } => {
                tracing::warn!(%reason, "server rejected a send");
                Vec::new()
            }
        }
    }

    fn on_message(&mut self, message: Message) -> Vec<ClientCommand> {
        let conversation_id = message.conversation_id;

        if self.open == Some(conversation_id) {
            let mut commands = Vec::new();
            if self.needs_ack(&message) {
                commands.push(ClientCommand::AckRead {
                    message_id: message.id,
                    conversation_id,
                });
            }
            // The fan-out echoes our own sends back; dedupe by id.
            if !self.messages.iter().any(|m| m.id == message.id) {
                self.messages.push(message.clone());
            }
            self.patch_preview(conversation_id, Some(message), None);
            return commands;
        }

        if self.knows(conversation_id) {
            let updated_at = message.timestamp;
            self.patch_preview(conversation_id, Some(message), Some(updated_at));
            Vec::new()
        } else {
            vec![ClientCommand::RefetchConversations]
        }
    }

    fn on_summary(
        &mut self,
        conversation_id: ConversationId,
        last_message: Option<Message>,
        updated_at: DateTime<Utc>,
    ) -> Vec<ClientCommand> {
        if !self.knows(conversation_id) {
            return vec![ClientCommand::RefetchConversations];
        }
        self.patch_preview(conversation_id, last_message, Some(updated_at));
        Vec::new()
    }

    /// In-place status patch: list position and history order never change.
    fn on_status(
        &mut self,
        message_id: MessageId,
        status: parley_shared::MessageStatus,
        read_by: std::collections::BTreeSet<UserId>,
    ) {
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == message_id) {
            message.status = status;
            message.read_by = read_by.clone();
        }
        for conversation in &mut self.conversations {
            if let Some(preview) = &mut conversation.last_message {
                if preview.id == message_id {
                    preview.status = status;
                    preview.read_by = read_by;
                    break;
                }
            }
        }
    }

    fn on_deleted(&mut self, conversation_id: ConversationId) -> Vec<ClientCommand> {
        self.conversations.retain(|c| c.id != conversation_id);
        self.typing.clear_conversation(conversation_id);

        if self.open == Some(conversation_id) {
            self.open = None;
            self.messages.clear();
            return vec![ClientCommand::Unsubscribe { conversation_id }];
        }
        Vec::new()
    }

    // -- helpers ------------------------------------------------------------

    fn knows(&self, id: ConversationId) -> bool {
        self.conversations.iter().any(|c| c.id == id)
    }

    /// A message needs a read ack when someone else sent it and this user
    /// is not yet in its read set.
    fn needs_ack(&self, message: &Message) -> bool {
        message.sender_id != Some(self.user) && !message.read_by.contains(&self.user)
    }

    fn patch_preview(
        &mut self,
        id: ConversationId,
        last_message: Option<Message>,
        updated_at: Option<DateTime<Utc>>,
    ) {
        if let Some(conversation) = self.conversations.iter_mut().find(|c| c.id == id) {
            if let Some(message) = last_message {
                if updated_at.is_none() {
                    conversation.updated_at = message.timestamp;
                }
                conversation.last_message = Some(message);
            }
            if let Some(updated_at) = updated_at {
                conversation.updated_at = updated_at;
            }
            sort_by_recency(&mut self.conversations);
        }
    }
}

fn sort_by_recency(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use parley_shared::{MessageBody, MessageStatus};

    fn conversation(participants: &[UserId], updated_at: DateTime<Utc>) -> Conversation {
        Conversation {
            id: ConversationId::new(),
            is_group: false,
            name: None,
            participants: participants.iter().copied().collect(),
            admins: BTreeSet::new(),
            created_by: participants[0],
            last_message: None,
            created_at: updated_at,
            updated_at,
        }
    }

    fn text_from(
        sender: UserId,
        conversation_id: ConversationId,
        text: &str,
        at: DateTime<Utc>,
    ) -> Message {
        Message::outgoing(
            conversation_id,
            sender,
            MessageBody::Text {
                text: text.to_string(),
            },
            at,
        )
    }

    #[test]
    fn open_conversation_acks_unread_foreign_messages() {
        let me = UserId::new();
        let peer = UserId::new();
        let now = Utc::now();
        let convo = conversation(&[me, peer], now);

        let mut view = ChatView::new(me);
        view.set_conversations(vec![convo.clone()]);

        let mine = text_from(me, convo.id, "sent earlier", now);
        let unread = text_from(peer, convo.id, "unread", now);
        let mut read = text_from(peer, convo.id, "already read", now);
        read.read_by.insert(me);

        let commands = view.open_conversation(convo.id, vec![mine, read, unread.clone()]);
        assert_eq!(
            commands,
            vec![
                ClientCommand::Subscribe {
                    conversation_id: convo.id
                },
                ClientCommand::AckRead {
                    message_id: unread.id,
                    conversation_id: convo.id
                },
            ]
        );
        assert_eq!(view.messages().len(), 3);
    }

    #[test]
    fn incoming_message_in_open_conversation_is_acked_and_appended() {
        let me = UserId::new();
        let peer = UserId::new();
        let now = Utc::now();
        let convo = conversation(&[me, peer], now);

        let mut view = ChatView::new(me);
        view.set_conversations(vec![convo.clone()]);
        view.open_conversation(convo.id, Vec::new());

        let incoming = text_from(peer, convo.id, "hi", now);
        let commands = view.apply(ServerEvent::MessageReceived(incoming.clone()), now);
        assert_eq!(
            commands,
            vec![ClientCommand::AckRead {
                message_id: incoming.id,
                conversation_id: convo.id
            }]
        );
        assert_eq!(view.messages().len(), 1);

        // The fan-out echo of the same message must not duplicate it, and
        // needs no second ack once we are in the read set.
        let commands = view.apply(ServerEvent::MessageReceived(incoming), now);
        assert_eq!(view.messages().len(), 1);
        assert_eq!(commands.len(), 1); // still unread until the server confirms
    }

    #[test]
    fn own_echo_is_never_acked() {
        let me = UserId::new();
        let peer = UserId::new();
        let now = Utc::now();
        let convo = conversation(&[me, peer], now);

        let mut view = ChatView::new(me);
        view.set_conversations(vec![convo.clone()]);
        view.open_conversation(convo.id, Vec::new());

        let echo = text_from(me, convo.id, "mine", now);
        let commands = view.apply(ServerEvent::MessageReceived(echo), now);
        assert!(commands.is_empty());
        assert_eq!(view.messages().len(), 1);
    }

    #[test]
    fn message_for_background_conversation_resorts_the_list() {
        let me = UserId::new();
        let peer = UserId::new();
        let t0 = Utc::now();
        let older = conversation(&[me, peer], t0 - chrono::Duration::minutes(10));
        let newer = conversation(&[me, peer], t0);

        let mut view = ChatView::new(me);
        view.set_conversations(vec![older.clone(), newer.clone()]);
        assert_eq!(view.conversations()[0].id, newer.id);

        let bump = text_from(peer, older.id, "bump", t0 + chrono::Duration::seconds(1));
        let commands = view.apply(ServerEvent::MessageReceived(bump.clone()), t0);
        assert!(commands.is_empty());
        assert_eq!(view.conversations()[0].id, older.id);
        assert_eq!(
            view.conversations()[0].last_message.as_ref().map(|m| m.id),
            Some(bump.id)
        );
        // No history is loaded for a background conversation.
        assert!(view.messages().is_empty());
    }

    #[test]
    fn unknown_conversation_triggers_refetch() {
        let me = UserId::new();
        let now = Utc::now();
        let mut view = ChatView::new(me);

        let stranger = text_from(UserId::new(), ConversationId::new(), "?", now);
        assert_eq!(
            view.apply(ServerEvent::MessageReceived(stranger), now),
            vec![ClientCommand::RefetchConversations]
        );
        assert_eq!(
            view.apply(
                ServerEvent::ConversationSummaryChanged {
                    conversation_id: ConversationId::new(),
                    last_message: None,
                    updated_at: now,
                },
                now
            ),
            vec![ClientCommand::RefetchConversations]
        );
    }

    #[test]
    fn summary_change_never_touches_open_history() {
        let me = UserId::new();
        let peer = UserId::new();
        let now = Utc::now();
        let convo = conversation(&[me, peer], now);

        let mut view = ChatView::new(me);
        view.set_conversations(vec![convo.clone()]);
        let seed = text_from(peer, convo.id, "seed", now);
        view.open_conversation(convo.id, vec![seed]);

        let note = Message::system(convo.id, "renamed", now + chrono::Duration::seconds(1));
        view.apply(
            ServerEvent::ConversationSummaryChanged {
                conversation_id: convo.id,
                last_message: Some(note),
                updated_at: now + chrono::Duration::seconds(1),
            },
            now,
        );
        assert_eq!(view.messages().len(), 1);
        assert!(view.conversations()[0]
            .last_message
            .as_ref()
            .is_some_and(|m| m.body.is_system()));
    }

    #[test]
    fn status_patch_updates_in_place_without_reorder() {
        let me = UserId::new();
        let peer = UserId::new();
        let now = Utc::now();
        let convo = conversation(&[me, peer], now);

        let mut view = ChatView::new(me);
        let mut listed = convo.clone();
        let sent = text_from(me, convo.id, "ping", now);
        listed.last_message = Some(sent.clone());
        view.set_conversations(vec![listed]);
        view.open_conversation(convo.id, vec![sent.clone()]);

        let read_by: BTreeSet<UserId> = [me, peer].into_iter().collect();
        view.apply(
            ServerEvent::MessageStatusChanged {
                message_id: sent.id,
                status: MessageStatus::Read,
                read_by: read_by.clone(),
            },
            now,
        );

        assert_eq!(view.messages()[0].status, MessageStatus::Read);
        assert_eq!(view.messages()[0].read_by, read_by);
        assert_eq!(
            view.conversations()[0]
                .last_message
                .as_ref()
                .map(|m| m.status),
            Some(MessageStatus::Read)
        );
    }

    #[test]
    fn deleted_conversation_closes_and_unsubscribes() {
        let me = UserId::new();
        let peer = UserId::new();
        let now = Utc::now();
        let convo = conversation(&[me, peer], now);

        let mut view = ChatView::new(me);
        view.set_conversations(vec![convo.clone()]);
        view.open_conversation(convo.id, Vec::new());

        let commands = view.apply(
            ServerEvent::ConversationDeleted {
                conversation_id: convo.id,
            },
            now,
        );
        assert_eq!(
            commands,
            vec![ClientCommand::Unsubscribe {
                conversation_id: convo.id
            }]
        );
        assert!(view.conversations().is_empty());
        assert_eq!(view.open_id(), None);
    }

    #[test]
    fn switching_conversations_unsubscribes_the_previous_room() {
        let me = UserId::new();
        let peer = UserId::new();
        let now = Utc::now();
        let first = conversation(&[me, peer], now);
        let second = conversation(&[me, peer], now);

        let mut view = ChatView::new(me);
        view.set_conversations(vec![first.clone(), second.clone()]);
        view.open_conversation(first.id, Vec::new());

        let commands = view.open_conversation(second.id, Vec::new());
        assert_eq!(
            commands,
            vec![
                ClientCommand::Unsubscribe {
                    conversation_id: first.id
                },
                ClientCommand::Subscribe {
                    conversation_id: second.id
                },
            ]
        );
    }

    #[test]
    fn typing_events_feed_the_tracker() {
        let me = UserId::new();
        let now = Utc::now();
        let convo_id = ConversationId::new();
        let mut view = ChatView::new(me);

        view.apply(
            ServerEvent::PeerTyping {
                conversation_id: convo_id,
                user_name: "bob".to_string(),
            },
            now,
        );
        assert_eq!(view.typing.typists(convo_id, now), vec!["bob"]);

        view.apply(
            ServerEvent::PeerStopTyping {
                conversation_id: convo_id,
                user_name: "bob".to_string(),
            },
            now,
        );
        assert!(view.typing.typists(convo_id, now).is_empty());
    }
}
