//! Core chat engine: validated writes plus live fan-out.
//!
//! Every mutation follows the same shape: acquire the conversation lock,
//! apply the change through the store, then multicast the resulting
//! events to every connection of every participant — whether or not they
//! have the conversation open.  Lock order is always conversation lock
//! first, database lock second.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;

use parley_shared::{
    ConnectionId, Conversation, ConversationId, Message, MessageBody, MessageId, ServerEvent,
    User, UserId,
};
use parley_store::{Database, MembershipOutcome, StoreError};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hub::Hub;
use crate::locks::ConversationLocks;
use crate::presence::{PresenceTracker, PresenceTransition};

type Result<T> = std::result::Result<T, ServerError>;

/// Outcome of a membership mutation.  Deleting an emptied group is a
/// normal terminal transition, so it is a success value, not an error.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum MembershipChange {
    Updated(Conversation),
    #[serde(rename_all = "camelCase")]
    Deleted { deleted_conversation_id: ConversationId },
}

pub struct ChatEngine {
    db: Mutex<Database>,
    pub hub: Hub,
    pub presence: PresenceTracker,
    pub config: ServerConfig,
    locks: ConversationLocks,
}

impl ChatEngine {
    pub fn new(db: Database, config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            db: Mutex::new(db),
            hub: Hub::new(),
            presence: PresenceTracker::new(),
            config,
            locks: ConversationLocks::new(),
        })
    }

    // -- presence -----------------------------------------------------------

    /// Bind a connection to its announced user and persist the snapshot on
    /// an offline→online edge.  A missing user row is logged, not fatal:
    /// the live session still works, only the snapshot is skipped.
    pub async fn presence_hello(&self, user: UserId, connection: ConnectionId) {
        for transition in self.presence.connection_opened(user, connection).await {
            let (user, online) = match transition {
                PresenceTransition::Online(user) => (user, true),
                PresenceTransition::Offline(user) => (user, false),
            };
            let db = self.db.lock().await;
            if let Err(err) = db.set_user_presence(user, online, Utc::now()) {
                tracing::warn!(%user, online, %err, "failed to persist presence snapshot");
            }
        }
    }

    /// Tear down a connection: clear presence (persisting last-seen on the
    /// last disconnect) and detach it from the hub.
    pub async fn connection_closed(&self, connection: ConnectionId) {
        if let Some(PresenceTransition::Offline(user)) =
            self.presence.connection_closed(connection).await
        {
            let db = self.db.lock().await;
            if let Err(err) = db.set_user_presence(user, false, Utc::now()) {
                tracing::warn!(%user, %err, "failed to persist last-seen snapshot");
            }
        }
        self.hub.detach(connection).await;
    }

    // -- messages -----------------------------------------------------------

    /// Persist and fan out one user message.  Persistence strictly precedes
    /// fan-out, so a delivered message is always durable.
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        sender: UserId,
        body: MessageBody,
    ) -> Result<Message> {
        if body.is_system() {
            return Err(ServerError::BadRequest(
                "system messages cannot be sent by clients".to_string(),
            ));
        }

        let _guard = self.locks.acquire(conversation_id).await;

        let message = Message::outgoing(conversation_id, sender, body, Utc::now());
        let conversation = {
            let mut db = self.db.lock().await;
            db.append_message(&message)?
        };

        let audience = self
            .presence
            .connections_for_all(&conversation.participants)
            .await;
        self.hub
            .multicast(&audience, ServerEvent::MessageReceived(message.clone()))
            .await;
        self.hub
            .multicast(&audience, summary_event(&conversation))
            .await;

        tracing::debug!(
            conversation = %conversation_id,
            message = %message.id,
            recipients = audience.len(),
            "message fanned out"
        );
        Ok(message)
    }

    /// Record a read acknowledgement.  Status/read-set updates fan out to
    /// all participants, but only when something actually changed;
    /// duplicate acks are silent.
    pub async fn mark_read(
        &self,
        message_id: MessageId,
        conversation_id: ConversationId,
        reader: UserId,
    ) -> Result<()> {
        let _guard = self.locks.acquire(conversation_id).await;

        let (updated, conversation) = {
            let mut db = self.db.lock().await;
            let message = db.get_message(message_id)?;
            if message.conversation_id != conversation_id {
                return Err(ServerError::BadRequest(
                    "message does not belong to that conversation".to_string(),
                ));
            }
            let conversation = db.get_conversation(conversation_id)?;
            if !conversation.is_participant(reader) {
                return Err(StoreError::NotParticipant.into());
            }
            (db.mark_read(message_id, reader, Utc::now())?, conversation)
        };

        if let Some(message) = updated {
            let audience = self
                .presence
                .connections_for_all(&conversation.participants)
                .await;
            self.hub
                .multicast(
                    &audience,
                    ServerEvent::MessageStatusChanged {
                        message_id: message.id,
                        status: message.status,
                        read_by: message.read_by,
                    },
                )
                .await;
        }
        Ok(())
    }

    pub async fn messages_for_conversation(
        &self,
        actor: UserId,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>> {
        let db = self.db.lock().await;
        let conversation = db.get_conversation(conversation_id)?;
        if !conversation.is_participant(actor) {
            return Err(StoreError::NotParticipant.into());
        }
        Ok(db.messages_for_conversation(conversation_id)?)
    }

    // -- users --------------------------------------------------------------

    /// Mirror a profile snapshot from the auth gateway.
    pub async fn upsert_user(&self, user: &User) -> Result<()> {
        let db = self.db.lock().await;
        Ok(db.upsert_user(user)?)
    }

    // -- conversations ------------------------------------------------------

    pub async fn conversations_for_user(&self, user: UserId) -> Result<Vec<Conversation>> {
        let db = self.db.lock().await;
        Ok(db.conversations_for_user(user)?)
    }

    /// Open (or lazily create) the 1:1 conversation between `actor` and
    /// `peer`.  Idempotent; no fan-out, the peer learns about it with the
    /// first message.
    pub async fn open_direct(&self, actor: UserId, peer: UserId) -> Result<Conversation> {
        let mut db = self.db.lock().await;
        Ok(db.access_or_create_direct(actor, peer, Utc::now())?)
    }

    /// Create a group and push its initial summary to every member, so
    /// added members see it without refetching.
    pub async fn create_group(
        &self,
        creator: UserId,
        name: &str,
        members: &[UserId],
    ) -> Result<Conversation> {
        let conversation = {
            let mut db = self.db.lock().await;
            db.create_group(name, creator, members, Utc::now())?
        };

        let audience = self
            .presence
            .connections_for_all(&conversation.participants)
            .await;
        self.hub
            .multicast(&audience, summary_event(&conversation))
            .await;
        Ok(conversation)
    }

    pub async fn rename_group(
        &self,
        actor: UserId,
        conversation_id: ConversationId,
        new_name: &str,
    ) -> Result<Conversation> {
        let _guard = self.locks.acquire(conversation_id).await;

        let conversation = {
            let mut db = self.db.lock().await;
            db.rename_group(actor, conversation_id, new_name, Utc::now())?
        };

        let audience = self
            .presence
            .connections_for_all(&conversation.participants)
            .await;
        if let Some(note) = &conversation.last_message {
            self.hub
                .multicast(&audience, ServerEvent::MessageReceived(note.clone()))
                .await;
        }
        self.hub
            .multicast(&audience, summary_event(&conversation))
            .await;
        Ok(conversation)
    }

    // -- group membership ---------------------------------------------------

    pub async fn add_member(
        &self,
        actor: UserId,
        conversation_id: ConversationId,
        target: UserId,
    ) -> Result<MembershipChange> {
        self.membership_change(conversation_id, target, |db| {
            db.add_member(actor, conversation_id, target, Utc::now())
        })
        .await
    }

    pub async fn remove_member(
        &self,
        actor: UserId,
        conversation_id: ConversationId,
        target: UserId,
    ) -> Result<MembershipChange> {
        self.membership_change(conversation_id, target, |db| {
            db.remove_member(actor, conversation_id, target, Utc::now())
        })
        .await
    }

    pub async fn promote_admin(
        &self,
        actor: UserId,
        conversation_id: ConversationId,
        target: UserId,
    ) -> Result<MembershipChange> {
        self.membership_change(conversation_id, target, |db| {
            db.promote(actor, conversation_id, target, Utc::now())
        })
        .await
    }

    pub async fn demote_admin(
        &self,
        actor: UserId,
        conversation_id: ConversationId,
        target: UserId,
    ) -> Result<MembershipChange> {
        self.membership_change(conversation_id, target, |db| {
            db.demote(actor, conversation_id, target, Utc::now())
        })
        .await
    }

    /// Shared fan-out path for membership transitions.  The audience is the
    /// post-change participant set plus the target, so a removed member
    /// still hears about their own removal.
    async fn membership_change(
        &self,
        conversation_id: ConversationId,
        target: UserId,
        apply: impl FnOnce(&mut Database) -> parley_store::Result<MembershipOutcome>,
    ) -> Result<MembershipChange> {
        let _guard = self.locks.acquire(conversation_id).await;

        let outcome = {
            let mut db = self.db.lock().await;
            apply(&mut db)?
        };

        match outcome {
            MembershipOutcome::Updated {
                conversation,
                system_messages,
            } => {
                let mut audience_users: BTreeSet<UserId> =
                    conversation.participants.iter().copied().collect();
                audience_users.insert(target);
                let audience = self.presence.connections_for_all(&audience_users).await;

                for note in &system_messages {
                    self.hub
                        .multicast(&audience, ServerEvent::MessageReceived(note.clone()))
                        .await;
                }
                self.hub
                    .multicast(&audience, summary_event(&conversation))
                    .await;
                Ok(MembershipChange::Updated(conversation))
            }
            MembershipOutcome::Deleted {
                conversation_id,
                former_participants,
            } => {
                let audience = self.presence.connections_for_all(&former_participants).await;
                self.hub
                    .multicast(&audience, ServerEvent::ConversationDeleted { conversation_id })
                    .await;
                Ok(MembershipChange::Deleted {
                    deleted_conversation_id: conversation_id,
                })
            }
        }
    }
}

fn summary_event(conversation: &Conversation) -> ServerEvent {
    ServerEvent::ConversationSummaryChanged {
        conversation_id: conversation.id,
        last_message: conversation.last_message.clone(),
        updated_at: conversation.updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with_users(names: &[&str]) -> (Arc<ChatEngine>, Vec<UserId>) {
        let db = Database::open_in_memory().unwrap();
        let ids: Vec<UserId> = names
            .iter()
            .map(|name| {
                let user = User {
                    id: UserId::new(),
                    display_name: name.to_string(),
                    avatar_url: None,
                    online: false,
                    last_seen: Utc::now(),
                };
                db.upsert_user(&user).unwrap();
                user.id
            })
            .collect();
        (ChatEngine::new(db, ServerConfig::default()), ids)
    }

    async fn attach(engine: &ChatEngine, user: UserId) -> (ConnectionId, tokio::sync::mpsc::UnboundedReceiver<ServerEvent>) {
        let connection = ConnectionId::new();
        let rx = engine.hub.attach(connection).await;
        engine.presence_hello(user, connection).await;
        (connection, rx)
    }

    fn text(s: &str) -> MessageBody {
        MessageBody::Text {
            text: s.to_string(),
        }
    }

    #[tokio::test]
    async fn send_fans_out_to_every_connection_of_every_participant() {
        let (engine, ids) = engine_with_users(&["alice", "bob"]);
        let (alice, bob) = (ids[0], ids[1]);
        let conversation = engine.open_direct(alice, bob).await.unwrap();

        let (_ca, mut alice_rx) = attach(&engine, alice).await;
        let (_cb1, mut bob_rx1) = attach(&engine, bob).await;
        let (_cb2, mut bob_rx2) = attach(&engine, bob).await;

        let sent = engine
            .send_message(conversation.id, alice, text("hello"))
            .await
            .unwrap();

        for rx in [&mut alice_rx, &mut bob_rx1, &mut bob_rx2] {
            match rx.try_recv().unwrap() {
                ServerEvent::MessageReceived(message) => assert_eq!(message.id, sent.id),
                other => panic!("expected messageReceived, got {other:?}"),
            }
            match rx.try_recv().unwrap() {
                ServerEvent::ConversationSummaryChanged { conversation_id, .. } => {
                    assert_eq!(conversation_id, conversation.id)
                }
                other => panic!("expected summary, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn fan_out_preserves_append_order_under_concurrent_sends() {
        let (engine, ids) = engine_with_users(&["alice", "bob"]);
        let (alice, bob) = (ids[0], ids[1]);
        let conversation = engine.open_direct(alice, bob).await.unwrap();
        let (_cb, mut bob_rx) = attach(&engine, bob).await;

        let mut tasks = Vec::new();
        for i in 0..8 {
            let engine = Arc::clone(&engine);
            let id = conversation.id;
            tasks.push(tokio::spawn(async move {
                engine
                    .send_message(id, alice, text(&format!("m{i}")))
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Whatever order the senders won the lock in, every receiver must
        // drain the messages in exactly the persisted history order.
        let history: Vec<MessageId> = engine
            .messages_for_conversation(bob, conversation.id)
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(history.len(), 8);

        let mut delivered = Vec::new();
        while let Ok(event) = bob_rx.try_recv() {
            if let ServerEvent::MessageReceived(message) = event {
                delivered.push(message.id);
            }
        }
        assert_eq!(delivered, history);
    }

    #[tokio::test]
    async fn offline_participant_catches_up_from_history() {
        let (engine, ids) = engine_with_users(&["alice", "bob"]);
        let (alice, bob) = (ids[0], ids[1]);
        let conversation = engine.open_direct(alice, bob).await.unwrap();

        // Bob is offline while Alice sends.
        let (_ca, _alice_rx) = attach(&engine, alice).await;
        engine
            .send_message(conversation.id, alice, text("while you were out"))
            .await
            .unwrap();

        // Bob reconnects: no live event replay, the history has the message.
        let (_cb, mut bob_rx) = attach(&engine, bob).await;
        assert!(bob_rx.try_recv().is_err());
        let history = engine
            .messages_for_conversation(bob, conversation.id)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].body, text("while you were out"));
    }

    #[tokio::test]
    async fn reconnecting_reader_completes_the_receipt_loop() {
        let (engine, ids) = engine_with_users(&["alice", "bob"]);
        let (alice, bob) = (ids[0], ids[1]);
        let conversation = engine.open_direct(alice, bob).await.unwrap();

        // Bob is offline; Alice sends and stays connected.
        let (_ca, mut alice_rx) = attach(&engine, alice).await;
        let sent = engine
            .send_message(conversation.id, alice, text("are you there?"))
            .await
            .unwrap();
        while alice_rx.try_recv().is_ok() {}

        // Bob reconnects and sees the message as the unread preview.
        let (_cb, _bob_rx) = attach(&engine, bob).await;
        let listed = engine.conversations_for_user(bob).await.unwrap();
        let preview = listed[0].last_message.as_ref().unwrap();
        assert_eq!(preview.id, sent.id);
        assert_eq!(preview.status, parley_shared::MessageStatus::Sent);
        assert!(!preview.read_by.contains(&bob));

        // His read ack closes the loop on Alice's side.
        engine.mark_read(sent.id, conversation.id, bob).await.unwrap();
        match alice_rx.try_recv().unwrap() {
            ServerEvent::MessageStatusChanged {
                message_id, status, ..
            } => {
                assert_eq!(message_id, sent.id);
                assert_eq!(status, parley_shared::MessageStatus::Read);
            }
            other => panic!("expected statusChanged, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_read_ack_is_silent() {
        let (engine, ids) = engine_with_users(&["alice", "bob"]);
        let (alice, bob) = (ids[0], ids[1]);
        let conversation = engine.open_direct(alice, bob).await.unwrap();
        let message = engine
            .send_message(conversation.id, alice, text("ping"))
            .await
            .unwrap();

        let (_ca, mut alice_rx) = attach(&engine, alice).await;

        engine.mark_read(message.id, conversation.id, bob).await.unwrap();
        match alice_rx.try_recv().unwrap() {
            ServerEvent::MessageStatusChanged { status, read_by, .. } => {
                assert_eq!(status, parley_shared::MessageStatus::Read);
                assert!(read_by.contains(&bob));
            }
            other => panic!("expected statusChanged, got {other:?}"),
        }

        // Same ack again: nothing changes, nothing is pushed.
        engine.mark_read(message.id, conversation.id, bob).await.unwrap();
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn read_ack_rejects_conversation_mismatch() {
        let (engine, ids) = engine_with_users(&["alice", "bob", "carol"]);
        let (alice, bob, carol) = (ids[0], ids[1], ids[2]);
        let direct = engine.open_direct(alice, bob).await.unwrap();
        let other = engine.open_direct(alice, carol).await.unwrap();
        let message = engine
            .send_message(direct.id, alice, text("ping"))
            .await
            .unwrap();

        let err = engine
            .mark_read(message.id, other.id, alice)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::BadRequest(_)));
    }

    #[tokio::test]
    async fn client_cannot_send_system_messages() {
        let (engine, ids) = engine_with_users(&["alice", "bob"]);
        let conversation = engine.open_direct(ids[0], ids[1]).await.unwrap();

        let err = engine
            .send_message(
                conversation.id,
                ids[0],
                MessageBody::System {
                    text: "fake".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::BadRequest(_)));
    }

    #[tokio::test]
    async fn removed_member_hears_their_own_removal() {
        let (engine, ids) = engine_with_users(&["alice", "bob", "carol"]);
        let (alice, bob, carol) = (ids[0], ids[1], ids[2]);
        let group = engine
            .create_group(alice, "plans", &[bob, carol])
            .await
            .unwrap();

        let (_cb, mut bob_rx) = attach(&engine, bob).await;

        engine.remove_member(alice, group.id, bob).await.unwrap();

        // Bob (no longer a participant) still receives the system message
        // and the summary.
        match bob_rx.try_recv().unwrap() {
            ServerEvent::MessageReceived(message) => assert!(message.body.is_system()),
            other => panic!("expected system message, got {other:?}"),
        }
        assert!(matches!(
            bob_rx.try_recv().unwrap(),
            ServerEvent::ConversationSummaryChanged { .. }
        ));
    }

    #[tokio::test]
    async fn emptied_group_fans_out_deletion() {
        let (engine, ids) = engine_with_users(&["alice", "bob"]);
        let (alice, bob) = (ids[0], ids[1]);
        let group = engine.create_group(alice, "brief", &[bob]).await.unwrap();

        let (_ca, mut alice_rx) = attach(&engine, alice).await;
        engine.remove_member(alice, group.id, bob).await.unwrap();
        // Drain the removal events before the final leave.
        while alice_rx.try_recv().is_ok() {}

        // The leave that empties the group is a successful terminal
        // transition, never an error for the leaver.
        let change = engine.remove_member(alice, group.id, alice).await.unwrap();
        assert!(matches!(
            change,
            MembershipChange::Deleted { deleted_conversation_id } if deleted_conversation_id == group.id
        ));
        assert!(engine
            .conversations_for_user(alice)
            .await
            .unwrap()
            .is_empty());
        match alice_rx.try_recv().unwrap() {
            ServerEvent::ConversationDeleted { conversation_id } => {
                assert_eq!(conversation_id, group.id)
            }
            other => panic!("expected deletedConversation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn presence_transitions_are_persisted() {
        let (engine, ids) = engine_with_users(&["alice"]);
        let alice = ids[0];

        let (connection, _rx) = attach(&engine, alice).await;
        {
            let db = engine.db.lock().await;
            assert!(db.get_user(alice).unwrap().online);
        }

        engine.connection_closed(connection).await;
        {
            let db = engine.db.lock().await;
            assert!(!db.get_user(alice).unwrap().online);
        }
    }
}
