//! Message persistence: append, history fetch, and per-message read state.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use parley_shared::{
    Conversation, ConversationId, Message, MessageBody, MessageId, MessageStatus, UserId,
};

use crate::conversations::conversation_by_id;
use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Persist a message, set it as the conversation's last message and
    /// bump `updated_at`.  One transaction; concurrent appends to the same
    /// conversation serialize on the connection.
    ///
    /// Returns the updated, fully expanded conversation.
    pub fn append_message(&mut self, message: &Message) -> Result<Conversation> {
        message.body.validate()?;

        let tx = self.conn_mut().transaction()?;

        let conversation = conversation_by_id(&tx, message.conversation_id)?;
        if let Some(sender) = message.sender_id {
            if !conversation.is_participant(sender) {
                return Err(StoreError::NotParticipant);
            }
        }

        insert_message_row(&tx, message)?;
        touch_conversation(&tx, message.conversation_id, message.id, message.timestamp)?;

        let updated = conversation_by_id(&tx, message.conversation_id)?;
        tx.commit()?;

        tracing::debug!(
            message = %message.id,
            conversation = %message.conversation_id,
            kind = message.body.kind(),
            "message appended"
        );

        Ok(updated)
    }

    /// Full history for a conversation, oldest first (timestamp ascending,
    /// id ascending on ties).
    pub fn messages_for_conversation(&self, id: ConversationId) -> Result<Vec<Message>> {
        // Distinguishes an empty conversation from a deleted one.
        let _ = conversation_by_id(self.conn(), id)?;

        let mut stmt = self.conn().prepare(
            "SELECT id, conversation_id, sender_id, content, status, timestamp
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY timestamp ASC, id ASC",
        )?;

        let rows = stmt.query_map(params![id.to_string()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            let mut message = row?;
            message.read_by = reads_for_message(self.conn(), message.id)?;
            messages.push(message);
        }
        Ok(messages)
    }

    /// Fetch a single message with its read set.
    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        message_by_id(self.conn(), id)
    }

    /// Record that `reader` has read the message.  Idempotent: the read set
    /// is a union, and `status` only ever moves forward (`read` is reached
    /// for 1:1 conversations when someone other than the sender reads).
    ///
    /// Returns the updated message if anything changed, `None` on a
    /// redundant call.
    pub fn mark_read(
        &mut self,
        message_id: MessageId,
        reader: UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        let tx = self.conn_mut().transaction()?;

        let mut message = message_by_id(&tx, message_id)?;
        let mut changed = false;

        if message.read_by.insert(reader) {
            tx.execute(
                "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
                 VALUES (?1, ?2, ?3)",
                params![message_id.to_string(), reader.to_string(), now.to_rfc3339()],
            )?;
            changed = true;
        }

        if message.sender_id != Some(reader) && message.status < MessageStatus::Read {
            let conversation = conversation_by_id(&tx, message.conversation_id)?;
            if !conversation.is_group {
                message.status = MessageStatus::Read;
                tx.execute(
                    "UPDATE messages SET status = ?2 WHERE id = ?1",
                    params![message_id.to_string(), message.status.as_str()],
                )?;
                changed = true;
            }
        }

        tx.commit()?;

        Ok(changed.then_some(message))
    }
}

// ---------------------------------------------------------------------------
// Helpers shared with the conversations / membership modules
// ---------------------------------------------------------------------------

/// Insert the message row plus its initial read rows.  Caller owns the
/// transaction.
pub(crate) fn insert_message_row(conn: &Connection, message: &Message) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (id, conversation_id, sender_id, kind, content, status, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            message.id.to_string(),
            message.conversation_id.to_string(),
            message.sender_id.map(|s| s.to_string()),
            message.body.kind(),
            serde_json::to_string(&message.body)?,
            message.status.as_str(),
            message.timestamp.to_rfc3339(),
        ],
    )?;

    for reader in &message.read_by {
        conn.execute(
            "INSERT INTO message_reads (message_id, user_id, read_at) VALUES (?1, ?2, ?3)",
            params![
                message.id.to_string(),
                reader.to_string(),
                message.timestamp.to_rfc3339()
            ],
        )?;
    }

    Ok(())
}

/// Point the conversation at its new last message and bump `updated_at`.
pub(crate) fn touch_conversation(
    conn: &Connection,
    id: ConversationId,
    last_message: MessageId,
    at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET last_message_id = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), last_message.to_string(), at.to_rfc3339()],
    )?;
    Ok(())
}

pub(crate) fn message_by_id(conn: &Connection, id: MessageId) -> Result<Message> {
    let mut message = conn
        .query_row(
            "SELECT id, conversation_id, sender_id, content, status, timestamp
             FROM messages WHERE id = ?1",
            params![id.to_string()],
            row_to_message,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            other => StoreError::Sqlite(other),
        })?;
    message.read_by = reads_for_message(conn, id)?;
    Ok(message)
}

pub(crate) fn maybe_message_by_id(
    conn: &Connection,
    id: Option<MessageId>,
) -> Result<Option<Message>> {
    match id {
        Some(id) => match message_by_id(conn, id) {
            Ok(message) => Ok(Some(message)),
            // Last-message pointer can dangle briefly if a message is purged.
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e),
        },
        None => Ok(None),
    }
}

fn reads_for_message(conn: &Connection, id: MessageId) -> Result<BTreeSet<UserId>> {
    let mut stmt =
        conn.prepare("SELECT user_id FROM message_reads WHERE message_id = ?1")?;
    let rows = stmt.query_map(params![id.to_string()], |row| row.get::<_, String>(0))?;

    let mut readers = BTreeSet::new();
    for row in rows {
        readers.insert(UserId(Uuid::parse_str(&row?)?));
    }
    Ok(readers)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let conversation_str: String = row.get(1)?;
    let sender_str: Option<String> = row.get(2)?;
    let content: String = row.get(3)?;
    let status_str: String = row.get(4)?;
    let ts_str: String = row.get(5)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let conversation_id = Uuid::parse_str(&conversation_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let sender_id = sender_str
        .map(|s| Uuid::parse_str(&s))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;

    let body: MessageBody = serde_json::from_str(&content).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let status = MessageStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown message status: {status_str}").into(),
        )
    })?;

    let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Message {
        id: MessageId(id),
        conversation_id: ConversationId(conversation_id),
        sender_id: sender_id.map(UserId),
        body,
        status,
        read_by: BTreeSet::new(),
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{direct_pair, test_user};
    use parley_shared::MessageBody;

    #[test]
    fn append_sets_last_message_and_bumps_updated_at() {
        let (mut db, a, b) = direct_pair();
        let conv = db.access_or_create_direct(a, b, Utc::now()).unwrap();
        let before = conv.updated_at;

        let msg = Message::outgoing(
            conv.id,
            a,
            MessageBody::Text {
                text: "hi".to_string(),
            },
            before + chrono::Duration::seconds(5),
        );
        let updated = db.append_message(&msg).unwrap();

        assert_eq!(updated.last_message.as_ref().unwrap().id, msg.id);
        assert!(updated.updated_at > before);
    }

    #[test]
    fn append_rejects_non_participant_sender() {
        let (mut db, a, b) = direct_pair();
        let conv = db.access_or_create_direct(a, b, Utc::now()).unwrap();

        let outsider = test_user("mallory");
        db.upsert_user(&outsider).unwrap();

        let msg = Message::outgoing(
            conv.id,
            outsider.id,
            MessageBody::Text {
                text: "hi".to_string(),
            },
            Utc::now(),
        );
        assert!(matches!(
            db.append_message(&msg),
            Err(StoreError::NotParticipant)
        ));
    }

    #[test]
    fn append_rejects_invalid_content() {
        let (mut db, a, b) = direct_pair();
        let conv = db.access_or_create_direct(a, b, Utc::now()).unwrap();

        let msg = Message::outgoing(
            conv.id,
            a,
            MessageBody::Text {
                text: "  ".to_string(),
            },
            Utc::now(),
        );
        assert!(matches!(
            db.append_message(&msg),
            Err(StoreError::InvalidContent(_))
        ));
    }

    #[test]
    fn history_is_ordered_oldest_first() {
        let (mut db, a, b) = direct_pair();
        let t0 = Utc::now();
        let conv = db.access_or_create_direct(a, b, t0).unwrap();

        for i in 0..3 {
            let msg = Message::outgoing(
                conv.id,
                if i % 2 == 0 { a } else { b },
                MessageBody::Text {
                    text: format!("m{i}"),
                },
                t0 + chrono::Duration::seconds(i),
            );
            db.append_message(&msg).unwrap();
        }

        let history = db.messages_for_conversation(conv.id).unwrap();
        let texts: Vec<_> = history
            .iter()
            .map(|m| match &m.body {
                MessageBody::Text { text } => text.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(texts, vec!["m0", "m1", "m2"]);
    }

    #[test]
    fn mark_read_is_idempotent_and_flips_status_for_direct() {
        let (mut db, a, b) = direct_pair();
        let conv = db.access_or_create_direct(a, b, Utc::now()).unwrap();

        let msg = Message::outgoing(
            conv.id,
            a,
            MessageBody::Text {
                text: "hi".to_string(),
            },
            Utc::now(),
        );
        db.append_message(&msg).unwrap();

        let first = db.mark_read(msg.id, b, Utc::now()).unwrap().unwrap();
        assert_eq!(first.status, MessageStatus::Read);
        assert!(first.read_by.contains(&a) && first.read_by.contains(&b));

        // Second identical call is a no-op, not an error.
        assert!(db.mark_read(msg.id, b, Utc::now()).unwrap().is_none());

        let stored = db.get_message(msg.id).unwrap();
        assert_eq!(stored, first);
    }

    #[test]
    fn sender_self_read_does_not_change_status() {
        let (mut db, a, b) = direct_pair();
        let conv = db.access_or_create_direct(a, b, Utc::now()).unwrap();

        let msg = Message::outgoing(
            conv.id,
            a,
            MessageBody::Text {
                text: "hi".to_string(),
            },
            Utc::now(),
        );
        db.append_message(&msg).unwrap();

        // The sender is already in read_by and cannot flip the status.
        assert!(db.mark_read(msg.id, a, Utc::now()).unwrap().is_none());
        assert_eq!(db.get_message(msg.id).unwrap().status, MessageStatus::Sent);
    }

    #[test]
    fn group_read_updates_read_by_but_not_status() {
        let mut db = Database::open_in_memory().unwrap();
        let (a, b, c) = (test_user("a"), test_user("b"), test_user("c"));
        for u in [&a, &b, &c] {
            db.upsert_user(u).unwrap();
        }
        let conv = db
            .create_group("trio", a.id, &[b.id, c.id], Utc::now())
            .unwrap();

        let msg = Message::outgoing(
            conv.id,
            a.id,
            MessageBody::Text {
                text: "hi".to_string(),
            },
            Utc::now(),
        );
        db.append_message(&msg).unwrap();

        let updated = db.mark_read(msg.id, b.id, Utc::now()).unwrap().unwrap();
        assert_eq!(updated.status, MessageStatus::Sent);
        assert!(updated.read_by.contains(&b.id));
    }
}
