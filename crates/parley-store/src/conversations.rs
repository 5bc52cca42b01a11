//! Conversation CRUD: direct-chat access, group creation, per-user listing.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use parley_shared::{Conversation, ConversationId, Message, MessageId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::messages::{insert_message_row, maybe_message_by_id, touch_conversation};
use crate::users::display_name_or_id;

impl Database {
    /// Return the unique direct conversation between `a` and `b`, creating
    /// it if absent.  Symmetric and idempotent: any argument order yields
    /// the same conversation.
    ///
    /// The lookup is exact-set over the members table, so a group that
    /// happens to contain both users never collides.
    pub fn access_or_create_direct(
        &mut self,
        a: UserId,
        b: UserId,
        now: DateTime<Utc>,
    ) -> Result<Conversation> {
        if a == b {
            return Err(StoreError::SelfConversation);
        }

        let tx = self.conn_mut().transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT c.id
                 FROM conversations c
                 JOIN conversation_members m ON m.conversation_id = c.id
                 WHERE c.is_group = 0
                 GROUP BY c.id
                 HAVING COUNT(*) = 2
                    AND SUM(CASE WHEN m.user_id IN (?1, ?2) THEN 1 ELSE 0 END) = 2",
                params![a.to_string(), b.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        let id = match existing {
            Some(id_str) => ConversationId(Uuid::parse_str(&id_str)?),
            None => {
                let id = ConversationId::new();
                tx.execute(
                    "INSERT INTO conversations
                         (id, is_group, name, created_by, last_message_id, created_at, updated_at)
                     VALUES (?1, 0, NULL, ?2, NULL, ?3, ?3)",
                    params![id.to_string(), a.to_string(), now.to_rfc3339()],
                )?;
                for user in [a, b] {
                    tx.execute(
                        "INSERT INTO conversation_members
                             (conversation_id, user_id, is_admin, joined_at)
                         VALUES (?1, ?2, 0, ?3)",
                        params![id.to_string(), user.to_string(), now.to_rfc3339()],
                    )?;
                }
                tracing::debug!(conversation = %id, "created direct conversation");
                id
            }
        };

        let conversation = conversation_by_id(&tx, id)?;
        tx.commit()?;
        Ok(conversation)
    }

    /// Create a group conversation.  The creator always joins and is the
    /// sole initial admin; a "created the group" system message is recorded
    /// in the same transaction.
    pub fn create_group(
        &mut self,
        name: &str,
        creator: UserId,
        member_ids: &[UserId],
        now: DateTime<Utc>,
    ) -> Result<Conversation> {
        let mut participants: BTreeSet<UserId> = member_ids.iter().copied().collect();
        participants.insert(creator);
        if participants.len() < 2 {
            return Err(StoreError::InvalidGroup(
                "a group needs at least 2 participants".to_string(),
            ));
        }

        let tx = self.conn_mut().transaction()?;

        let id = ConversationId::new();
        tx.execute(
            "INSERT INTO conversations
                 (id, is_group, name, created_by, last_message_id, created_at, updated_at)
             VALUES (?1, 1, ?2, ?3, NULL, ?4, ?4)",
            params![id.to_string(), name, creator.to_string(), now.to_rfc3339()],
        )?;

        for user in &participants {
            tx.execute(
                "INSERT INTO conversation_members
                     (conversation_id, user_id, is_admin, joined_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    id.to_string(),
                    user.to_string(),
                    *user == creator,
                    now.to_rfc3339()
                ],
            )?;
        }

        let note = format!(
            "{} created the group \"{}\"",
            display_name_or_id(&tx, creator),
            name
        );
        let system = Message::system(id, note, now);
        insert_message_row(&tx, &system)?;
        touch_conversation(&tx, id, system.id, now)?;

        let conversation = conversation_by_id(&tx, id)?;
        tx.commit()?;

        tracing::info!(conversation = %id, name, "created group");
        Ok(conversation)
    }

    /// All conversations the user participates in, most recently updated
    /// first.  Ties break by id ascending so the ordering is deterministic.
    pub fn conversations_for_user(&self, user: UserId) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(
            "SELECT c.id
             FROM conversations c
             JOIN conversation_members m ON m.conversation_id = c.id
             WHERE m.user_id = ?1
             ORDER BY c.updated_at DESC, c.id ASC",
        )?;

        let rows = stmt.query_map(params![user.to_string()], |row| row.get::<_, String>(0))?;

        let mut conversations = Vec::new();
        for row in rows {
            let id = ConversationId(Uuid::parse_str(&row?)?);
            conversations.push(conversation_by_id(self.conn(), id)?);
        }
        Ok(conversations)
    }

    /// Fetch a single conversation, fully expanded.
    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        conversation_by_id(self.conn(), id)
    }

    /// Rename a group.  Admin-only; records a system message and bumps
    /// `updated_at`.
    pub fn rename_group(
        &mut self,
        actor: UserId,
        id: ConversationId,
        new_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Conversation> {
        let tx = self.conn_mut().transaction()?;

        let conversation = conversation_by_id(&tx, id)?;
        if !conversation.is_group {
            return Err(StoreError::NotAGroup);
        }
        if !conversation.is_admin(actor) {
            return Err(StoreError::NotAuthorized);
        }

        tx.execute(
            "UPDATE conversations SET name = ?2 WHERE id = ?1",
            params![id.to_string(), new_name],
        )?;

        let note = format!(
            "{} renamed the group to \"{}\"",
            display_name_or_id(&tx, actor),
            new_name
        );
        let system = Message::system(id, note, now);
        insert_message_row(&tx, &system)?;
        touch_conversation(&tx, id, system.id, now)?;

        let updated = conversation_by_id(&tx, id)?;
        tx.commit()?;
        Ok(updated)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Load and expand a conversation (participants, admins, last message).
/// Works both inside and outside a transaction.
pub(crate) fn conversation_by_id(conn: &Connection, id: ConversationId) -> Result<Conversation> {
    let row = conn
        .query_row(
            "SELECT id, is_group, name, created_by, last_message_id, created_at, updated_at
             FROM conversations WHERE id = ?1",
            params![id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            other => StoreError::Sqlite(other),
        })?;

    let (id_str, is_group, name, created_by_str, last_message_str, created_str, updated_str) = row;

    let mut participants = BTreeSet::new();
    let mut admins = BTreeSet::new();
    {
        let mut stmt = conn.prepare(
            "SELECT user_id, is_admin FROM conversation_members WHERE conversation_id = ?1",
        )?;
        let rows = stmt.query_map(params![id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?))
        })?;
        for row in rows {
            let (user_str, is_admin) = row?;
            let user = UserId(Uuid::parse_str(&user_str)?);
            participants.insert(user);
            if is_admin {
                admins.insert(user);
            }
        }
    }

    let last_message_id = last_message_str
        .map(|s| Uuid::parse_str(&s).map(MessageId))
        .transpose()?;
    let last_message = maybe_message_by_id(conn, last_message_id)?;

    Ok(Conversation {
        id: ConversationId(Uuid::parse_str(&id_str)?),
        is_group,
        name,
        participants,
        admins,
        created_by: UserId(Uuid::parse_str(&created_by_str)?),
        last_message,
        created_at: parse_ts(&created_str)?,
        updated_at: parse_ts(&updated_str)?,
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}
