//! Group-membership state machine.
//!
//! Every membership mutation (add / remove / promote / demote) lives here
//! and nowhere else, so the core invariant — a group with remaining
//! participants always has at least one admin — is enforced in a single
//! place.  Each transition is one SQL transaction: the membership change,
//! any auto-promotion, the system messages documenting it and the
//! `updated_at` bump all commit together.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use parley_shared::{Conversation, ConversationId, Message, UserId};

use crate::conversations::conversation_by_id;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::messages::{insert_message_row, touch_conversation};
use crate::users::display_name_or_id;

/// Result of a membership transition.
#[derive(Debug)]
pub enum MembershipOutcome {
    /// The conversation still exists; `system_messages` documents what
    /// happened (removal + auto-promotion can produce two).
    Updated {
        conversation: Conversation,
        system_messages: Vec<Message>,
    },
    /// The last participant left: the group reached its terminal state and
    /// was deleted.  `former_participants` is the audience for the
    /// deleted-conversation event.
    Deleted {
        conversation_id: ConversationId,
        former_participants: BTreeSet<UserId>,
    },
}

impl Database {
    /// Add `target` to a group.  Admin-only.
    pub fn add_member(
        &mut self,
        actor: UserId,
        id: ConversationId,
        target: UserId,
        now: DateTime<Utc>,
    ) -> Result<MembershipOutcome> {
        let tx = self.conn_mut().transaction()?;

        let conversation = group_by_id(&tx, id)?;
        if !conversation.is_admin(actor) {
            return Err(StoreError::NotAuthorized);
        }
        if conversation.is_participant(target) {
            return Err(StoreError::AlreadyMember);
        }

        tx.execute(
            "INSERT INTO conversation_members (conversation_id, user_id, is_admin, joined_at)
             VALUES (?1, ?2, 0, ?3)",
            params![id.to_string(), target.to_string(), now.to_rfc3339()],
        )?;

        let note = format!(
            "{} added {}",
            display_name_or_id(&tx, actor),
            display_name_or_id(&tx, target)
        );
        let outcome = commit_updated(tx, id, vec![Message::system(id, note, now)], now)?;

        tracing::info!(conversation = %id, %actor, %target, "member added");
        Ok(outcome)
    }

    /// Remove `target` from a group.  Self-leave is always allowed;
    /// removing someone else requires admin rights.
    ///
    /// Post-conditions: an emptied group is deleted (terminal state); a
    /// group left without admins auto-promotes exactly one remaining
    /// participant (the creator if still present, else the earliest
    /// joiner, id ascending on ties).
    pub fn remove_member(
        &mut self,
        actor: UserId,
        id: ConversationId,
        target: UserId,
        now: DateTime<Utc>,
    ) -> Result<MembershipOutcome> {
        let tx = self.conn_mut().transaction()?;

        let conversation = group_by_id(&tx, id)?;
        if actor != target && !conversation.is_admin(actor) {
            return Err(StoreError::NotAuthorized);
        }
        if !conversation.is_participant(target) {
            return Err(StoreError::NotAMember);
        }

        tx.execute(
            "DELETE FROM conversation_members WHERE conversation_id = ?1 AND user_id = ?2",
            params![id.to_string(), target.to_string()],
        )?;

        if conversation.participants.len() == 1 {
            // Terminal state: nobody left.
            tx.execute(
                "DELETE FROM conversations WHERE id = ?1",
                params![id.to_string()],
            )?;
            tx.commit()?;

            tracing::info!(conversation = %id, "group emptied and deleted");
            return Ok(MembershipOutcome::Deleted {
                conversation_id: id,
                former_participants: conversation.participants,
            });
        }

        let note = if actor == target {
            format!("{} left the group", display_name_or_id(&tx, target))
        } else {
            format!(
                "{} removed {}",
                display_name_or_id(&tx, actor),
                display_name_or_id(&tx, target)
            )
        };
        let mut system_messages = vec![Message::system(id, note, now)];

        let admins_left = conversation.admins.iter().any(|a| *a != target);
        if !admins_left {
            let promoted = auto_promote(&tx, &conversation, target)?;
            system_messages.push(Message::system(
                id,
                format!("{} is now an admin", display_name_or_id(&tx, promoted)),
                now,
            ));
            tracing::info!(conversation = %id, %promoted, "auto-promoted new admin");
        }

        let outcome = commit_updated(tx, id, system_messages, now)?;
        tracing::info!(conversation = %id, %actor, %target, "member removed");
        Ok(outcome)
    }

    /// Grant admin rights to an existing participant.  Admin-only.
    pub fn promote(
        &mut self,
        actor: UserId,
        id: ConversationId,
        target: UserId,
        now: DateTime<Utc>,
    ) -> Result<MembershipOutcome> {
        let tx = self.conn_mut().transaction()?;

        let conversation = group_by_id(&tx, id)?;
        if !conversation.is_admin(actor) {
            return Err(StoreError::NotAuthorized);
        }
        if !conversation.is_participant(target) {
            return Err(StoreError::NotAMember);
        }
        if conversation.is_admin(target) {
            return Err(StoreError::AlreadyMember);
        }

        set_admin_flag(&tx, id, target, true)?;

        let note = format!("{} is now an admin", display_name_or_id(&tx, target));
        let outcome = commit_updated(tx, id, vec![Message::system(id, note, now)], now)?;

        tracing::info!(conversation = %id, %actor, %target, "admin promoted");
        Ok(outcome)
    }

    /// Revoke admin rights.  Admin-only (self-demotion included).  Fails
    /// with [`StoreError::LastAdmin`] when it would leave a populated group
    /// without any admin — the caller must promote someone else first.
    pub fn demote(
        &mut self,
        actor: UserId,
        id: ConversationId,
        target: UserId,
        now: DateTime<Utc>,
    ) -> Result<MembershipOutcome> {
        let tx = self.conn_mut().transaction()?;

        let conversation = group_by_id(&tx, id)?;
        if !conversation.is_admin(actor) {
            return Err(StoreError::NotAuthorized);
        }
        if !conversation.is_admin(target) {
            return Err(StoreError::NotAMember);
        }
        if conversation.admins.len() == 1 {
            return Err(StoreError::LastAdmin);
        }

        set_admin_flag(&tx, id, target, false)?;

        let note = format!("{} is no longer an admin", display_name_or_id(&tx, target));
        let outcome = commit_updated(tx, id, vec![Message::system(id, note, now)], now)?;

        tracing::info!(conversation = %id, %actor, %target, "admin demoted");
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn group_by_id(conn: &Connection, id: ConversationId) -> Result<Conversation> {
    let conversation = conversation_by_id(conn, id)?;
    if !conversation.is_group {
        return Err(StoreError::NotAGroup);
    }
    Ok(conversation)
}

fn set_admin_flag(
    conn: &Connection,
    id: ConversationId,
    user: UserId,
    is_admin: bool,
) -> Result<()> {
    conn.execute(
        "UPDATE conversation_members SET is_admin = ?3
         WHERE conversation_id = ?1 AND user_id = ?2",
        params![id.to_string(), user.to_string(), is_admin],
    )?;
    Ok(())
}

/// Pick and promote the replacement admin: the original creator if still a
/// participant, otherwise the earliest joiner (id ascending on equal
/// timestamps).  `conversation` is the pre-removal snapshot, so `removed`
/// must be excluded explicitly.
fn auto_promote(
    conn: &Connection,
    conversation: &Conversation,
    removed: UserId,
) -> Result<UserId> {
    let creator = conversation.created_by;
    let promoted = if creator != removed && conversation.is_participant(creator) {
        creator
    } else {
        let id_str: String = conn.query_row(
            "SELECT user_id FROM conversation_members
             WHERE conversation_id = ?1
             ORDER BY joined_at ASC, user_id ASC
             LIMIT 1",
            params![conversation.id.to_string()],
            |row| row.get(0),
        )?;
        UserId(Uuid::parse_str(&id_str)?)
    };

    set_admin_flag(conn, conversation.id, promoted, true)?;
    Ok(promoted)
}

/// Append the system messages, bump the conversation and commit.
fn commit_updated(
    tx: rusqlite::Transaction<'_>,
    id: ConversationId,
    system_messages: Vec<Message>,
    now: DateTime<Utc>,
) -> Result<MembershipOutcome> {
    for message in &system_messages {
        insert_message_row(&tx, message)?;
    }
    if let Some(last) = system_messages.last() {
        touch_conversation(&tx, id, last.id, now)?;
    }

    let conversation = conversation_by_id(&tx, id)?;
    tx.commit()?;

    Ok(MembershipOutcome::Updated {
        conversation,
        system_messages,
    })
}
