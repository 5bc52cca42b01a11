//! v001 -- Initial schema creation.
//!
//! Creates the five core tables: `users`, `conversations`,
//! `conversation_members`, `messages`, and `message_reads`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (identity is external; we snapshot display data + presence)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    display_name TEXT NOT NULL,
    avatar_url   TEXT,
    online       INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    last_seen    TEXT NOT NULL               -- ISO-8601 / RFC-3339
);

-- ----------------------------------------------------------------
-- Conversations (direct and group)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    is_group        INTEGER NOT NULL,           -- boolean 0/1
    name            TEXT,                       -- group name, NULL for direct
    created_by      TEXT NOT NULL,              -- UUID of creator
    last_message_id TEXT,                       -- nullable; expanded on read
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL               -- sole list-ordering key
);

CREATE INDEX IF NOT EXISTS idx_conversations_updated
    ON conversations(updated_at DESC, id ASC);

-- ----------------------------------------------------------------
-- Membership (participants + admin flag)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversation_members (
    conversation_id TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    is_admin        INTEGER NOT NULL DEFAULT 0,
    joined_at       TEXT NOT NULL,              -- auto-promotion tie-break

    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_members_user ON conversation_members(user_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_id TEXT NOT NULL,
    sender_id       TEXT,                       -- NULL for system messages
    kind            TEXT NOT NULL,              -- text|image|...|system
    content         TEXT NOT NULL,              -- JSON tagged-union payload
    status          TEXT NOT NULL,              -- sent|delivered|read
    timestamp       TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, timestamp ASC, id ASC);

-- ----------------------------------------------------------------
-- Per-message read receipts
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS message_reads (
    message_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    read_at    TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
