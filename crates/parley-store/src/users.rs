//! User snapshots: display data plus the presence columns the Presence
//! Tracker stamps on connect/disconnect.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use parley_shared::{User, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Insert or update a user snapshot.  Presence columns are preserved on
    /// update; they only move through [`Database::set_user_presence`].
    pub fn upsert_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, display_name, avatar_url, online, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 display_name = excluded.display_name,
                 avatar_url   = excluded.avatar_url",
            params![
                user.id.to_string(),
                user.display_name,
                user.avatar_url,
                user.online,
                user.last_seen.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetch a single user by id.
    pub fn get_user(&self, id: UserId) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT id, display_name, avatar_url, online, last_seen
                 FROM users WHERE id = ?1",
                params![id.to_string()],
                row_to_user,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Stamp the online flag and last-seen time.  Called by the presence
    /// path on first-connection / last-disconnection transitions only.
    pub fn set_user_presence(
        &self,
        id: UserId,
        online: bool,
        last_seen: DateTime<Utc>,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE users SET online = ?2, last_seen = ?3 WHERE id = ?1",
            params![id.to_string(), online, last_seen.to_rfc3339()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

/// Best-effort display name for system-message texts; falls back to the id
/// when the user snapshot is missing.
pub(crate) fn display_name_or_id(conn: &Connection, id: UserId) -> String {
    conn.query_row(
        "SELECT display_name FROM users WHERE id = ?1",
        params![id.to_string()],
        |row| row.get::<_, String>(0),
    )
    .unwrap_or_else(|_| id.to_string())
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id_str: String = row.get(0)?;
    let display_name: String = row.get(1)?;
    let avatar_url: Option<String> = row.get(2)?;
    let online: bool = row.get(3)?;
    let last_seen_str: String = row.get(4)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let last_seen: DateTime<Utc> = DateTime::parse_from_rfc3339(&last_seen_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(User {
        id: UserId(id),
        display_name,
        avatar_url,
        online,
        last_seen,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_user;

    #[test]
    fn upsert_preserves_presence() {
        let db = Database::open_in_memory().unwrap();
        let mut user = test_user("ana");
        db.upsert_user(&user).unwrap();

        let now = Utc::now();
        db.set_user_presence(user.id, true, now).unwrap();

        // Profile update must not clobber the presence columns.
        user.display_name = "Ana".to_string();
        db.upsert_user(&user).unwrap();

        let loaded = db.get_user(user.id).unwrap();
        assert_eq!(loaded.display_name, "Ana");
        assert!(loaded.online);
    }

    #[test]
    fn presence_for_unknown_user_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let err = db
            .set_user_presence(UserId::new(), true, Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }
}
