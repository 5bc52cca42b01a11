//! Shared fixtures for the store tests.

use chrono::Utc;

use parley_shared::{User, UserId};

use crate::database::Database;

pub fn test_user(name: &str) -> User {
    User {
        id: UserId::new(),
        display_name: name.to_string(),
        avatar_url: None,
        online: false,
        last_seen: Utc::now(),
    }
}

/// In-memory database with two registered users, ready for a direct chat.
pub fn direct_pair() -> (Database, UserId, UserId) {
    let db = Database::open_in_memory().unwrap();
    let (a, b) = (test_user("alice"), test_user("bob"));
    db.upsert_user(&a).unwrap();
    db.upsert_user(&b).unwrap();
    (db, a.id, b.id)
}
