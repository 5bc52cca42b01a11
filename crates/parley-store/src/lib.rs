//! # parley-store
//!
//! Persistence for the Parley chat core, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed operations for conversations,
//! messages, read state and users.  All group-membership mutation goes
//! through the state machine in [`membership`], which is the single place
//! the "a non-empty group always has an admin" invariant is enforced.

pub mod conversations;
pub mod database;
pub mod membership;
pub mod messages;
pub mod migrations;
pub mod users;

mod error;

#[cfg(test)]
pub(crate) mod test_util;

pub use database::Database;
pub use error::{Result, StoreError};
pub use membership::MembershipOutcome;
