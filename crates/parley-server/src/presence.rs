//! Presence tracking: which connections belong to which user.
//!
//! Pure in-memory state — a crash simply means everyone starts offline and
//! the map self-heals as clients reconnect.  No I/O happens inside the
//! lock; the caller persists the online/last-seen snapshot when a
//! transition is reported.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;

use parley_shared::{ConnectionId, UserId};

/// Online/offline edge produced by a connection change.  `None` means the
/// user's visible presence did not change (they still have other
/// connections, or the close was redundant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTransition {
    Online(UserId),
    Offline(UserId),
}

#[derive(Default)]
struct PresenceInner {
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
    by_connection: HashMap<ConnectionId, UserId>,
}

/// Maps each user to the set of currently-open connections.  A user is
/// online iff the set is non-empty.
#[derive(Clone, Default)]
pub struct PresenceTracker {
    inner: Arc<Mutex<PresenceInner>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for a user.  Reports `Online` when this is the
    /// user's first connection; a connection re-announcing itself for a
    /// different user is unbound from the previous one first, reporting
    /// `Offline` when that was the previous user's last connection.
    pub async fn connection_opened(
        &self,
        user: UserId,
        connection: ConnectionId,
    ) -> Vec<PresenceTransition> {
        let mut inner = self.inner.lock().await;
        let mut transitions = Vec::new();

        if let Some(previous) = inner.by_connection.insert(connection, user) {
            if previous != user {
                if let Some(set) = inner.by_user.get_mut(&previous) {
                    set.remove(&connection);
                    if set.is_empty() {
                        inner.by_user.remove(&previous);
                        transitions.push(PresenceTransition::Offline(previous));
                    }
                }
            }
        }

        let set = inner.by_user.entry(user).or_default();
        if set.is_empty() {
            transitions.push(PresenceTransition::Online(user));
        }
        set.insert(connection);

        tracing::debug!(%user, %connection, connections = set.len(), "connection opened");
        transitions
    }

    /// Remove a connection, looked up by connection id alone.  Idempotent:
    /// closing an unknown or already-closed connection is a no-op.
    /// Returns `Offline` when the owning user's last connection went away.
    pub async fn connection_closed(
        &self,
        connection: ConnectionId,
    ) -> Option<PresenceTransition> {
        let mut inner = self.inner.lock().await;

        let user = inner.by_connection.remove(&connection)?;
        let set = inner.by_user.get_mut(&user)?;
        set.remove(&connection);

        if set.is_empty() {
            inner.by_user.remove(&user);
            tracing::debug!(%user, %connection, "user fully offline");
            return Some(PresenceTransition::Offline(user));
        }

        tracing::debug!(%user, %connection, remaining = set.len(), "connection closed");
        None
    }

    /// Live delivery targets for a user.  Empty means "deliver nothing
    /// live", not an error.
    pub async fn connections_for(&self, user: UserId) -> HashSet<ConnectionId> {
        let inner = self.inner.lock().await;
        inner.by_user.get(&user).cloned().unwrap_or_default()
    }

    /// Union of delivery targets for a set of users, used by the fan-out
    /// engine to resolve a conversation's audience.
    pub async fn connections_for_all<'a>(
        &self,
        users: impl IntoIterator<Item = &'a UserId>,
    ) -> Vec<ConnectionId> {
        let inner = self.inner.lock().await;
        let mut targets = Vec::new();
        for user in users {
            if let Some(set) = inner.by_user.get(user) {
                targets.extend(set.iter().copied());
            }
        }
        targets
    }

    /// The user a connection announced itself as, if any.
    pub async fn user_of(&self, connection: ConnectionId) -> Option<UserId> {
        let inner = self.inner.lock().await;
        inner.by_connection.get(&connection).copied()
    }

    pub async fn is_online(&self, user: UserId) -> bool {
        !self.connections_for(user).await.is_empty()
    }
}
