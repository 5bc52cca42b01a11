//! Connection hub: outbound event channels and typing-indicator rooms.
//!
//! Each websocket connection registers an unbounded sender here; domain
//! code pushes [`ServerEvent`]s through the hub and the socket task drains
//! its receiver.  Rooms exist only for the typing indicators — message
//! fan-out resolves its audience through the presence tracker instead, so
//! participants receive messages whether or not they have the
//! conversation open.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use parley_shared::{ConnectionId, ConversationId, ServerEvent};

#[derive(Default)]
struct HubInner {
    connections: HashMap<ConnectionId, mpsc::UnboundedSender<ServerEvent>>,
    rooms: HashMap<ConversationId, HashSet<ConnectionId>>,
}

#[derive(Clone, Default)]
pub struct Hub {
    inner: Arc<Mutex<HubInner>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and hand back the receiving end of its event
    /// queue.  The socket task owns the receiver for the connection's
    /// lifetime.
    pub async fn attach(&self, connection: ConnectionId) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        inner.connections.insert(connection, tx);
        rx
    }

    /// Number of currently attached connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    /// Drop a connection and remove it from every room it joined.
    pub async fn detach(&self, connection: ConnectionId) {
        let mut inner = self.inner.lock().await;
        inner.connections.remove(&connection);
        inner.rooms.retain(|_, members| {
            members.remove(&connection);
            !members.is_empty()
        });
    }

    pub async fn join(&self, connection: ConnectionId, conversation: ConversationId) {
        let mut inner = self.inner.lock().await;
        inner.rooms.entry(conversation).or_default().insert(connection);
    }

    pub async fn leave(&self, connection: ConnectionId, conversation: ConversationId) {
        let mut inner = self.inner.lock().await;
        if let Some(members) = inner.rooms.get_mut(&conversation) {
            members.remove(&connection);
            if members.is_empty() {
                inner.rooms.remove(&conversation);
            }
        }
    }

    /// Send one event to one connection.  A closed receiver is treated as
    /// a connection that is already going away, not an error.
    pub async fn send_to(&self, connection: ConnectionId, event: ServerEvent) {
        let inner = self.inner.lock().await;
        if let Some(tx) = inner.connections.get(&connection) {
            if tx.send(event).is_err() {
                tracing::debug!(%connection, "dropping event for closing connection");
            }
        }
    }

    /// Send an event to each listed connection, deduplicating targets so a
    /// connection never sees the same event twice per multicast.
    pub async fn multicast(&self, targets: &[ConnectionId], event: ServerEvent) {
        let inner = self.inner.lock().await;
        let mut seen = HashSet::new();
        for connection in targets {
            if !seen.insert(*connection) {
                continue;
            }
            if let Some(tx) = inner.connections.get(connection) {
                if tx.send(event.clone()).is_err() {
                    tracing::debug!(%connection, "dropping event for closing connection");
                }
            }
        }
    }

    /// Send to every room member except the originator.  Used for typing
    /// indicators, which only matter to peers with the conversation open.
    pub async fn broadcast_room_except(
        &self,
        conversation: ConversationId,
        except: ConnectionId,
        event: ServerEvent,
    ) {
        let inner = self.inner.lock().await;
        let Some(members) = inner.rooms.get(&conversation) else {
            return;
        };
        for connection in members {
            if *connection == except {
                continue;
            }
            if let Some(tx) = inner.connections.get(connection) {
                let _ = tx.send(event.clone());
            }
        }
    }
}
