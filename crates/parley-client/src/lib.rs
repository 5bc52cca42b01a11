//! Client-side reconciliation of server push events.
//!
//! UI frameworks embed [`ChatView`] as their chat model: feed it every
//! [`parley_shared::ServerEvent`] from the push channel plus the local
//! open/close actions, render its state, and execute the
//! [`ClientCommand`]s it returns (acks, subscriptions, refetches).  The
//! state machine itself performs no I/O, which keeps the event-ordering
//! rules testable without a server.

pub mod state;
pub mod typing;

pub use state::{ChatView, ClientCommand};
pub use typing::TypingTracker;
