//! # parley-shared
//!
//! Types shared between the Parley chat server and its clients: id
//! newtypes, the domain models (conversations, messages, users) and the
//! push-channel protocol events.  Pure data — no I/O lives here.

pub mod model;
pub mod protocol;
pub mod types;

pub use model::*;
pub use protocol::{ClientEvent, ServerEvent};
pub use types::{ConnectionId, ConversationId, MessageId, UserId};
