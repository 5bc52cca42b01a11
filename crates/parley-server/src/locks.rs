//! Per-conversation write locks.
//!
//! All mutations of a single conversation (sends, membership changes,
//! read acks that flip status) serialize through its lock, so fan-out
//! order matches persistence order for that conversation.  Distinct
//! conversations proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use parley_shared::ConversationId;

#[derive(Clone, Default)]
pub struct ConversationLocks {
    locks: Arc<Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for one conversation, creating it on first use.
    /// The registry mutex is held only to look up the entry, never while
    /// waiting on the per-conversation lock.
    pub async fn acquire(&self, conversation: ConversationId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(conversation).or_default())
        };
        lock.lock_owned().await
    }
}
