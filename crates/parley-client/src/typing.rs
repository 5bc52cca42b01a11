//! Typing indicators with timeout expiry.
//!
//! A peer that starts typing and then loses connectivity never sends the
//! stop event, so every indicator expires on its own after
//! [`TYPING_TIMEOUT`] unless refreshed.  Time is passed in by the caller,
//! keeping expiry deterministic under test.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use parley_shared::ConversationId;

/// How long a typing indicator stays alive without a refresh.
pub const TYPING_TIMEOUT: Duration = Duration::seconds(4);

/// Per-conversation map of who is typing and when they last said so.
#[derive(Debug, Default)]
pub struct TypingTracker {
    by_conversation: HashMap<ConversationId, HashMap<String, DateTime<Utc>>>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or refresh) a typing indicator.
    pub fn started(&mut self, conversation: ConversationId, user_name: String, now: DateTime<Utc>) {
        self.by_conversation
            .entry(conversation)
            .or_default()
            .insert(user_name, now);
    }

    /// Explicit stop from the peer.  Unknown names are ignored.
    pub fn stopped(&mut self, conversation: ConversationId, user_name: &str) {
        if let Some(typists) = self.by_conversation.get_mut(&conversation) {
            typists.remove(user_name);
            if typists.is_empty() {
                self.by_conversation.remove(&conversation);
            }
        }
    }

    /// Names currently typing in a conversation, expired entries excluded,
    /// sorted for stable rendering.
    pub fn typists(&self, conversation: ConversationId, now: DateTime<Utc>) -> Vec<&str> {
        let Some(typists) = self.by_conversation.get(&conversation) else {
            return Vec::new();
        };
        let mut names: Vec<&str> = typists
            .iter()
            .filter(|(_, last)| now - **last < TYPING_TIMEOUT)
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// Drop every expired entry.  Callers run this on a render tick so the
    /// maps do not grow with peers that silently vanished.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        self.by_conversation.retain(|_, typists| {
            typists.retain(|_, last| now - *last < TYPING_TIMEOUT);
            !typists.is_empty()
        });
    }

    /// Forget a conversation entirely (it was deleted or closed).
    pub fn clear_conversation(&mut self, conversation: ConversationId) {
        self.by_conversation.remove(&conversation);
    }
}
