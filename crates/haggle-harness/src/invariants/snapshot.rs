//! Observable store state for invariant checking.
//!
//! Invariants run against a copy so a check never observes a half-applied
//! mutation.

use haggle_core::{Conversation, ConversationStore};
use haggle_proto::PeerId;

/// Copy of a store's observable state.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    /// The session user.
    pub self_id: PeerId,
    /// Conversations, sorted by id.
    pub conversations: Vec<Conversation>,
    /// Total unread as reported by the store.
    pub total_unread: u32,
}

impl StoreSnapshot {
    /// Capture `store`.
    pub fn from_store(store: &ConversationStore) -> Self {
        let mut conversations: Vec<Conversation> = store.conversations().cloned().collect();
        conversations.sort_by(|a, b| a.id.cmp(&b.id));
        Self { self_id: store.self_id().clone(), conversations, total_unread: store.total_unread() }
    }
}
