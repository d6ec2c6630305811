//! Unread derivation.
//!
//! Counts are a pure function of message state. Nothing ever increments or
//! decrements a counter, so no sequence of events can make them drift.

use haggle_proto::{Message, PeerId};

use crate::Conversation;

/// Derives unread counts relative to the session user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadTracker {
    self_id: PeerId,
}

impl UnreadTracker {
    /// Tracker for session user `self_id`.
    pub fn new(self_id: PeerId) -> Self {
        Self { self_id }
    }

    /// The session user.
    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    /// Whether `message` counts as unread: from someone else and not read.
    pub fn is_unread(&self, message: &Message) -> bool {
        message.sender_id != self.self_id && message.read_at.is_none()
    }

    /// Unread messages in `conversation`.
    pub fn count(&self, conversation: &Conversation) -> u32 {
        let unread = conversation.messages.iter().filter(|m| self.is_unread(m)).count();
        u32::try_from(unread).unwrap_or(u32::MAX)
    }

    /// Overwrite `conversation.unread_count` with the derived value.
    /// Returns whether it changed.
    pub fn recompute(&self, conversation: &mut Conversation) -> bool {
        let count = self.count(conversation);
        let changed = conversation.unread_count != count;
        conversation.unread_count = count;
        changed
    }

    /// Sum of unread counts. Badge value.
    pub fn total<'a>(&self, conversations: impl IntoIterator<Item = &'a Conversation>) -> u32 {
        conversations.into_iter().fold(0u32, |sum, c| sum.saturating_add(c.unread_count))
    }
}
