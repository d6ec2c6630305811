//! Invariant checking for deterministic simulation testing.
//!
//! Invariants are properties that must always hold during execution. Unlike
//! example-based tests that check specific scenarios, they verify behavioral
//! properties across every state a test drives the store through.
//!
//! # Usage
//!
//! ```ignore
//! let registry = InvariantRegistry::standard();
//! let snapshot = StoreSnapshot::from_store(session.store());
//! registry.assert_all(&snapshot, "after reconnect");
//! ```

mod checks;
mod snapshot;

pub use checks::{
    MessagesOrdered, OneConversationPerPeer, TotalUnreadConsistent, UniqueConversationIds,
    UniqueMessageIds, UnreadMatchesDerivation,
};
pub use snapshot::StoreSnapshot;

/// Invariant check result.
pub type InvariantResult = Result<(), Violation>;

/// Identifies an invariant in violation reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvariantKind {
    /// Conversation ids are unique and messages point at their conversation.
    UniqueConversationIds,
    /// Message ids are unique within a conversation.
    UniqueMessageIds,
    /// Unread count equals the derivation from message state.
    UnreadMatchesDerivation,
    /// At most one conversation per peer.
    OneConversationPerPeer,
    /// Messages are kept in order.
    MessagesOrdered,
    /// Total unread equals the sum over conversations.
    TotalUnreadConsistent,
}

impl InvariantKind {
    /// Stable name for reports.
    pub fn name(self) -> &'static str {
        match self {
            Self::UniqueConversationIds => "unique_conversation_ids",
            Self::UniqueMessageIds => "unique_message_ids",
            Self::UnreadMatchesDerivation => "unread_matches_derivation",
            Self::OneConversationPerPeer => "one_conversation_per_peer",
            Self::MessagesOrdered => "messages_ordered",
            Self::TotalUnreadConsistent => "total_unread_consistent",
        }
    }
}

/// Invariant violation with context.
#[derive(Debug, Clone)]
pub struct Violation {
    /// The violated invariant.
    pub invariant: InvariantKind,
    /// Description of what went wrong.
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.invariant.name(), self.message)
    }
}

impl std::error::Error for Violation {}

/// An invariant that can be checked against store state.
pub trait Invariant: Send + Sync {
    /// Which invariant this is.
    fn kind(&self) -> InvariantKind;

    /// Check the invariant against a snapshot.
    fn check(&self, state: &StoreSnapshot) -> InvariantResult;
}

/// Registry of invariants to check.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Registry with every store invariant.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(UniqueConversationIds);
        registry.add(UniqueMessageIds);
        registry.add(UnreadMatchesDerivation);
        registry.add(OneConversationPerPeer);
        registry.add(MessagesOrdered);
        registry.add(TotalUnreadConsistent);
        registry
    }

    /// Add an invariant to the registry.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Check all invariants. Returns every violation found.
    pub fn check_all(&self, state: &StoreSnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> =
            self.invariants.iter().filter_map(|inv| inv.check(state).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Check all invariants, panicking with every violation.
    #[allow(clippy::panic, reason = "test assertion helper")]
    pub fn assert_all(&self, state: &StoreSnapshot, context: &str) {
        if let Err(violations) = self.check_all(state) {
            let messages: Vec<_> = violations.iter().map(ToString::to_string).collect();
            panic!("Invariant violation {context}:\n  {}", messages.join("\n  "));
        }
    }

    /// Number of registered invariants.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}
