//! Standard invariant checks.
//!
//! These invariants capture behavioral properties that must always hold.
//! They verify WHAT must be true, not specific test scenarios.

use std::{cmp::Ordering, collections::HashSet};

use haggle_core::{UnreadTracker, conversation::message_order};

use super::{Invariant, InvariantKind, InvariantResult, StoreSnapshot, Violation};

/// Two conversations never share an id, and every message names the
/// conversation holding it.
pub struct UniqueConversationIds;

impl Invariant for UniqueConversationIds {
    fn kind(&self) -> InvariantKind {
        InvariantKind::UniqueConversationIds
    }

    fn check(&self, state: &StoreSnapshot) -> InvariantResult {
        let mut seen = HashSet::new();
        for conversation in &state.conversations {
            if !seen.insert(&conversation.id) {
                return Err(Violation {
                    invariant: self.kind(),
                    message: format!("conversation {} appears twice", conversation.id),
                });
            }
            if let Some(stray) = conversation.messages.iter().find(|m| m.conversation_id != conversation.id) {
                return Err(Violation {
                    invariant: self.kind(),
                    message: format!(
                        "message {} in {} claims conversation {}",
                        stray.id, conversation.id, stray.conversation_id
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Message ids are unique within a conversation.
///
/// Duplicate delivery (REST then socket, or a socket retry) must never
/// produce a second entry.
pub struct UniqueMessageIds;

impl Invariant for UniqueMessageIds {
    fn kind(&self) -> InvariantKind {
        InvariantKind::UniqueMessageIds
    }

    fn check(&self, state: &StoreSnapshot) -> InvariantResult {
        for conversation in &state.conversations {
            let mut seen = HashSet::new();
            for message in &conversation.messages {
                if !seen.insert(&message.id) {
                    return Err(Violation {
                        invariant: self.kind(),
                        message: format!("message {} duplicated in {}", message.id, conversation.id),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Unread count equals the count of peer messages without a read time.
///
/// Stronger than "never exceeds": counts are recomputed on every mutation,
/// so any difference means a publish skipped recomputation.
pub struct UnreadMatchesDerivation;

impl Invariant for UnreadMatchesDerivation {
    fn kind(&self) -> InvariantKind {
        InvariantKind::UnreadMatchesDerivation
    }

    fn check(&self, state: &StoreSnapshot) -> InvariantResult {
        let tracker = UnreadTracker::new(state.self_id.clone());
        for conversation in &state.conversations {
            let derived = tracker.count(conversation);
            if conversation.unread_count != derived {
                return Err(Violation {
                    invariant: self.kind(),
                    message: format!(
                        "{}: unread_count {} but {} unread messages",
                        conversation.id, conversation.unread_count, derived
                    ),
                });
            }
        }
        Ok(())
    }
}

/// At most one conversation per peer.
pub struct OneConversationPerPeer;

impl Invariant for OneConversationPerPeer {
    fn kind(&self) -> InvariantKind {
        InvariantKind::OneConversationPerPeer
    }

    fn check(&self, state: &StoreSnapshot) -> InvariantResult {
        let mut seen = HashSet::new();
        for conversation in &state.conversations {
            // Shells for self-sent messages have no peer yet
            if conversation.peer.id.as_str().is_empty() {
                continue;
            }
            if !seen.insert(&conversation.peer.id) {
                return Err(Violation {
                    invariant: self.kind(),
                    message: format!(
                        "peer {} has more than one conversation (one is {})",
                        conversation.peer.id, conversation.id
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Messages are sorted by sequence, local sends last.
pub struct MessagesOrdered;

impl Invariant for MessagesOrdered {
    fn kind(&self) -> InvariantKind {
        InvariantKind::MessagesOrdered
    }

    fn check(&self, state: &StoreSnapshot) -> InvariantResult {
        for conversation in &state.conversations {
            for window in conversation.messages.windows(2) {
                if message_order(&window[0], &window[1]) == Ordering::Greater {
                    return Err(Violation {
                        invariant: self.kind(),
                        message: format!(
                            "{}: {} sorted before {}",
                            conversation.id, window[0].id, window[1].id
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Badge total equals the sum of per-conversation counts.
pub struct TotalUnreadConsistent;

impl Invariant for TotalUnreadConsistent {
    fn kind(&self) -> InvariantKind {
        InvariantKind::TotalUnreadConsistent
    }

    fn check(&self, state: &StoreSnapshot) -> InvariantResult {
        let sum: u32 = state.conversations.iter().map(|c| c.unread_count).sum();
        if sum != state.total_unread {
            return Err(Violation {
                invariant: self.kind(),
                message: format!("total_unread {} but conversations sum to {}", state.total_unread, sum),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use haggle_core::Conversation;
    use haggle_proto::{ConversationId, Delivery, Message, MessageId, PeerId, PeerProfile};

    use super::*;

    fn msg(id: &str, seq: u64) -> Message {
        Message {
            id: MessageId::from(id),
            conversation_id: ConversationId::from("c1"),
            sender_id: PeerId::from("u2"),
            text: String::new(),
            sent_at: seq,
            read_at: None,
            seq: Some(seq),
            client_ref: None,
            delivery: Delivery::Sent,
        }
    }

    fn state(conversation: Conversation) -> StoreSnapshot {
        StoreSnapshot {
            self_id: PeerId::from("me"),
            total_unread: conversation.unread_count,
            conversations: vec![conversation],
        }
    }

    fn conversation(messages: Vec<Message>, unread: u32) -> Conversation {
        let mut c = Conversation::new(ConversationId::from("c1"), PeerProfile::placeholder("u2".into()));
        c.messages = messages;
        c.unread_count = unread;
        c
    }

    #[test]
    fn duplicate_message_detected() {
        let snapshot = state(conversation(vec![msg("m1", 1), msg("m1", 1)], 2));
        assert!(UniqueMessageIds.check(&snapshot).is_err());
    }

    #[test]
    fn drifted_counter_detected() {
        let snapshot = state(conversation(vec![msg("m1", 1)], 3));
        let violation = UnreadMatchesDerivation.check(&snapshot).unwrap_err();
        assert_eq!(violation.invariant, InvariantKind::UnreadMatchesDerivation);
    }

    #[test]
    fn out_of_order_detected() {
        let snapshot = state(conversation(vec![msg("m2", 2), msg("m1", 1)], 2));
        assert!(MessagesOrdered.check(&snapshot).is_err());
    }

    #[test]
    fn total_mismatch_detected() {
        let mut snapshot = state(conversation(vec![msg("m1", 1)], 1));
        snapshot.total_unread = 4;
        assert!(TotalUnreadConsistent.check(&snapshot).is_err());
    }

    #[test]
    fn second_conversation_for_peer_detected() {
        let mut snapshot = state(conversation(vec![], 0));
        let mut other = conversation(vec![], 0);
        other.id = ConversationId::from("c2");
        snapshot.conversations.push(other);
        assert!(OneConversationPerPeer.check(&snapshot).is_err());
    }
}
