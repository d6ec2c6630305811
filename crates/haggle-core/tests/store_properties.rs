//! Property tests for the conversation store and reconciliation engine.
//!
//! These tests verify critical invariants:
//! - Message sets are the deduplicated union of everything delivered
//! - Unread counts and message order hold after every single mutation, with
//!   sequence numbers missing on either channel
//! - Early events buffered before the snapshot converge with late events
//! - `mark_read` is idempotent

use std::collections::{BTreeMap, BTreeSet};

use haggle_core::{
    Conversation, ConversationStore, ReconcileConfig, ReconciliationEngine, UnreadAuthority,
};
use haggle_harness::{InvariantRegistry, StoreSnapshot};
use haggle_proto::{
    ChatSnapshot, ConversationId, Delivery, InboundEvent, Message, MessageId, PeerId, PeerProfile,
};
use proptest::prelude::*;

const SELF: &str = "me";

/// Store mutation drawn by proptest. Small id spaces force collisions.
#[derive(Debug, Clone)]
enum Op {
    Snapshot { conversation: u8, messages: Vec<u8> },
    Event { conversation: u8, message: u8 },
    MarkRead { conversation: u8, message: u8 },
    PeerRead { conversation: u8, message: u8 },
}

fn conversation_id(n: u8) -> ConversationId {
    ConversationId::new(format!("c{n}"))
}

fn peer(n: u8) -> PeerProfile {
    PeerProfile { id: PeerId::new(format!("u{n}")), name: format!("user {n}"), avatar: None }
}

/// The same `(conversation, message)` pair always yields the same message,
/// whichever channel delivers it. Only `seq` may be missing on one channel.
fn message(conversation: u8, n: u8, from_peer: bool, sequenced: bool) -> Message {
    Message {
        id: MessageId::new(format!("m{n}")),
        conversation_id: conversation_id(conversation),
        sender_id: if from_peer { peer(conversation).id } else { PeerId::from(SELF) },
        text: format!("text {n}"),
        sent_at: u64::from(n) * 10,
        read_at: None,
        seq: sequenced.then_some(u64::from(n)),
        client_ref: None,
        delivery: Delivery::Sent,
    }
}

fn snapshot(conversation: u8, messages: &[(u8, bool)]) -> ChatSnapshot {
    let messages: Vec<Message> = messages
        .iter()
        .map(|&(n, from_peer)| message(conversation, n, from_peer, snapshot_sequenced(n)))
        .collect();
    ChatSnapshot {
        id: conversation_id(conversation),
        peer_profile: peer(conversation),
        last_message: messages.last().cloned(),
        unread_count: 0,
        messages,
    }
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..3, prop::collection::vec(0u8..12, 0..6))
            .prop_map(|(conversation, messages)| Op::Snapshot { conversation, messages }),
        (0u8..3, 0u8..12).prop_map(|(conversation, message)| Op::Event { conversation, message }),
        (0u8..3, 0u8..12).prop_map(|(conversation, message)| Op::MarkRead { conversation, message }),
        (0u8..3, 0u8..12).prop_map(|(conversation, message)| Op::PeerRead { conversation, message }),
    ]
}

/// Sender is a function of the message number so that both channels agree
/// on the content of a given id.
fn sender_is_peer(message: u8) -> bool {
    message % 3 != 0
}

/// REST tails omit the sequence of odd messages.
fn snapshot_sequenced(message: u8) -> bool {
    message % 2 == 0
}

/// Realtime events omit the sequence of every fourth message.
fn event_sequenced(message: u8) -> bool {
    message % 4 != 0
}

fn apply(store: &mut ConversationStore, op: &Op) {
    match op {
        Op::Snapshot { conversation, messages } => {
            let messages: Vec<(u8, bool)> =
                messages.iter().map(|&n| (n, sender_is_peer(n))).collect();
            store.upsert_conversations(vec![snapshot(*conversation, &messages)], UnreadAuthority::Derived);
        },
        Op::Event { conversation, message: n } => {
            let event = message(*conversation, *n, sender_is_peer(*n), event_sequenced(*n));
            store.append_message(event, Some(peer(*conversation)));
        },
        Op::MarkRead { conversation, message: n } => {
            let _ = store.mark_read(&conversation_id(*conversation), &MessageId::new(format!("m{n}")), 1);
        },
        Op::PeerRead { conversation, message: n } => {
            let _ = store.mark_read_by_peer(
                &conversation_id(*conversation),
                &MessageId::new(format!("m{n}")),
                2,
            );
        },
    }
}

fn sorted(store: &ConversationStore) -> Vec<Conversation> {
    let mut conversations: Vec<Conversation> = store.conversations().cloned().collect();
    conversations.sort_by(|a, b| a.id.cmp(&b.id));
    conversations
}

proptest! {
    /// Property 1: the message set equals the deduplicated union of every
    /// message delivered, however REST and realtime deliveries interleave.
    #[test]
    fn message_set_is_deduplicated_union(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let mut store = ConversationStore::new(PeerId::from(SELF));
        let mut delivered: BTreeMap<ConversationId, BTreeSet<MessageId>> = BTreeMap::new();

        for op in &ops {
            match op {
                Op::Snapshot { conversation, messages } => {
                    let ids = delivered.entry(conversation_id(*conversation)).or_default();
                    ids.extend(messages.iter().map(|n| MessageId::new(format!("m{n}"))));
                },
                Op::Event { conversation, message } => {
                    delivered
                        .entry(conversation_id(*conversation))
                        .or_default()
                        .insert(MessageId::new(format!("m{message}")));
                },
                Op::MarkRead { .. } | Op::PeerRead { .. } => {},
            }
            apply(&mut store, op);
        }

        for (id, expected) in &delivered {
            let conversation = store.select(id).expect("delivered conversation exists");
            let actual: Vec<MessageId> = conversation.messages.iter().map(|m| m.id.clone()).collect();
            let unique: BTreeSet<MessageId> = actual.iter().cloned().collect();

            prop_assert_eq!(actual.len(), unique.len(), "duplicate message in {}", id);
            prop_assert_eq!(&unique, expected);
        }
    }

    /// Property 2: unread counts equal the derivation at every intermediate
    /// state, not only the final one.
    #[test]
    fn unread_matches_derivation_after_every_mutation(
        ops in prop::collection::vec(op_strategy(), 1..40)
    ) {
        let registry = InvariantRegistry::standard();
        let mut store = ConversationStore::new(PeerId::from(SELF));

        for (step, op) in ops.iter().enumerate() {
            apply(&mut store, op);

            let state = StoreSnapshot::from_store(&store);
            prop_assert!(
                registry.check_all(&state).is_ok(),
                "step {} ({:?}): {:?}",
                step,
                op,
                registry.check_all(&state)
            );

            for conversation in store.conversations() {
                let derived = conversation
                    .messages
                    .iter()
                    .filter(|m| m.sender_id.as_str() != SELF && m.read_at.is_none())
                    .count();
                prop_assert_eq!(conversation.unread_count as usize, derived);
            }
        }
    }

    /// Property 3: buffering events until the snapshot resolves yields the
    /// same state as receiving them strictly after it.
    #[test]
    fn early_and_late_events_converge(
        seed in prop::collection::vec((0u8..3, prop::collection::vec(0u8..12, 0..5)), 0..3),
        events in prop::collection::vec((0u8..3, 0u8..12, any::<bool>()), 0..20),
    ) {
        let chats: Vec<ChatSnapshot> = seed
            .iter()
            .map(|(c, ids)| {
                let messages: Vec<(u8, bool)> = ids.iter().map(|&n| (n, sender_is_peer(n))).collect();
                snapshot(*c, &messages)
            })
            .collect();
        let events: Vec<InboundEvent> = events
            .iter()
            .map(|&(c, n, receipt)| {
                if receipt {
                    InboundEvent::ReadReceipt {
                        conversation_id: conversation_id(c),
                        message_id: MessageId::new(format!("m{n}")),
                        reader_id: None,
                        read_at: Some(5),
                    }
                } else {
                    InboundEvent::NewMessage {
                        conversation_id: conversation_id(c),
                        message: message(c, n, sender_is_peer(n), event_sequenced(n)),
                        peer: Some(peer(c)),
                    }
                }
            })
            .collect();

        let mut early = ReconciliationEngine::new(PeerId::from(SELF), ReconcileConfig::default());
        for event in &events {
            early.ingest(event);
        }
        early.apply_snapshot(chats.clone());

        let mut late = ReconciliationEngine::new(PeerId::from(SELF), ReconcileConfig::default());
        late.apply_snapshot(chats);
        for event in &events {
            late.ingest(event);
        }

        prop_assert_eq!(sorted(early.store()), sorted(late.store()));
        prop_assert_eq!(early.store().total_unread(), late.store().total_unread());
    }

    /// Property 4: repeating a mark-read changes nothing.
    #[test]
    fn mark_read_is_idempotent(
        ops in prop::collection::vec(op_strategy(), 1..30),
        conversation in 0u8..3,
        message in 0u8..12,
    ) {
        let mut store = ConversationStore::new(PeerId::from(SELF));
        for op in &ops {
            apply(&mut store, op);
        }

        let id = conversation_id(conversation);
        let up_to = MessageId::new(format!("m{message}"));
        let first = store.mark_read(&id, &up_to, 9);
        let after_first = sorted(&store);
        let second = store.mark_read(&id, &up_to, 9);

        prop_assert_eq!(sorted(&store), after_first);
        if first.is_ok() {
            prop_assert_eq!(second, Ok(false));
        } else {
            prop_assert!(second.is_err());
        }
    }
}
