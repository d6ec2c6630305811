//! Reconciliation of the REST snapshot with live events.
//!
//! The snapshot fetch and the realtime connection start together, so events
//! can arrive before, during or after the snapshot resolves. The engine holds
//! events back until the first snapshot is merged, then drains them through
//! the same path live events take:
//!
//! ```text
//!  events ──> [AwaitingSnapshot: buffer] ──snapshot──> seed store
//!                                                    └─> drain buffer in order
//!  events ──> [Live] ──────────────────────────────────> apply
//! ```
//!
//! Deduplication happens in the store, keyed by message id within a
//! conversation, so the order in which seed and early events land does not
//! change the final state.

use std::collections::{HashSet, VecDeque};

use haggle_proto::{ChatSnapshot, ConversationId, InboundEvent, MessageId, PeerId, PeerProfile};

use crate::{
    error::ReconciliationConflict,
    store::{AppendKind, AppendOutcome, ConversationStore, UnreadAuthority},
};

/// Default capacity of the pre-snapshot event buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Reconciliation configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Events held back while waiting for the first snapshot. When full, the
    /// engine stops waiting and goes live.
    pub buffer_capacity: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { buffer_capacity: DEFAULT_BUFFER_CAPACITY }
    }
}

/// Engine phase.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    AwaitingSnapshot { buffer: VecDeque<InboundEvent> },
    Live,
}

/// Outcome of a local send as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryUpdate {
    /// Server stored the message under `message_id`.
    Acknowledged {
        /// Local id used when sending.
        client_ref: MessageId,
        /// Server-assigned id.
        message_id: MessageId,
    },
    /// Server refused the message.
    Rejected {
        /// Local id used when sending.
        client_ref: MessageId,
        /// Server explanation.
        reason: String,
    },
}

/// Merges snapshots and live events into the [`ConversationStore`].
///
/// Owns the store. Realtime handlers receive the engine as their context and
/// call [`ReconciliationEngine::ingest`].
#[derive(Debug)]
pub struct ReconciliationEngine {
    config: ReconcileConfig,
    phase: Phase,
    /// Whether the session's first snapshot has been merged.
    seeded: bool,
    store: ConversationStore,
    /// Wall clock used for receipts that carry no read time.
    now_ms: u64,
    enrichment_queue: VecDeque<ConversationId>,
    enrichment_pending: HashSet<ConversationId>,
    delivery_updates: Vec<DeliveryUpdate>,
    conflicts: u64,
}

impl ReconciliationEngine {
    /// Engine for session user `self_id`, waiting for its first snapshot.
    pub fn new(self_id: PeerId, config: ReconcileConfig) -> Self {
        Self {
            config,
            phase: Phase::AwaitingSnapshot { buffer: VecDeque::new() },
            seeded: false,
            store: ConversationStore::new(self_id),
            now_ms: 0,
            enrichment_queue: VecDeque::new(),
            enrichment_pending: HashSet::new(),
            delivery_updates: Vec::new(),
            conflicts: 0,
        }
    }

    /// The store.
    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// The store, for local mutations (sends, navigation, mark-read).
    pub fn store_mut(&mut self) -> &mut ConversationStore {
        &mut self.store
    }

    /// Whether events are applied directly.
    pub fn is_live(&self) -> bool {
        self.phase == Phase::Live
    }

    /// Events held back waiting for the snapshot.
    pub fn buffered(&self) -> usize {
        match &self.phase {
            Phase::AwaitingSnapshot { buffer } => buffer.len(),
            Phase::Live => 0,
        }
    }

    /// Conflicts resolved so far. Diagnostic only.
    pub fn conflicts(&self) -> u64 {
        self.conflicts
    }

    /// Update the wall clock used to stamp receipts without a read time.
    pub fn advance_clock(&mut self, now_ms: u64) {
        self.now_ms = self.now_ms.max(now_ms);
    }

    /// Start a new session for `self_id`: empty store, waiting for a
    /// snapshot again.
    pub fn reset(&mut self, self_id: PeerId) {
        self.store.reset(self_id);
        self.phase = Phase::AwaitingSnapshot { buffer: VecDeque::new() };
        self.seeded = false;
        self.enrichment_queue.clear();
        self.enrichment_pending.clear();
        self.delivery_updates.clear();
        self.conflicts = 0;
    }

    /// Accept a live event: buffered before the first snapshot, applied
    /// after.
    pub fn ingest(&mut self, event: &InboundEvent) {
        let capacity = self.config.buffer_capacity;
        if let Phase::AwaitingSnapshot { buffer } = &mut self.phase {
            if buffer.len() < capacity {
                buffer.push_back(event.clone());
                return;
            }
            tracing::warn!(capacity, "event buffer full before snapshot, going live");
            self.go_live();
        }
        self.apply(event.clone());
    }

    /// Merge a REST snapshot, then drain buffered events in arrival order.
    ///
    /// The first snapshot of a session is authoritative for unread state.
    pub fn apply_snapshot(&mut self, chats: Vec<ChatSnapshot>) {
        let authority = if self.seeded { UnreadAuthority::Derived } else { UnreadAuthority::Snapshot };
        self.seeded = true;

        let touched = self.store.upsert_conversations(chats, authority);
        tracing::info!(conversations = touched.len(), ?authority, "snapshot merged");

        // A snapshot can fill in peers for shells created by early events.
        let store = &self.store;
        self.enrichment_queue.retain(|id| store.select(id).is_some_and(|c| c.shell));
        self.enrichment_pending.retain(|id| store.select(id).is_some_and(|c| c.shell));

        self.go_live();
    }

    /// The snapshot fetch failed. Proceed as if it were empty so live events
    /// still populate the store.
    pub fn snapshot_failed(&mut self) {
        tracing::warn!("snapshot unavailable, continuing with live events only");
        self.seeded = true;
        self.go_live();
    }

    /// Conversations whose peer needs fetching. Each is returned once until
    /// its result arrives.
    pub fn take_enrichment_requests(&mut self) -> Vec<ConversationId> {
        self.enrichment_queue.drain(..).collect()
    }

    /// Peer fetched for a shell conversation.
    pub fn apply_enrichment(&mut self, conversation_id: &ConversationId, peer: PeerProfile) {
        self.enrichment_pending.remove(conversation_id);
        if let Err(conflict) = self.store.enrich(conversation_id, peer) {
            self.conflict(&conflict);
        }
    }

    /// Peer fetch failed. The conversation stays a shell with its placeholder
    /// peer and will be retried if another event references it.
    pub fn enrichment_failed(&mut self, conversation_id: &ConversationId) {
        tracing::warn!(conversation = %conversation_id, "peer enrichment failed");
        self.enrichment_pending.remove(conversation_id);
    }

    /// Delivery outcomes reported by the server since the last call.
    pub fn take_delivery_updates(&mut self) -> Vec<DeliveryUpdate> {
        std::mem::take(&mut self.delivery_updates)
    }

    fn go_live(&mut self) {
        let previous = std::mem::replace(&mut self.phase, Phase::Live);
        if let Phase::AwaitingSnapshot { buffer } = previous {
            if !buffer.is_empty() {
                tracing::debug!(events = buffer.len(), "draining buffered events");
            }
            for event in buffer {
                self.apply(event);
            }
        }
    }

    fn apply(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::NewMessage { conversation_id, mut message, peer } => {
                message.conversation_id = conversation_id;
                let client_ref = message.client_ref.clone();
                let message_id = message.id.clone();
                let outcome = self.store.append_message(message, peer);
                self.after_append(&outcome);
                if let (AppendKind::Replaced, Some(client_ref)) = (outcome.kind, client_ref) {
                    self.delivery_updates.push(DeliveryUpdate::Acknowledged { client_ref, message_id });
                }
            },

            InboundEvent::ReadReceipt { conversation_id, message_id, reader_id, read_at } => {
                let read_at = read_at.unwrap_or(self.now_ms);
                let by_self = reader_id.as_ref().is_none_or(|r| r == self.store.self_id());
                let result = if by_self {
                    self.store.mark_read(&conversation_id, &message_id, read_at)
                } else {
                    self.store.mark_read_by_peer(&conversation_id, &message_id, read_at)
                };
                if let Err(conflict) = result {
                    self.conflict(&conflict);
                }
            },

            InboundEvent::Presence { peer_id, online } => {
                if self.store.set_presence(&peer_id, online) {
                    tracing::debug!(peer = %peer_id, online, "presence");
                }
            },

            InboundEvent::ConversationCreated { conversation } => {
                self.store.upsert_conversations(vec![conversation], UnreadAuthority::Derived);
            },

            InboundEvent::MessageAck { client_ref, message, peer } => {
                let message_id = message.id.clone();
                let outcome = self.store.acknowledge(&client_ref, message, peer);
                self.after_append(&outcome);
                self.delivery_updates.push(DeliveryUpdate::Acknowledged { client_ref, message_id });
            },

            InboundEvent::SendRejected { client_ref, reason } => {
                tracing::warn!(%client_ref, %reason, "send rejected");
                self.store.fail_local(&client_ref);
                self.delivery_updates.push(DeliveryUpdate::Rejected { client_ref, reason });
            },

            InboundEvent::Welcome { .. } | InboundEvent::Unauthorized { .. } => {},
        }
    }

    fn after_append(&mut self, outcome: &AppendOutcome) {
        if outcome.kind == AppendKind::Duplicate {
            self.conflicts += 1;
        }

        let needs_peer = outcome.needs_enrichment
            || self.store.select(&outcome.conversation_id).is_some_and(|c| c.shell);
        if needs_peer && self.enrichment_pending.insert(outcome.conversation_id.clone()) {
            self.enrichment_queue.push_back(outcome.conversation_id.clone());
        }
    }

    fn conflict(&mut self, conflict: &ReconciliationConflict) {
        self.conflicts += 1;
        tracing::debug!(%conflict, "resolved locally");
    }
}
