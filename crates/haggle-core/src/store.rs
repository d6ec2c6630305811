//! Conversation store.
//!
//! Canonical in-memory chat state for one session: conversations, their
//! ordered messages, unread counts, and peer presence. All mutation goes
//! through `&mut self`, so mutations are serialized by construction.
//!
//! # Observation
//!
//! Observers hold [`tokio::sync::watch`] receivers. Every mutation ends in a
//! single commit step that recomputes unread counts for the touched
//! conversations, recomputes the total, and only then publishes. An observer
//! therefore never sees a conversation whose unread count disagrees with its
//! messages.
//!
//! # Identity
//!
//! A conversation is keyed by id. When the server reports a conversation for
//! a peer that already has one, the store keeps one conversation per peer and
//! records an alias, so both ids resolve to the same conversation. Provisional
//! ids minted for brand-new threads are replaced (not duplicated) the same
//! way once the server assigns an id.

use std::collections::{HashMap, HashSet};

use haggle_proto::{ChatSnapshot, ConversationId, Delivery, Message, MessageId, PeerId, PeerProfile};
use tokio::sync::watch;

use crate::{
    ActiveChat, ChatList, Conversation, UnreadTracker, error::ReconciliationConflict,
};

/// Upper bound on alias chain length followed by [`ConversationStore::resolve`].
const MAX_ALIAS_HOPS: usize = 8;

/// How a snapshot's unread counts are treated by
/// [`ConversationStore::upsert_conversations`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreadAuthority {
    /// First snapshot of a session. Older unread messages in the tail beyond
    /// the server's unread count are seeded as read.
    Snapshot,
    /// Unread state is derived from local message state only.
    Derived,
}

/// What [`ConversationStore::append_message`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendKind {
    /// New message inserted.
    Inserted,
    /// Message id already present. Read state merged, nothing inserted.
    Duplicate,
    /// Replaced the optimistic local message named by `client_ref`.
    Replaced,
}

/// Result of [`ConversationStore::append_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Canonical id of the conversation the message landed in.
    pub conversation_id: ConversationId,
    /// What happened.
    pub kind: AppendKind,
    /// A shell conversation was created and needs its peer fetched.
    pub needs_enrichment: bool,
}

/// Canonical conversation state with observers.
#[derive(Debug)]
pub struct ConversationStore {
    tracker: UnreadTracker,
    conversations: HashMap<ConversationId, Conversation>,
    by_peer: HashMap<PeerId, ConversationId>,
    aliases: HashMap<ConversationId, ConversationId>,
    presence: HashMap<PeerId, bool>,
    total_unread: u32,
    watchers: HashMap<ConversationId, watch::Sender<Option<Conversation>>>,
    chats: watch::Sender<ChatList>,
}

impl ConversationStore {
    /// Empty store for session user `self_id`.
    pub fn new(self_id: PeerId) -> Self {
        Self {
            tracker: UnreadTracker::new(self_id),
            conversations: HashMap::new(),
            by_peer: HashMap::new(),
            aliases: HashMap::new(),
            presence: HashMap::new(),
            total_unread: 0,
            watchers: HashMap::new(),
            chats: watch::channel(ChatList::default()).0,
        }
    }

    /// The session user.
    pub fn self_id(&self) -> &PeerId {
        self.tracker.self_id()
    }

    /// Drop all state and switch to session user `self_id`.
    ///
    /// Observers stay subscribed and see the empty state.
    pub fn reset(&mut self, self_id: PeerId) {
        self.tracker = UnreadTracker::new(self_id);
        self.clear();
    }

    /// Drop all conversations, aliases and presence.
    pub fn clear(&mut self) {
        let touched: Vec<ConversationId> = self.conversations.keys().cloned().collect();
        self.conversations.clear();
        self.by_peer.clear();
        self.aliases.clear();
        self.presence.clear();
        self.commit(&touched);
    }

    /// Merge a REST snapshot.
    ///
    /// Absent conversations are inserted. Present ones get the id union of
    /// messages, with read state merged (a message read on either side stays
    /// read). Returns the canonical ids of the conversations touched.
    pub fn upsert_conversations(
        &mut self,
        snapshot: Vec<ChatSnapshot>,
        authority: UnreadAuthority,
    ) -> Vec<ConversationId> {
        let mut touched = Vec::with_capacity(snapshot.len());

        for chat in snapshot {
            let ChatSnapshot { id, peer_profile, last_message, unread_count, messages } = chat;

            let target = match self.locate(&id, Some(&peer_profile.id)) {
                Some(existing) => existing,
                None => {
                    self.insert_conversation(Conversation::new(id.clone(), peer_profile.clone()));
                    id.clone()
                },
            };

            let mut incoming = messages;
            if let Some(last) = last_message {
                if !incoming.iter().any(|m| m.id == last.id) {
                    incoming.push(last);
                }
            }
            let snapshot_ids: HashSet<MessageId> = incoming.iter().map(|m| m.id.clone()).collect();

            let self_id = self.tracker.self_id().clone();
            let target = self.assign_peer(&target, &peer_profile.id);
            let Some(conversation) = self.conversations.get_mut(&target) else {
                continue;
            };
            conversation.peer = peer_profile;
            conversation.shell = false;

            for mut message in incoming {
                message.conversation_id = target.clone();
                message.delivery = Delivery::Sent;
                let _ = merge_message(conversation, message);
            }

            if authority == UnreadAuthority::Snapshot {
                seed_read_state(conversation, &snapshot_ids, &self_id, unread_count);
            }

            touched.push(target);
        }

        self.commit(&touched);
        touched
    }

    /// Insert a message into its conversation.
    ///
    /// `peer` is the counterpart profile when the event carried one. An
    /// unknown conversation becomes a shell: with `peer` it is complete,
    /// without it the peer is a placeholder and the outcome asks for
    /// enrichment.
    pub fn append_message(&mut self, message: Message, peer: Option<PeerProfile>) -> AppendOutcome {
        let peer_hint = peer.as_ref().map(|p| p.id.clone()).or_else(|| {
            (message.sender_id != *self.tracker.self_id()).then(|| message.sender_id.clone())
        });

        let mut needs_enrichment = false;
        let target = match self.locate(&message.conversation_id, peer_hint.as_ref()) {
            Some(existing) => existing,
            None => {
                let id = message.conversation_id.clone();
                let conversation = match peer {
                    Some(profile) => Conversation::new(id.clone(), profile),
                    None => {
                        needs_enrichment = true;
                        let placeholder = peer_hint.unwrap_or_else(|| PeerId::new(""));
                        Conversation::shell(id.clone(), PeerProfile::placeholder(placeholder))
                    },
                };
                tracing::debug!(conversation = %id, "creating conversation for unknown id");
                self.insert_conversation(conversation);
                id
            },
        };

        let kind = match self.conversations.get_mut(&target) {
            Some(conversation) => {
                let mut message = message;
                message.conversation_id = target.clone();
                let message_id = message.id.clone();
                let kind = merge_message(conversation, message);
                if kind == AppendKind::Duplicate {
                    let conflict = ReconciliationConflict::DuplicateMessage {
                        conversation_id: target.clone(),
                        message_id,
                    };
                    tracing::debug!(%conflict, "ignored");
                }
                kind
            },
            None => AppendKind::Duplicate,
        };

        self.commit(std::slice::from_ref(&target));
        AppendOutcome { conversation_id: target, kind, needs_enrichment }
    }

    /// Server accepted local message `client_ref` as `message`.
    ///
    /// If the local copy lives in a provisional conversation, that
    /// conversation takes the server-assigned id first.
    pub fn acknowledge(
        &mut self,
        client_ref: &MessageId,
        mut message: Message,
        peer: Option<PeerProfile>,
    ) -> AppendOutcome {
        if let Some(local_in) = self.find_local(client_ref).map(|(id, _)| id.clone()) {
            let assigned =
                self.resolve(&message.conversation_id).unwrap_or_else(|| message.conversation_id.clone());
            if local_in != assigned {
                self.merge_into(&local_in, &assigned);
            }
        }
        if message.client_ref.is_none() {
            message.client_ref = Some(client_ref.clone());
        }
        self.append_message(message, peer)
    }

    /// Add an optimistic local message to an existing conversation.
    pub fn insert_local(&mut self, message: Message) -> Result<ConversationId, ReconciliationConflict> {
        let target = self
            .resolve(&message.conversation_id)
            .ok_or_else(|| ReconciliationConflict::UnknownConversation(message.conversation_id.clone()))?;
        let Some(conversation) = self.conversations.get_mut(&target) else {
            return Err(ReconciliationConflict::UnknownConversation(target));
        };

        let mut message = message;
        message.conversation_id = target.clone();
        conversation.insert_ordered(message);
        self.commit(std::slice::from_ref(&target));
        Ok(target)
    }

    /// Change the delivery state of local message `id`. Returns whether it
    /// changed.
    pub fn set_delivery(
        &mut self,
        conversation_id: &ConversationId,
        id: &MessageId,
        delivery: Delivery,
    ) -> Result<bool, ReconciliationConflict> {
        let target = self
            .resolve(conversation_id)
            .ok_or_else(|| ReconciliationConflict::UnknownConversation(conversation_id.clone()))?;
        let Some(conversation) = self.conversations.get_mut(&target) else {
            return Err(ReconciliationConflict::UnknownConversation(target));
        };
        let Some(message) = conversation.messages.iter_mut().find(|m| &m.id == id && m.is_local())
        else {
            return Err(ReconciliationConflict::UnknownMessage {
                conversation_id: target,
                message_id: id.clone(),
            });
        };

        if message.delivery == delivery {
            return Ok(false);
        }
        message.delivery = delivery;
        self.commit(std::slice::from_ref(&target));
        Ok(true)
    }

    /// Mark the local message `client_ref` failed, wherever it lives.
    /// Returns whether it changed.
    pub fn fail_local(&mut self, client_ref: &MessageId) -> bool {
        let Some(conversation_id) = self.find_local(client_ref).map(|(id, _)| id.clone()) else {
            return false;
        };
        self.set_delivery(&conversation_id, client_ref, Delivery::Failed).unwrap_or(false)
    }

    /// Set `read_at` on every message up to and including `up_to` that lacks
    /// one. Idempotent. Returns whether anything changed.
    pub fn mark_read(
        &mut self,
        conversation_id: &ConversationId,
        up_to: &MessageId,
        read_at: u64,
    ) -> Result<bool, ReconciliationConflict> {
        self.mark_read_where(conversation_id, up_to, read_at, |_| true)
    }

    /// The peer read our messages up to and including `up_to`.
    ///
    /// Only messages authored by the session user are touched, so the
    /// session user's own unread state is unaffected.
    pub fn mark_read_by_peer(
        &mut self,
        conversation_id: &ConversationId,
        up_to: &MessageId,
        read_at: u64,
    ) -> Result<bool, ReconciliationConflict> {
        let self_id = self.tracker.self_id().clone();
        self.mark_read_where(conversation_id, up_to, read_at, |m| m.sender_id == self_id)
    }

    /// Fill in the peer of a shell conversation.
    ///
    /// Rejected as stale when the conversation is no longer a shell, for
    /// example because a snapshot already supplied the peer.
    pub fn enrich(
        &mut self,
        conversation_id: &ConversationId,
        peer: PeerProfile,
    ) -> Result<ConversationId, ReconciliationConflict> {
        let target = self
            .resolve(conversation_id)
            .ok_or_else(|| ReconciliationConflict::UnknownConversation(conversation_id.clone()))?;
        let Some(conversation) = self.conversations.get_mut(&target) else {
            return Err(ReconciliationConflict::UnknownConversation(target));
        };
        if !conversation.shell {
            return Err(ReconciliationConflict::StaleEnrichment(target));
        }

        let canonical = self.assign_peer(&target, &peer.id);
        if let Some(conversation) = self.conversations.get_mut(&canonical) {
            conversation.peer = peer;
            conversation.shell = false;
        }

        self.commit(std::slice::from_ref(&canonical));
        Ok(canonical)
    }

    /// Record peer presence. Returns whether it changed.
    pub fn set_presence(&mut self, peer: &PeerId, online: bool) -> bool {
        self.presence.insert(peer.clone(), online) != Some(online)
    }

    /// Whether `peer` was last reported online.
    pub fn is_online(&self, peer: &PeerId) -> bool {
        self.presence.get(peer).copied().unwrap_or(false)
    }

    /// Conversation `id`, creating it with `peer` if unknown (navigation into
    /// a chat the list has not seen). Returns the canonical id.
    pub fn ensure_conversation(&mut self, id: &ConversationId, peer: PeerProfile) -> ConversationId {
        if let Some(existing) = self.locate(id, Some(&peer.id)) {
            return existing;
        }
        self.insert_conversation(Conversation::new(id.clone(), peer));
        self.commit(std::slice::from_ref(id));
        id.clone()
    }

    /// Conversation with `peer`, creating a provisional one if none exists.
    pub fn ensure_for_peer(&mut self, peer: PeerProfile) -> ConversationId {
        if let Some(existing) = self.by_peer.get(&peer.id) {
            return existing.clone();
        }
        let id = ConversationId::provisional(&peer.id);
        self.insert_conversation(Conversation::new(id.clone(), peer));
        self.commit(std::slice::from_ref(&id));
        id
    }

    /// Canonical id for `id`, following aliases.
    pub fn resolve(&self, id: &ConversationId) -> Option<ConversationId> {
        let canonical = resolve_alias(&self.aliases, id);
        self.conversations.contains_key(&canonical).then_some(canonical)
    }

    /// Conversation `id` (aliases resolved).
    pub fn select(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.get(&resolve_alias(&self.aliases, id))
    }

    /// Conversation with `peer`.
    pub fn select_by_peer(&self, peer: &PeerId) -> Option<&Conversation> {
        self.by_peer.get(peer).and_then(|id| self.conversations.get(id))
    }

    /// Active chats, most recent message first.
    pub fn select_active_chats(&self) -> Vec<ActiveChat> {
        let mut conversations: Vec<&Conversation> = self.conversations.values().collect();
        conversations.sort_by(|a, b| {
            let a_at = a.last_message().map(|m| m.sent_at);
            let b_at = b.last_message().map(|m| m.sent_at);
            b_at.cmp(&a_at).then_with(|| a.id.cmp(&b.id))
        });
        conversations.into_iter().map(Conversation::active_chat).collect()
    }

    /// Sum of unread counts.
    pub fn total_unread(&self) -> u32 {
        self.total_unread
    }

    /// All conversations, unordered.
    pub fn conversations(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.values()
    }

    /// Number of conversations.
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    /// Whether the store holds no conversations.
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Local message `client_ref` and the conversation holding it.
    pub fn find_local(&self, client_ref: &MessageId) -> Option<(&ConversationId, &Message)> {
        self.conversations.values().find_map(|c| {
            c.messages.iter().find(|m| m.is_local() && &m.id == client_ref).map(|m| (&c.id, m))
        })
    }

    /// Subscribe to conversation `id`.
    ///
    /// The receiver starts with the current value (`None` if unknown) and
    /// keeps tracking the conversation across id reassignment. Dropping it
    /// unsubscribes; subscribing again restarts from current state.
    pub fn observe_conversation(&mut self, id: &ConversationId) -> watch::Receiver<Option<Conversation>> {
        let current = self.select(id).cloned();
        let tx = self.watchers.entry(id.clone()).or_insert_with(|| watch::channel(None).0);
        tx.send_replace(current);
        tx.subscribe()
    }

    /// Subscribe to the chat list and unread total.
    pub fn observe_chats(&self) -> watch::Receiver<ChatList> {
        self.chats.subscribe()
    }

    fn mark_read_where(
        &mut self,
        conversation_id: &ConversationId,
        up_to: &MessageId,
        read_at: u64,
        applies: impl Fn(&Message) -> bool,
    ) -> Result<bool, ReconciliationConflict> {
        let target = self
            .resolve(conversation_id)
            .ok_or_else(|| ReconciliationConflict::UnknownConversation(conversation_id.clone()))?;
        let Some(conversation) = self.conversations.get_mut(&target) else {
            return Err(ReconciliationConflict::UnknownConversation(target));
        };
        let Some(end) = conversation.position(up_to) else {
            return Err(ReconciliationConflict::UnknownMessage {
                conversation_id: target,
                message_id: up_to.clone(),
            });
        };

        let mut changed = false;
        for message in &mut conversation.messages[..=end] {
            if message.read_at.is_none() && applies(message) {
                message.read_at = Some(read_at);
                changed = true;
            }
        }

        if changed {
            self.commit(std::slice::from_ref(&target));
        }
        Ok(changed)
    }

    /// Canonical conversation for `id`, or for `peer` when the id is new.
    ///
    /// A provisional conversation for `peer` takes over `id`. Any other
    /// conversation for `peer` absorbs `id` as an alias.
    fn locate(&mut self, id: &ConversationId, peer: Option<&PeerId>) -> Option<ConversationId> {
        if let Some(existing) = self.resolve(id) {
            return Some(existing);
        }

        let existing = self.by_peer.get(peer?)?.clone();
        if existing.is_provisional() && !id.is_provisional() {
            tracing::debug!(provisional = %existing, assigned = %id, "server assigned conversation id");
            self.merge_into(&existing, id);
            return Some(id.clone());
        }

        let conflict =
            ReconciliationConflict::DuplicateConversation { existing: existing.clone(), incoming: id.clone() };
        tracing::debug!(%conflict, "aliasing to existing conversation");
        self.aliases.insert(id.clone(), existing.clone());
        Some(existing)
    }

    /// Move conversation `from` under id `into`, merging messages if `into`
    /// exists. `from` stays resolvable as an alias.
    fn merge_into(&mut self, from: &ConversationId, into: &ConversationId) {
        let Some(mut source) = self.conversations.remove(from) else {
            return;
        };
        if self.by_peer.get(&source.peer.id) == Some(from) {
            self.by_peer.remove(&source.peer.id);
        }

        match self.conversations.get_mut(into) {
            Some(target) => {
                for mut message in source.messages {
                    message.conversation_id = into.clone();
                    let _ = merge_message(target, message);
                }
            },
            None => {
                source.id = into.clone();
                for message in &mut source.messages {
                    message.conversation_id = into.clone();
                }
                self.insert_conversation(source);
            },
        }

        self.aliases.insert(from.clone(), into.clone());
    }

    /// Re-key conversation `target` under `peer` in the peer index.
    ///
    /// If another conversation already belongs to `peer`, the two are folded
    /// into one: a provisional conversation yields to `target`, otherwise
    /// `target` folds into the existing one. Returns the surviving id. The
    /// caller updates the surviving conversation's profile.
    fn assign_peer(&mut self, target: &ConversationId, peer: &PeerId) -> ConversationId {
        let Some(current) = self.conversations.get(target).map(|c| c.peer.id.clone()) else {
            return target.clone();
        };
        if current == *peer {
            return target.clone();
        }
        if self.by_peer.get(&current) == Some(target) {
            self.by_peer.remove(&current);
        }

        match self.by_peer.get(peer).cloned() {
            Some(existing) if existing != *target => {
                let conflict = ReconciliationConflict::DuplicateConversation {
                    existing: existing.clone(),
                    incoming: target.clone(),
                };
                if existing.is_provisional() && !target.is_provisional() {
                    tracing::debug!(%conflict, "server conversation replaces provisional one");
                    self.merge_into(&existing, target);
                    self.index_peer(peer, target);
                    target.clone()
                } else {
                    tracing::debug!(%conflict, "folding into existing conversation for peer");
                    self.merge_into(target, &existing);
                    existing
                }
            },
            _ => {
                self.index_peer(peer, target);
                target.clone()
            },
        }
    }

    fn insert_conversation(&mut self, conversation: Conversation) {
        let id = conversation.id.clone();
        let peer = conversation.peer.id.clone();
        self.conversations.insert(id.clone(), conversation);
        self.index_peer(&peer, &id);
    }

    fn index_peer(&mut self, peer: &PeerId, id: &ConversationId) {
        // Conversations whose peer is not known yet are not indexed.
        if !peer.as_str().is_empty() {
            self.by_peer.insert(peer.clone(), id.clone());
        }
    }

    /// Recompute derived state for `touched`, then publish.
    fn commit(&mut self, touched: &[ConversationId]) {
        for id in touched {
            if let Some(conversation) = self.conversations.get_mut(id) {
                self.tracker.recompute(conversation);
            }
        }
        self.total_unread = self.tracker.total(self.conversations.values());

        let touched: HashSet<&ConversationId> = touched.iter().collect();
        self.watchers.retain(|_, tx| tx.receiver_count() > 0);
        for (key, tx) in &self.watchers {
            let canonical = resolve_alias(&self.aliases, key);
            if !touched.contains(key) && !touched.contains(&canonical) {
                continue;
            }
            let next = self.conversations.get(&canonical).cloned();
            tx.send_if_modified(|current| {
                if *current == next {
                    return false;
                }
                *current = next;
                true
            });
        }

        let list = ChatList { chats: self.select_active_chats(), total_unread: self.total_unread };
        self.chats.send_if_modified(|current| {
            if *current == list {
                return false;
            }
            *current = list;
            true
        });
    }
}

fn resolve_alias(aliases: &HashMap<ConversationId, ConversationId>, id: &ConversationId) -> ConversationId {
    let mut current = id;
    for _ in 0..MAX_ALIAS_HOPS {
        match aliases.get(current) {
            Some(next) => current = next,
            None => break,
        }
    }
    current.clone()
}

/// Merge one incoming message into `conversation`, deduplicating by id and
/// replacing the optimistic copy named by its `client_ref`.
fn merge_message(conversation: &mut Conversation, incoming: Message) -> AppendKind {
    if let Some(index) = conversation.position(&incoming.id) {
        let existing = &mut conversation.messages[index];
        if existing.read_at.is_none() {
            existing.read_at = incoming.read_at;
        }
        // A late sequence number can move the message
        if existing.seq.is_none() && incoming.seq.is_some() && !existing.is_local() {
            let mut moved = conversation.messages.remove(index);
            moved.seq = incoming.seq;
            conversation.insert_ordered(moved);
        }
        return AppendKind::Duplicate;
    }

    if let Some(client_ref) = &incoming.client_ref {
        let local = conversation.messages.iter().position(|m| m.is_local() && &m.id == client_ref);
        if let Some(index) = local {
            conversation.messages.remove(index);
            let mut incoming = incoming;
            incoming.delivery = Delivery::Sent;
            conversation.insert_ordered(incoming);
            return AppendKind::Replaced;
        }
    }

    conversation.insert_ordered(incoming);
    AppendKind::Inserted
}

/// Make the snapshot authoritative for unread: of the unread peer messages
/// that came with the snapshot, keep the newest `unread_count` unread and
/// mark the older ones read at their send time.
fn seed_read_state(
    conversation: &mut Conversation,
    snapshot_ids: &HashSet<MessageId>,
    self_id: &PeerId,
    unread_count: u32,
) {
    let keep = usize::try_from(unread_count).unwrap_or(usize::MAX);
    let candidates: Vec<usize> = conversation
        .messages
        .iter()
        .enumerate()
        .filter(|(_, m)| {
            snapshot_ids.contains(&m.id) && &m.sender_id != self_id && m.read_at.is_none()
        })
        .map(|(i, _)| i)
        .collect();

    let seeded = candidates.len().saturating_sub(keep);
    for &index in &candidates[..seeded] {
        let message = &mut conversation.messages[index];
        message.read_at = Some(message.sent_at);
    }
}
