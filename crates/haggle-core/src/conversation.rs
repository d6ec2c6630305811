//! Conversation model and the list-view projection.

use std::cmp::Ordering;

use haggle_proto::{ConversationId, Message, MessageId, PeerProfile};

/// A thread of messages between the session user and one peer.
///
/// # Invariants
///
/// - Message ids are unique.
/// - `messages` is sorted by [`message_order`], newest last.
/// - `unread_count` is derived by [`crate::UnreadTracker`] after every store
///   mutation. Never written by anything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    /// Conversation id. Provisional ids (see
    /// [`ConversationId::provisional`]) are replaced once the server assigns
    /// one.
    pub id: ConversationId,
    /// The counterpart.
    pub peer: PeerProfile,
    /// Messages, oldest first.
    pub messages: Vec<Message>,
    /// Messages from the peer not yet read by the session user.
    pub unread_count: u32,
    /// Created from an event referencing an unknown conversation; the peer
    /// profile is a placeholder until enrichment completes.
    pub shell: bool,
}

impl Conversation {
    /// Empty conversation with a known peer.
    pub fn new(id: ConversationId, peer: PeerProfile) -> Self {
        Self { id, peer, messages: Vec::new(), unread_count: 0, shell: false }
    }

    /// Empty conversation whose peer is only a placeholder.
    pub fn shell(id: ConversationId, peer: PeerProfile) -> Self {
        Self { shell: true, ..Self::new(id, peer) }
    }

    /// Most recent message.
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Whether the server has not assigned an id yet.
    pub fn is_provisional(&self) -> bool {
        self.id.is_provisional()
    }

    /// Index of message `id`.
    pub fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    /// Whether message `id` is present.
    pub fn contains(&self, id: &MessageId) -> bool {
        self.position(id).is_some()
    }

    /// Insert preserving order. Equal keys keep arrival order.
    ///
    /// Does not check for duplicates; callers dedupe by id first.
    pub fn insert_ordered(&mut self, message: Message) -> usize {
        let index =
            self.messages.partition_point(|m| message_order(m, &message) != Ordering::Greater);
        self.messages.insert(index, message);
        index
    }

    /// List-view projection.
    pub fn active_chat(&self) -> ActiveChat {
        ActiveChat {
            id: self.id.clone(),
            peer: self.peer.clone(),
            last_message: self.last_message().cloned(),
            unread_count: self.unread_count,
        }
    }
}

/// Order of messages within a conversation.
///
/// Server messages sort by sequence, then by sender clock for messages the
/// server sent without one. Unacknowledged local messages always sort after
/// server messages: their final position is only known once acknowledged.
pub fn message_order(a: &Message, b: &Message) -> Ordering {
    a.is_local()
        .cmp(&b.is_local())
        .then(a.seq.cmp(&b.seq))
        .then(a.sent_at.cmp(&b.sent_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Lightweight projection of a [`Conversation`] for list views.
///
/// Derived on every publish, never mutated on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveChat {
    /// Conversation id.
    pub id: ConversationId,
    /// The counterpart.
    pub peer: PeerProfile,
    /// Most recent message.
    pub last_message: Option<Message>,
    /// Unread messages.
    pub unread_count: u32,
}

/// Chat list as pushed to list and badge observers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatList {
    /// Active chats, most recent first.
    pub chats: Vec<ActiveChat>,
    /// Sum of unread counts.
    pub total_unread: u32,
}
