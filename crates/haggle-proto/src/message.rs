//! Peer and message payloads shared by REST and realtime channels.

use serde::{Deserialize, Serialize};

use crate::{ConversationId, MessageId, PeerId};

/// Immutable identity of a chat counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerProfile {
    /// Stable user id.
    pub id: PeerId,
    /// Display name.
    pub name: String,
    /// Avatar URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl PeerProfile {
    /// Profile with only an id known. Used for shell conversations until
    /// enrichment fills in the rest.
    pub fn placeholder(id: PeerId) -> Self {
        Self { name: id.to_string(), id, avatar: None }
    }
}

/// Local delivery state of a message.
///
/// Never serialized: the server only ever sees [`Delivery::Sent`] messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Delivery {
    /// Acknowledged by the server (or received from it).
    #[default]
    Sent,
    /// Optimistically shown, transmitted, awaiting acknowledgement.
    Pending,
    /// Transmission failed or was never possible. Retry is user-triggered.
    Failed,
}

/// A chat message.
///
/// # Invariants
///
/// - `id` is unique within `conversation_id`.
/// - `seq` is assigned by the server and orders messages within a
///   conversation. Optimistic local messages have no `seq` until acknowledged.
/// - `sent_at` is the sender's wall clock in Unix milliseconds. It is NOT a
///   reliable ordering key across clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message id (server-assigned, or a local id while optimistic).
    pub id: MessageId,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Author.
    pub sender_id: PeerId,
    /// Message text.
    pub text: String,
    /// Sender wall clock, Unix milliseconds.
    pub sent_at: u64,
    /// When the message was read, Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<u64>,
    /// Server-assigned ordering sequence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Local id the sender used before acknowledgement, echoed by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<MessageId>,
    /// Local delivery state.
    #[serde(skip)]
    pub delivery: Delivery,
}

impl Message {
    /// Whether the message has been read.
    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }

    /// Whether the message is an unacknowledged local send.
    pub fn is_local(&self) -> bool {
        self.delivery != Delivery::Sent
    }
}
