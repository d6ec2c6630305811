//! Realtime connection frames.
//!
//! Frames are JSON text messages, adjacently tagged by event name:
//!
//! ```text
//! {"event":"new-message","data":{"conversationId":"c1","message":{...}}}
//! ```
//!
//! # Handshake
//!
//! The client opens the connection and sends [`OutboundFrame::Hello`] carrying
//! the authenticated profile. The server answers with
//! [`InboundEvent::Welcome`] or [`InboundEvent::Unauthorized`]. Only after
//! `Welcome` are the dispatchable events ([`EventKind`]) delivered.

use serde::{Deserialize, Serialize};

use crate::{
    ChatSnapshot, ConversationId, Message, MessageId, PeerId, PeerProfile, ProtocolError, Result,
};

/// Event kinds handlers can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A message was posted to a conversation.
    NewMessage,
    /// Messages were read up to some id.
    ReadReceipt,
    /// A peer went online or offline.
    Presence,
    /// The server created a conversation.
    ConversationCreated,
    /// The server accepted one of our sends.
    MessageAck,
    /// The server rejected one of our sends.
    SendRejected,
}

/// Handshake payload identifying the session user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Authenticated profile of the session user.
    pub profile: PeerProfile,
    /// Bearer token issued by the auth service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Frames pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum InboundEvent {
    /// Handshake accepted.
    #[serde(rename_all = "camelCase")]
    Welcome {
        /// Server-side session id.
        session_id: String,
    },

    /// Handshake rejected. Terminal for the session.
    #[serde(rename_all = "camelCase")]
    Unauthorized {
        /// Server explanation.
        reason: String,
    },

    /// A message was posted.
    #[serde(rename_all = "camelCase")]
    NewMessage {
        /// Owning conversation.
        conversation_id: ConversationId,
        /// The message.
        message: Message,
        /// Counterpart profile, when the server includes it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer: Option<PeerProfile>,
    },

    /// Messages were read up to and including `message_id`.
    #[serde(rename_all = "camelCase")]
    ReadReceipt {
        /// Conversation the receipt applies to.
        conversation_id: ConversationId,
        /// Last message read.
        message_id: MessageId,
        /// Who read. Absent means the session user.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reader_id: Option<PeerId>,
        /// Read time, Unix milliseconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        read_at: Option<u64>,
    },

    /// Peer presence changed.
    #[serde(rename_all = "camelCase")]
    Presence {
        /// The peer.
        peer_id: PeerId,
        /// Whether the peer is online.
        online: bool,
    },

    /// A conversation was created server-side.
    #[serde(rename_all = "camelCase")]
    ConversationCreated {
        /// The new conversation.
        conversation: ChatSnapshot,
    },

    /// A send was accepted and assigned a server id.
    #[serde(rename_all = "camelCase")]
    MessageAck {
        /// Local id used when sending.
        client_ref: MessageId,
        /// Server copy of the message.
        message: Message,
        /// Counterpart profile, present when the send created the thread.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer: Option<PeerProfile>,
    },

    /// A send was rejected by the server.
    #[serde(rename_all = "camelCase")]
    SendRejected {
        /// Local id used when sending.
        client_ref: MessageId,
        /// Server explanation.
        reason: String,
    },
}

impl InboundEvent {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| {
            if e.is_data() && e.to_string().contains("unknown variant") {
                ProtocolError::UnknownEvent(e.to_string())
            } else {
                ProtocolError::Malformed(e.to_string())
            }
        })
    }

    /// Encode as a text frame.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Dispatchable kind. `None` for handshake frames, which the connection
    /// manager consumes itself.
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            Self::Welcome { .. } | Self::Unauthorized { .. } => None,
            Self::NewMessage { .. } => Some(EventKind::NewMessage),
            Self::ReadReceipt { .. } => Some(EventKind::ReadReceipt),
            Self::Presence { .. } => Some(EventKind::Presence),
            Self::ConversationCreated { .. } => Some(EventKind::ConversationCreated),
            Self::MessageAck { .. } => Some(EventKind::MessageAck),
            Self::SendRejected { .. } => Some(EventKind::SendRejected),
        }
    }
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum OutboundFrame {
    /// Handshake.
    Hello(Handshake),

    /// Post a message.
    ///
    /// Exactly one of `conversation_id` and `peer_id` is set: `peer_id` starts
    /// a thread the server has not created yet.
    #[serde(rename_all = "camelCase")]
    SendMessage {
        /// Target conversation.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
        /// Target peer for a new thread.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<PeerId>,
        /// Local id, echoed back in the acknowledgement.
        client_ref: MessageId,
        /// Message text.
        text: String,
    },

    /// Mark messages read up to and including `message_id`.
    #[serde(rename_all = "camelCase")]
    MarkRead {
        /// Conversation.
        conversation_id: ConversationId,
        /// Last message read.
        message_id: MessageId,
    },

    /// Graceful close.
    Goodbye,
}

impl OutboundFrame {
    /// Encode as a text frame.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode a text frame. Used by simulated servers.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
