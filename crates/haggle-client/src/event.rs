//! Session events and actions.

use haggle_core::{ConnectionError, FetchError};
use haggle_proto::{ChatSnapshot, ConversationId, Handshake, InboundEvent, MessageId, OutboundFrame, PeerProfile};

/// Results and signals the driver feeds into the session.
///
/// Every I/O result carries the epoch of the request that produced it. The
/// session ignores results from an earlier epoch, so nothing started before
/// `stop()` can mutate state after it.
///
/// Generic over `I` (Instant type) to support both production
/// (`std::time::Instant`) and simulation (virtual) clocks.
#[derive(Debug, Clone)]
pub enum SessionEvent<I = std::time::Instant> {
    /// `GET /conversation/last-chats` completed.
    LastChatsFetched {
        /// Epoch of the request.
        epoch: u64,
        /// Conversations, or why the fetch failed.
        result: Result<Vec<ChatSnapshot>, FetchError>,
    },

    /// `GET /conversation/peer/{id}` completed.
    PeerFetched {
        /// Epoch of the request.
        epoch: u64,
        /// Conversation enriched.
        conversation_id: ConversationId,
        /// Peer profile, or why the fetch failed.
        result: Result<PeerProfile, FetchError>,
    },

    /// The realtime transport failed to open or dropped.
    TransportFailed {
        /// Epoch of the connection.
        epoch: u64,
        /// Transport generation from [`SessionAction::OpenRealtime`].
        generation: u64,
        /// What went wrong.
        error: ConnectionError,
    },

    /// A realtime frame arrived.
    FrameReceived {
        /// Epoch of the connection.
        epoch: u64,
        /// Transport generation from [`SessionAction::OpenRealtime`].
        generation: u64,
        /// Decoded frame.
        event: InboundEvent,
    },

    /// A transmit action failed.
    TransmitFailed {
        /// Epoch of the transmit.
        epoch: u64,
        /// Local id of the message, if the frame was a send.
        client_ref: Option<MessageId>,
        /// Driver explanation.
        reason: String,
    },

    /// Time tick for timeouts, retries and backoff.
    Tick {
        /// Current time from the driver.
        now: I,
    },
}

impl<I> SessionEvent<I> {
    /// Epoch the event belongs to. `None` for ticks.
    pub fn epoch(&self) -> Option<u64> {
        match self {
            Self::LastChatsFetched { epoch, .. }
            | Self::PeerFetched { epoch, .. }
            | Self::TransportFailed { epoch, .. }
            | Self::FrameReceived { epoch, .. }
            | Self::TransmitFailed { epoch, .. } => Some(*epoch),
            Self::Tick { .. } => None,
        }
    }

    /// Transport generation, for events raised by a realtime transport.
    pub fn generation(&self) -> Option<u64> {
        match self {
            Self::TransportFailed { generation, .. } | Self::FrameReceived { generation, .. } => Some(*generation),
            _ => None,
        }
    }
}

/// Actions the session asks the driver to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Start `GET /conversation/last-chats`; deliver
    /// [`SessionEvent::LastChatsFetched`].
    FetchLastChats {
        /// Epoch to echo back.
        epoch: u64,
    },

    /// Start `GET /conversation/peer/{id}`; deliver
    /// [`SessionEvent::PeerFetched`].
    FetchPeer {
        /// Epoch to echo back.
        epoch: u64,
        /// Shell conversation.
        conversation_id: ConversationId,
    },

    /// Open the realtime transport and send the handshake. Deliver frames as
    /// [`SessionEvent::FrameReceived`] and failures as
    /// [`SessionEvent::TransportFailed`].
    OpenRealtime {
        /// Epoch to echo back.
        epoch: u64,
        /// Transport generation to echo back. Each open within an epoch gets
        /// a new one, so a late failure from a replaced socket is told apart
        /// from the live one.
        generation: u64,
        /// Hello payload.
        handshake: Handshake,
    },

    /// Close the realtime transport. No further events for `epoch`.
    CloseRealtime {
        /// Epoch being closed.
        epoch: u64,
    },

    /// Send a frame on the realtime transport.
    Transmit {
        /// Epoch of the connection.
        epoch: u64,
        /// Frame to send.
        frame: OutboundFrame,
    },
}
