//! Error taxonomy for the chat core.
//!
//! None of these are fatal to the process. Connection and fetch errors are
//! reported upward as state; send failures become a per-message flag;
//! reconciliation conflicts are resolved locally and only logged.

use std::time::Duration;

use haggle_proto::{ConversationId, MessageId, ProtocolError};
use thiserror::Error;

/// Realtime transport or handshake failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Network or socket failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Handshake did not complete within timeout.
    #[error("handshake timeout after {elapsed:?}")]
    HandshakeTimeout {
        /// How long we waited.
        elapsed: Duration,
    },

    /// Server rejected the session credentials.
    #[error("unauthorized: {reason}")]
    Unauthorized {
        /// Server explanation.
        reason: String,
    },

    /// Bounded retry policy gave up.
    #[error("gave up after {attempts} reconnection attempts")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
    },

    /// No authenticated profile is available.
    #[error("no authenticated profile")]
    NoProfile,
}

impl ConnectionError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Authentication failures are never transient: retrying with the same
    /// credentials cannot succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::HandshakeTimeout { .. })
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(err: ProtocolError) -> Self {
        Self::Transport(err.to_string())
    }
}

/// REST fetch failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Server answered with a non-success status.
    #[error("http status {status}")]
    Http {
        /// HTTP status code.
        status: u16,
    },

    /// Request never completed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Body did not decode.
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<ProtocolError> for FetchError {
    fn from(err: ProtocolError) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Message transmission failure.
///
/// The message stays in the store flagged [`haggle_proto::Delivery::Failed`].
/// Retrying is a user action, never automatic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendFailure {
    /// Realtime connection is not established.
    #[error("not connected")]
    NotConnected,

    /// Transport refused the frame.
    #[error("transport error: {0}")]
    Transport(String),

    /// Server never acknowledged the message.
    #[error("no acknowledgement within {0:?}")]
    AckTimeout(Duration),

    /// Server rejected the message.
    #[error("rejected: {0}")]
    Rejected(String),

    /// No retryable local message with this id.
    #[error("no local message {0}")]
    UnknownMessage(MessageId),
}

/// Duplicate or out-of-order input detected while merging state.
///
/// Always resolved locally. Surfaced only to logs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationConflict {
    /// Message id already present in the conversation.
    #[error("duplicate message {message_id} in {conversation_id}")]
    DuplicateMessage {
        /// Conversation.
        conversation_id: ConversationId,
        /// Duplicate id.
        message_id: MessageId,
    },

    /// Server reported a second conversation for a peer that already has one.
    #[error("conversation {incoming} duplicates {existing}")]
    DuplicateConversation {
        /// Conversation already in the store.
        existing: ConversationId,
        /// Conversation the server referenced.
        incoming: ConversationId,
    },

    /// Enrichment arrived for a conversation that no longer needs it.
    #[error("stale enrichment for {0}")]
    StaleEnrichment(ConversationId),

    /// Event referenced a conversation the store does not hold.
    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),

    /// Event referenced a message the conversation does not hold.
    #[error("unknown message {message_id} in {conversation_id}")]
    UnknownMessage {
        /// Conversation.
        conversation_id: ConversationId,
        /// Missing id.
        message_id: MessageId,
    },
}
