//! Session errors.

use haggle_core::{ConnectionError, FetchError, SendFailure};
use haggle_proto::{ConversationId, MessageId};
use thiserror::Error;

/// Errors reported by [`crate::ChatSession`].
///
/// Returned from user-initiated operations and recorded as
/// [`crate::ChatSession::last_error`] for failures that arrive
/// asynchronously. Never fatal: the session keeps running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Realtime connection failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// REST fetch failure.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Message could not be sent.
    #[error(transparent)]
    Send(#[from] SendFailure),

    /// No session is running.
    #[error("session not started")]
    NotStarted,

    /// Conversation is not in the store.
    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),

    /// Message is not in the conversation.
    #[error("unknown message {message_id} in {conversation_id}")]
    UnknownMessage {
        /// Conversation searched.
        conversation_id: ConversationId,
        /// Missing message.
        message_id: MessageId,
    },
}
