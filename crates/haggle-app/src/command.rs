//! Inputs the runtime consumes.

use haggle_client::{SessionEvent, SessionIdentity};
use haggle_proto::{ConversationId, MessageId, PeerProfile};

/// User intent, produced by whatever frontend sits on top of the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start a session for an authenticated user.
    Start(SessionIdentity),
    /// End the session (logout).
    Stop,
    /// Navigate into a known conversation.
    Open {
        /// Conversation to open.
        conversation_id: ConversationId,
        /// Counterpart, from navigation parameters.
        peer: PeerProfile,
    },
    /// Navigate into the thread with a peer, creating it if needed.
    OpenWithPeer(PeerProfile),
    /// Send a message.
    Send {
        /// Target conversation.
        conversation_id: ConversationId,
        /// Message text.
        text: String,
    },
    /// Retransmit a failed message.
    Retry {
        /// Conversation holding the message.
        conversation_id: ConversationId,
        /// Local id of the failed message.
        message_id: MessageId,
    },
    /// Mark a conversation read.
    MarkRead {
        /// Conversation to mark.
        conversation_id: ConversationId,
        /// Last message read. Defaults to the latest.
        up_to: Option<MessageId>,
    },
    /// Stop the session and leave the run loop.
    Quit,
}

/// Everything a [`crate::Driver`] can hand to the runtime.
#[derive(Debug, Clone)]
pub enum DriverInput<I> {
    /// I/O result or realtime frame.
    Session(SessionEvent<I>),
    /// User command.
    Command(Command),
}

impl<I> From<Command> for DriverInput<I> {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}

impl<I> From<SessionEvent<I>> for DriverInput<I> {
    fn from(event: SessionEvent<I>) -> Self {
        Self::Session(event)
    }
}
