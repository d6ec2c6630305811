//! Haggle chat session
//!
//! Action-based session facade over the chat core. Starts and stops a
//! session for the authenticated user, routes realtime events into the
//! reconciliation engine, and exposes the operations screens call.
//!
//! # Architecture
//!
//! The session follows the same Sans-IO and action-based patterns as
//! [`haggle_core`]. It receives events ([`SessionEvent`]), processes them
//! through pure state machine logic, and returns actions ([`SessionAction`])
//! for the caller to execute.
//!
//! # Components
//!
//! - [`ChatSession`]: session state machine and screen-facing API
//! - [`SessionEvent`]: I/O results and ticks fed into the session
//! - [`SessionAction`]: fetches, socket operations and frames to transmit
//! - [`Observer`]: store slices for screens to subscribe to

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod error;
mod event;
mod session;

pub use error::SessionError;
pub use event::{SessionAction, SessionEvent};
pub use haggle_core::{
    ActiveChat, ChatList, ConnectionState, Conversation, env::Environment,
};
pub use session::{ChatSession, DEFAULT_ACK_TIMEOUT, Observer, SessionConfig, SessionIdentity};
