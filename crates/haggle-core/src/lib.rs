//! Haggle chat core
//!
//! Synchronization core for marketplace chat: keeps conversations and unread
//! counts consistent while history arrives over REST and live updates arrive
//! over a persistent realtime connection.
//!
//! # Architecture
//!
//! Everything here is Sans-IO. Components consume events and time as inputs
//! and either mutate state or return actions for a driver to execute. No
//! component performs I/O, spawns tasks or reads a clock.
//!
//! # Components
//!
//! - [`RealtimeConnection`]: connection lifecycle, handshake, reconnection
//!   with capped backoff, handler registration
//! - [`ConversationStore`]: canonical conversations, messages, observers
//! - [`ReconciliationEngine`]: merges REST snapshots with live events
//! - [`UnreadTracker`]: unread counts as a pure derivation
//! - [`Environment`]: time and randomness, swapped out in simulation

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod connection;
pub mod conversation;
pub mod env;
pub mod error;
pub mod reconcile;
pub mod store;
pub mod unread;

pub use connection::{ConnectionAction, ConnectionConfig, ConnectionState, RealtimeConnection, Subscription};
pub use conversation::{ActiveChat, ChatList, Conversation};
pub use env::Environment;
pub use error::{ConnectionError, FetchError, ReconciliationConflict, SendFailure};
pub use reconcile::{DeliveryUpdate, ReconcileConfig, ReconciliationEngine};
pub use store::{AppendKind, AppendOutcome, ConversationStore, UnreadAuthority};
pub use unread::UnreadTracker;
