//! Deterministic simulation harness for Haggle chat.
//!
//! Virtual-clock implementations of the Environment and Driver traits for
//! deterministic, reproducible testing of reconnection, reconciliation and
//! the session runtime.
//!
//! # Invariant Testing
//!
//! The `invariants` module provides behavioral testing through invariant
//! checks over store snapshots. Invariants verify WHAT must be true after
//! every step, not specific scenarios. Use [`InvariantRegistry::standard()`]
//! for the store invariants.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod invariants;
pub mod sim_driver;
pub mod sim_env;

pub use invariants::{
    Invariant, InvariantKind, InvariantRegistry, InvariantResult, MessagesOrdered,
    OneConversationPerPeer, StoreSnapshot, TotalUnreadConsistent, UniqueConversationIds,
    UniqueMessageIds, UnreadMatchesDerivation, Violation,
};
pub use sim_driver::{DriverRequest, SimDriver, SimDriverError};
pub use sim_env::{SIM_EPOCH_MILLIS, SimEnv, SimInstant};
