//! Application layer for Haggle
//!
//! Generic runtime that executes [`haggle_client::ChatSession`] actions
//! against a [`Driver`], so the same orchestration runs in the CLI and in
//! deterministic simulation.
//!
//! # Components
//!
//! - [`Driver`]: Trait for platform-specific I/O abstraction
//! - [`Runtime`]: Generic orchestration loop using Driver
//! - [`Command`]: User intents fed in through the driver

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod command;
mod driver;
mod error;
mod runtime;

pub use command::{Command, DriverInput};
pub use driver::Driver;
pub use error::RuntimeError;
pub use runtime::Runtime;
