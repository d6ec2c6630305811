//! Headless Haggle client
//!
//! Runs a chat session against a real backend: REST over reqwest, realtime
//! over tokio-tungstenite. Commands come from stdin; chat list and badge
//! changes go to the log.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod commands;
mod net_driver;
mod system_env;

pub use net_driver::{NetConfig, NetDriver, NetError};
pub use system_env::SystemEnv;
