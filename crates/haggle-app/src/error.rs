//! Runtime errors.

use thiserror::Error;

/// Fatal runtime failure. Session-level failures are never fatal and are
/// reported through [`haggle_client::ChatSession::last_error`] instead.
#[derive(Error, Debug)]
pub enum RuntimeError<E> {
    /// The driver could not produce input.
    #[error("driver error: {0}")]
    Driver(#[source] E),
}
