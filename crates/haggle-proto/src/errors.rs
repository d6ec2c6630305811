//! Protocol error types.

use thiserror::Error;

/// Result alias for wire encoding and decoding.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding or decoding wire payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload was not valid JSON or did not match the expected shape.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Frame carried an event tag this client does not understand.
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    /// Serialization failed.
    #[error("encode failed: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}
