//! Error types for protocol encoding and decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding protocol messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The payload was not valid JSON for the expected type.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload was valid JSON but had an unexpected structure.
    #[error("invalid structure: {0}")]
    InvalidStructure(String),

    /// An operation type string was not recognized.
    #[error("unknown operation type: {0}")]
    UnknownOpType(String),
}

impl ProtocolError {
    /// Creates an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure(message.into())
    }
}
