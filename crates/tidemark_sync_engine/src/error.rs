//! Error types for the sync engine.

use thiserror::Error;
use tidemark_sync_protocol::ProtocolError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// None of these reach the application directly while connected: the retry
/// loops absorb them and surface their message through the sync status.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The service answered with a non-success status.
    #[error("http error {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// The service rejected the credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The connector did not supply credentials.
    #[error("no credentials available")]
    NoCredentials,

    /// Protocol violation (unexpected instruction, invalid message format).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The storage collaborator failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// The upload callback failed.
    #[error("upload error: {0}")]
    Upload(String),

    /// A write-queue item was uploaded but its batch was never completed.
    #[error("crud item {client_id} was uploaded but not completed")]
    CrudItemNotCompleted {
        /// Client id of the stuck item.
        client_id: i64,
    },

    /// Operation was cancelled.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Creates an upload error.
    pub fn upload(message: impl Into<String>) -> Self {
        Self::Upload(message.into())
    }

    /// Returns true if the error means cached credentials must be dropped.
    pub fn invalidates_credentials(&self) -> bool {
        matches!(self, SyncError::Unauthorized(_))
            || matches!(self, SyncError::Http { status: 401, .. })
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failure() {
        assert_eq!(
            SyncError::transport("connection reset").to_string(),
            "transport error: connection reset"
        );
        assert_eq!(
            SyncError::CrudItemNotCompleted { client_id: 3 }.to_string(),
            "crud item 3 was uploaded but not completed"
        );
    }

    #[test]
    fn unauthorized_invalidates_credentials() {
        assert!(SyncError::Unauthorized("expired".into()).invalidates_credentials());
        assert!(SyncError::Http {
            status: 401,
            body: String::new()
        }
        .invalidates_credentials());
        assert!(!SyncError::NoCredentials.invalidates_credentials());
    }

    #[test]
    fn protocol_errors_convert() {
        let err: SyncError = ProtocolError::invalid_structure("bad").into();
        assert!(matches!(err, SyncError::Protocol(_)));
        assert_eq!(err.to_string(), "protocol error: invalid structure: bad");
    }
}
