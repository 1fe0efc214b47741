//! The application's side of the connection: credentials and uploads.

use crate::error::SyncResult;
use crate::storage::BucketStorage;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::SystemTime;

/// Endpoint and token used to reach the sync service.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Base URL of the service, without a trailing slash.
    pub endpoint: String,
    /// Bearer token.
    pub token: String,
    /// When the token expires, if known.
    pub expires_at: Option<SystemTime>,
}

impl Credentials {
    /// Creates credentials without an expiry.
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        let endpoint: String = endpoint.into();
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.into(),
            expires_at: None,
        }
    }

    /// Sets the expiry.
    pub fn with_expires_at(mut self, expires_at: SystemTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("endpoint", &self.endpoint)
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Implemented by the application to connect the engine to its backend.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Returns credentials for the sync service, or `None` if the user is
    /// signed out.
    async fn fetch_credentials(&self) -> SyncResult<Option<Credentials>>;

    /// Called when the service rejected the current credentials.
    async fn invalidate_credentials(&self) {}

    /// Uploads queued writes to the application backend.
    ///
    /// Implementations take batches or transactions from `storage` and
    /// complete them once the backend accepted the writes.
    async fn upload_data(&self, storage: &Arc<BucketStorage>) -> SyncResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_is_normalized() {
        let credentials = Credentials::new("https://sync.example.com/", "secret");
        assert_eq!(credentials.endpoint, "https://sync.example.com");
    }

    #[test]
    fn debug_hides_token() {
        let credentials = Credentials::new("https://sync.example.com", "secret");
        assert!(!format!("{credentials:?}").contains("secret"));
    }
}
