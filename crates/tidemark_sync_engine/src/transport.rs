//! Authenticated requests to the sync service.

use crate::connector::{BackendConnector, Credentials};
use crate::error::{SyncError, SyncResult};
use crate::http::{HttpClient, HttpRequest, LineStream};
use std::sync::Arc;
use tidemark_sync_protocol::{StreamingSyncRequest, WriteCheckpointResponse};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Path of the streaming sync endpoint.
pub const SYNC_STREAM_PATH: &str = "/sync/stream";

/// Path of the write checkpoint endpoint.
pub const WRITE_CHECKPOINT_PATH: &str = "/write-checkpoint2.json";

/// Sync service client that manages credentials.
///
/// Credentials are fetched lazily from the connector and cached until the
/// service rejects them.
pub struct RemoteTransport {
    client: Arc<dyn HttpClient>,
    connector: Arc<dyn BackendConnector>,
    credentials: Mutex<Option<Credentials>>,
    user_agent: String,
}

/// Joins `endpoint` and `path` and appends the URL-encoded `query` pairs.
fn service_url(endpoint: &str, path: &str, query: &[(&str, &str)]) -> SyncResult<String> {
    let mut url = reqwest::Url::parse(&format!("{endpoint}{path}"))
        .map_err(|e| SyncError::transport(format!("invalid endpoint {endpoint}: {e}")))?;
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }
    Ok(url.into())
}

impl RemoteTransport {
    /// Creates a transport.
    pub fn new(
        client: Arc<dyn HttpClient>,
        connector: Arc<dyn BackendConnector>,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            client,
            connector,
            credentials: Mutex::new(None),
            user_agent: user_agent.into(),
        }
    }

    /// Returns cached credentials or fetches new ones.
    pub async fn credentials(&self) -> SyncResult<Credentials> {
        let mut cached = self.credentials.lock().await;
        if let Some(credentials) = cached.as_ref() {
            return Ok(credentials.clone());
        }
        let fetched = self
            .connector
            .fetch_credentials()
            .await?
            .ok_or(SyncError::NoCredentials)?;
        *cached = Some(fetched.clone());
        Ok(fetched)
    }

    /// Replaces the cached credentials with freshly fetched ones.
    ///
    /// Used ahead of token expiry so the next request does not wait.
    pub async fn prefetch_credentials(&self) -> SyncResult<Option<Credentials>> {
        let fetched = self.connector.fetch_credentials().await?;
        *self.credentials.lock().await = fetched.clone();
        Ok(fetched)
    }

    /// Drops cached credentials and tells the connector.
    pub async fn invalidate_credentials(&self) {
        self.credentials.lock().await.take();
        self.connector.invalidate_credentials().await;
    }

    async fn request(
        &self,
        path: &str,
        query: &[(&str, &str)],
        body: Option<serde_json::Value>,
    ) -> SyncResult<HttpRequest> {
        let credentials = self.credentials().await?;
        Ok(HttpRequest {
            url: service_url(&credentials.endpoint, path, query)?,
            token: credentials.token,
            user_agent: self.user_agent.clone(),
            body,
        })
    }

    async fn check<T>(&self, result: SyncResult<T>) -> SyncResult<T> {
        if let Err(err) = &result {
            if err.invalidates_credentials() {
                warn!(error = %err, "credentials rejected, invalidating");
                self.invalidate_credentials().await;
            }
        }
        result
    }

    /// Opens the streaming sync connection.
    pub async fn post_stream(&self, request: &StreamingSyncRequest) -> SyncResult<LineStream> {
        let body = serde_json::to_value(request)?;
        let request = self.request(SYNC_STREAM_PATH, &[], Some(body)).await?;
        debug!(url = %request.url, "opening sync stream");
        let result = self.client.post_stream(request).await;
        self.check(result).await
    }

    /// Fetches the write checkpoint covering every upload of `client_id`.
    pub async fn write_checkpoint(&self, client_id: &str) -> SyncResult<String> {
        let request = self
            .request(WRITE_CHECKPOINT_PATH, &[("client_id", client_id)], None)
            .await?;
        let result = self.client.get(request).await;
        let body = self.check(result).await?;
        let response: WriteCheckpointResponse = serde_json::from_slice(&body)?;
        debug!(
            write_checkpoint = %response.data.write_checkpoint,
            "fetched write checkpoint"
        );
        Ok(response.data.write_checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_values_are_encoded() {
        let url = service_url(
            "https://sync.example.com",
            WRITE_CHECKPOINT_PATH,
            &[("client_id", "a b&c=d")],
        )
        .unwrap();
        assert_eq!(
            url,
            "https://sync.example.com/write-checkpoint2.json?client_id=a+b%26c%3Dd"
        );
    }

    #[test]
    fn paths_without_query_are_joined() {
        let url = service_url("http://localhost:8080", SYNC_STREAM_PATH, &[]).unwrap();
        assert_eq!(url, "http://localhost:8080/sync/stream");
    }

    #[test]
    fn malformed_endpoint_is_a_transport_error() {
        let err = service_url("not a url", SYNC_STREAM_PATH, &[]).unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
    }
}
