//! Configuration for the sync engine.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Delay between failed sync or upload attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(5000);

/// Minimum gap between two upload-loop triggers.
pub const DEFAULT_CRUD_THROTTLE: Duration = Duration::from_millis(1000);

/// Number of saved operations after which superseded REMOVE operations are cleared.
pub const COMPACT_OPERATION_INTERVAL: i64 = 1000;

/// Options for one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
    /// Client parameters forwarded to the service's sync rules.
    pub params: Option<Map<String, Value>>,
    /// Application metadata forwarded to the service logs.
    pub app_metadata: BTreeMap<String, String>,
    /// Delay between failed attempts.
    pub retry_delay: Duration,
    /// Minimum gap between two upload-loop triggers.
    pub crud_throttle: Duration,
    /// Whether streams marked as default on the service are synced.
    pub include_default_streams: bool,
    /// Value of the `X-User-Agent` header.
    pub user_agent: String,
}

impl SyncOptions {
    /// Creates options with default values.
    pub fn new() -> Self {
        Self {
            params: None,
            app_metadata: BTreeMap::new(),
            retry_delay: DEFAULT_RETRY_DELAY,
            crud_throttle: DEFAULT_CRUD_THROTTLE,
            include_default_streams: true,
            user_agent: format!("tidemark-rust/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Sets the client parameters.
    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = Some(params);
        self
    }

    /// Adds one application metadata entry.
    pub fn with_app_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.app_metadata.insert(key.into(), value.into());
        self
    }

    /// Sets the retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets the upload trigger throttle.
    pub fn with_crud_throttle(mut self, throttle: Duration) -> Self {
        self.crud_throttle = throttle;
        self
    }

    /// Sets whether default streams are synced.
    pub fn with_include_default_streams(mut self, include: bool) -> Self {
        self.include_default_streams = include;
        self
    }

    /// Sets the user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Options for a stream subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// How long the subscription outlives its last handle.
    pub ttl: Option<Duration>,
    /// Priority override for the stream.
    pub priority: Option<i32>,
}

impl SubscribeOptions {
    /// Creates options without ttl or priority.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the time-to-live.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_options_builder() {
        let mut params = Map::new();
        params.insert("team".into(), Value::String("a".into()));

        let options = SyncOptions::new()
            .with_params(params)
            .with_app_metadata("build", "42")
            .with_retry_delay(Duration::from_millis(10))
            .with_include_default_streams(false);

        assert_eq!(options.params.unwrap()["team"], "a");
        assert_eq!(options.app_metadata["build"], "42");
        assert_eq!(options.retry_delay, Duration::from_millis(10));
        assert_eq!(options.crud_throttle, DEFAULT_CRUD_THROTTLE);
        assert!(!options.include_default_streams);
    }

    #[test]
    fn defaults() {
        let options = SyncOptions::default();
        assert_eq!(options.retry_delay, Duration::from_secs(5));
        assert!(options.include_default_streams);
        assert!(options.user_agent.starts_with("tidemark-rust/"));

        let subscribe = SubscribeOptions::new().with_priority(1);
        assert_eq!(subscribe.priority, Some(1));
        assert_eq!(subscribe.ttl, None);
    }
}
