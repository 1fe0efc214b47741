//! Test fixtures: stream lines and a wired-up connection manager.

use crate::connector::TestConnector;
use crate::http::ScriptedHttpClient;
use crate::memory::MemoryStorage;
use std::sync::Arc;
use std::time::Duration;
use tidemark_sync_engine::{ConnectionManager, SyncOptions};
use tidemark_sync_protocol::{
    BucketChecksum, Checkpoint, CheckpointComplete, OplogEntry, PartialCheckpointComplete,
    StreamingSyncLine, SyncDataBucket,
};

/// Installs a `tracing` subscriber honoring `RUST_LOG`. Safe to call often.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn encode(line: StreamingSyncLine) -> String {
    line.encode().expect("Failed to encode line")
}

/// A `checkpoint` line.
pub fn checkpoint_line(last_op_id: &str, buckets: Vec<BucketChecksum>) -> String {
    encode(StreamingSyncLine::Checkpoint(Checkpoint::new(
        last_op_id, buckets,
    )))
}

/// A `data` line.
pub fn data_line(bucket: &str, data: Vec<OplogEntry>) -> String {
    encode(StreamingSyncLine::Data(SyncDataBucket::new(bucket, data)))
}

/// A `checkpoint_complete` line.
pub fn checkpoint_complete_line(last_op_id: &str) -> String {
    encode(StreamingSyncLine::CheckpointComplete(CheckpointComplete {
        last_op_id: last_op_id.to_string(),
    }))
}

/// A `partial_checkpoint_complete` line.
pub fn partial_checkpoint_complete_line(last_op_id: &str, priority: i32) -> String {
    encode(StreamingSyncLine::PartialCheckpointComplete(
        PartialCheckpointComplete {
            last_op_id: last_op_id.to_string(),
            priority,
        },
    ))
}

/// A `token_expires_in` line.
pub fn token_expires_in_line(seconds: i64) -> String {
    encode(StreamingSyncLine::TokenExpiresIn(seconds))
}

/// Polls `condition` until it holds. Panics after five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within five seconds"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Options with short delays for tests.
pub fn fast_options() -> SyncOptions {
    SyncOptions::new()
        .with_retry_delay(Duration::from_millis(20))
        .with_crud_throttle(Duration::from_millis(5))
}

/// A connection manager over in-memory collaborators.
pub struct TestHarness {
    /// The storage collaborator.
    pub storage: Arc<MemoryStorage>,
    /// The HTTP client.
    pub http: Arc<ScriptedHttpClient>,
    /// The backend connector.
    pub connector: Arc<TestConnector>,
    /// The manager under test.
    pub manager: ConnectionManager,
}

impl TestHarness {
    /// Creates a harness with a fresh storage, client and connector.
    pub fn new() -> Self {
        init_tracing();
        let storage = Arc::new(MemoryStorage::with_tables(&["todos"]));
        let http = Arc::new(ScriptedHttpClient::new());
        let connector = Arc::new(TestConnector::new());
        let manager = ConnectionManager::new(storage.clone(), http.clone());
        Self {
            storage,
            http,
            connector,
            manager,
        }
    }

    /// Connects with [`fast_options`].
    pub async fn connect(&self) {
        self.manager
            .connect(self.connector.clone(), fast_options())
            .await;
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
