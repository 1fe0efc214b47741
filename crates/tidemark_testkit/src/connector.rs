//! Recording backend connector.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tidemark_sync_engine::{BackendConnector, BucketStorage, Credentials, SyncError, SyncResult};
use tidemark_sync_protocol::CrudEntry;
use tokio::sync::watch;

/// Endpoint handed out by [`TestConnector`].
pub const TEST_ENDPOINT: &str = "https://sync.test";

/// What [`TestConnector::upload_data`] does with the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadBehavior {
    /// Upload one batch and complete it.
    Complete,
    /// Fail with an upload error.
    Fail(String),
    /// Read the next batch but never complete it.
    Ignore,
}

/// [`BackendConnector`] that records what the engine asked of it.
pub struct TestConnector {
    signed_in: Mutex<bool>,
    behavior: Mutex<UploadBehavior>,
    write_checkpoint: Mutex<Option<String>>,
    fetches: AtomicUsize,
    invalidations: AtomicUsize,
    uploaded: Mutex<Vec<Vec<CrudEntry>>>,
    upload_calls: watch::Sender<usize>,
}

impl TestConnector {
    /// Creates a signed-in connector that completes every batch.
    pub fn new() -> Self {
        let (upload_calls, _) = watch::channel(0);
        Self {
            signed_in: Mutex::new(true),
            behavior: Mutex::new(UploadBehavior::Complete),
            write_checkpoint: Mutex::new(None),
            fetches: AtomicUsize::new(0),
            invalidations: AtomicUsize::new(0),
            uploaded: Mutex::new(Vec::new()),
            upload_calls,
        }
    }

    /// Sets the upload behavior.
    pub fn with_behavior(self, behavior: UploadBehavior) -> Self {
        *self.behavior.lock() = behavior;
        self
    }

    /// Changes the upload behavior.
    pub fn set_behavior(&self, behavior: UploadBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Signs the user in or out.
    pub fn set_signed_in(&self, signed_in: bool) {
        *self.signed_in.lock() = signed_in;
    }

    /// Write checkpoint passed when completing batches.
    pub fn set_write_checkpoint(&self, checkpoint: Option<&str>) {
        *self.write_checkpoint.lock() = checkpoint.map(str::to_string);
    }

    /// Number of credential fetches.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of credential invalidations.
    pub fn invalidation_count(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }

    /// Batches seen by upload calls, in order.
    pub fn uploaded(&self) -> Vec<Vec<CrudEntry>> {
        self.uploaded.lock().clone()
    }

    /// Number of upload calls so far.
    pub fn upload_count(&self) -> usize {
        *self.upload_calls.borrow()
    }

    /// Waits until at least `count` upload calls were made.
    pub async fn wait_for_uploads(&self, count: usize) {
        let mut receiver = self.upload_calls.subscribe();
        let _ = receiver.wait_for(|seen| *seen >= count).await;
    }
}

impl Default for TestConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendConnector for TestConnector {
    async fn fetch_credentials(&self) -> SyncResult<Option<Credentials>> {
        let fetch = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if !*self.signed_in.lock() {
            return Ok(None);
        }
        Ok(Some(Credentials::new(TEST_ENDPOINT, format!("token-{fetch}"))))
    }

    async fn invalidate_credentials(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }

    async fn upload_data(&self, storage: &Arc<BucketStorage>) -> SyncResult<()> {
        let behavior = self.behavior.lock().clone();
        let result = match behavior {
            UploadBehavior::Fail(message) => Err(SyncError::upload(message)),
            UploadBehavior::Complete | UploadBehavior::Ignore => {
                match storage.get_crud_batch(100).await? {
                    Some(batch) => {
                        self.uploaded.lock().push(batch.crud.clone());
                        if behavior == UploadBehavior::Complete {
                            let checkpoint = self.write_checkpoint.lock().clone();
                            batch.complete(checkpoint).await?;
                        }
                        Ok(())
                    }
                    None => Ok(()),
                }
            }
        };
        self.upload_calls.send_modify(|count| *count += 1);
        result
    }
}
