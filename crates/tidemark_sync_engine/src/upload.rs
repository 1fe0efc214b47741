//! The CRUD upload loop.

use crate::connector::BackendConnector;
use crate::error::{SyncError, SyncResult};
use crate::lock::{LockType, SyncLocks};
use crate::status::StatusHandle;
use crate::storage::BucketStorage;
use crate::transport::RemoteTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

enum UploadStep {
    /// One upload callback finished.
    Uploaded,
    /// The queue is empty. Carries whether the local target advanced.
    Drained(bool),
}

/// Drains the write queue through [`BackendConnector::upload_data`].
///
/// Only one loop runs at a time per [`SyncLocks`] instance.
pub struct CrudUploader {
    storage: Arc<BucketStorage>,
    connector: Arc<dyn BackendConnector>,
    transport: Arc<RemoteTransport>,
    status: StatusHandle,
    locks: Arc<SyncLocks>,
    retry_delay: Duration,
}

impl CrudUploader {
    /// Creates an uploader.
    pub fn new(
        storage: Arc<BucketStorage>,
        connector: Arc<dyn BackendConnector>,
        transport: Arc<RemoteTransport>,
        status: StatusHandle,
        locks: Arc<SyncLocks>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            storage,
            connector,
            transport,
            status,
            locks,
            retry_delay,
        }
    }

    /// Uploads until the queue is empty, the connection drops or `cancel`
    /// fires.
    ///
    /// Returns true if the `$local` target advanced to a new write
    /// checkpoint. Returns false immediately if another loop is running.
    pub async fn upload_all(&self, cancel: &CancellationToken) -> bool {
        let Some(_crud) = self.locks.try_acquire(LockType::Crud) else {
            debug!("upload loop already running");
            return false;
        };

        let mut checked_item = None;
        let mut advanced = false;
        while !cancel.is_cancelled() {
            match self.upload_next(&mut checked_item).await {
                Ok(UploadStep::Uploaded) => {}
                Ok(UploadStep::Drained(updated)) => {
                    advanced = updated;
                    break;
                }
                Err(err) => {
                    checked_item = None;
                    if matches!(err, SyncError::CrudItemNotCompleted { .. }) {
                        error!(
                            error = %err,
                            "upload callback did not complete its batch, the queue cannot progress"
                        );
                    } else {
                        warn!(error = %err, "upload failed");
                    }
                    self.status.update(|s| {
                        s.data_flow.uploading = false;
                        s.data_flow.upload_error = Some(err.to_string());
                    });

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                    if !self.status.current().connected {
                        debug!("connection dropped, leaving upload loop");
                        break;
                    }
                }
            }
        }

        self.status.update(|s| s.data_flow.uploading = false);
        advanced
    }

    async fn upload_next(&self, checked_item: &mut Option<i64>) -> SyncResult<UploadStep> {
        let Some(item) = self.storage.next_crud_item().await? else {
            let client_id = self.storage.client_id().await?;
            let transport = &self.transport;
            let updated = self
                .storage
                .update_local_target(|| async move { transport.write_checkpoint(&client_id).await })
                .await?;
            return Ok(UploadStep::Drained(updated));
        };

        if *checked_item == Some(item.client_id) {
            return Err(SyncError::CrudItemNotCompleted {
                client_id: item.client_id,
            });
        }
        *checked_item = Some(item.client_id);

        self.status.update(|s| s.data_flow.uploading = true);
        self.connector.upload_data(&self.storage).await?;
        self.status.update(|s| s.data_flow.upload_error = None);
        Ok(UploadStep::Uploaded)
    }
}
