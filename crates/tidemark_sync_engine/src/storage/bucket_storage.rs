//! Bucket storage orchestrator.
//!
//! Owns the persisted sync state through a [`StorageAdapter`]: applies
//! checkpoints, schedules compaction and exposes the write queue.

use crate::config::COMPACT_OPERATION_INTERVAL;
use crate::error::SyncResult;
use crate::event_bus::EventStream;
use crate::storage::adapter::{ChecksumValidation, StorageAdapter, TableUpdate};
use crate::storage::crud::{CrudBatch, CrudTransaction};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tidemark_sync_protocol::{
    BucketState, Checkpoint, ControlOp, ControlPayload, CrudEntry, Instruction, SyncDataBatch,
    MAX_OP_ID,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Outcome of [`BucketStorage::sync_local_database`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncLocalDatabaseResult {
    /// The checkpoint was applied to the local tables.
    pub ready: bool,
    /// All checksums matched.
    pub checkpoint_valid: bool,
    /// Buckets whose checksum did not match. They have been deleted.
    pub checkpoint_failures: Vec<String>,
}

impl SyncLocalDatabaseResult {
    fn applied() -> Self {
        Self {
            ready: true,
            checkpoint_valid: true,
            checkpoint_failures: Vec::new(),
        }
    }

    fn blocked() -> Self {
        Self {
            ready: false,
            checkpoint_valid: true,
            checkpoint_failures: Vec::new(),
        }
    }

    fn invalid(failures: Vec<String>) -> Self {
        Self {
            ready: false,
            checkpoint_valid: false,
            checkpoint_failures: failures,
        }
    }
}

/// Orchestrates the local sync state on top of a [`StorageAdapter`].
pub struct BucketStorage {
    adapter: Arc<dyn StorageAdapter>,
    table_names: RwLock<BTreeSet<String>>,
    compact_counter: AtomicI64,
    pending_bucket_deletes: AtomicBool,
    checkpoint_lock: Mutex<()>,
}

impl BucketStorage {
    /// Creates an orchestrator over `adapter`.
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            adapter,
            table_names: RwLock::new(BTreeSet::new()),
            compact_counter: AtomicI64::new(COMPACT_OPERATION_INTERVAL),
            pending_bucket_deletes: AtomicBool::new(true),
            checkpoint_lock: Mutex::new(()),
        }
    }

    /// Returns the underlying adapter.
    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    /// Loads the names of the local tables.
    pub async fn init(&self) -> SyncResult<()> {
        let names = self.adapter.local_table_names().await?;
        debug!(tables = names.len(), "loaded local table names");
        *self.table_names.write() = names.into_iter().collect();
        Ok(())
    }

    /// Local table names loaded by [`BucketStorage::init`].
    pub fn table_names(&self) -> BTreeSet<String> {
        self.table_names.read().clone()
    }

    /// Stable id of this client.
    pub async fn client_id(&self) -> SyncResult<String> {
        self.adapter.client_id().await
    }

    /// Invokes the storage extension's control call.
    pub async fn control(
        &self,
        op: ControlOp,
        payload: ControlPayload,
    ) -> SyncResult<Vec<Instruction>> {
        let raw = self.adapter.control(op, payload).await?;
        Ok(Instruction::decode_all(&raw)?)
    }

    /// Persists a batch of bucket data.
    pub async fn save_sync_data(&self, batch: &SyncDataBatch) -> SyncResult<()> {
        for bucket in &batch.buckets {
            self.adapter.save_bucket(bucket).await?;
        }
        self.compact_counter
            .fetch_add(batch.operation_count() as i64, Ordering::SeqCst);
        Ok(())
    }

    /// Marks buckets for deletion. They are removed on the next compaction.
    pub async fn remove_buckets(&self, buckets: &[String]) -> SyncResult<()> {
        for bucket in buckets {
            self.delete_bucket(bucket).await?;
        }
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> SyncResult<()> {
        self.adapter.delete_bucket(bucket).await?;
        debug!(bucket, "marked bucket for deletion");
        self.pending_bucket_deletes.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Watermarks of all live buckets.
    pub async fn get_bucket_states(&self) -> SyncResult<Vec<BucketState>> {
        self.adapter.bucket_states().await
    }

    /// Compares the checkpoint's checksums with local data.
    pub async fn validate_checksums(
        &self,
        checkpoint: &Checkpoint,
        priority: Option<i32>,
    ) -> SyncResult<ChecksumValidation> {
        self.adapter.validate_checkpoint(checkpoint, priority).await
    }

    /// Validates and applies a checkpoint, then compacts.
    ///
    /// With a `priority`, only buckets at or above it are applied and the
    /// `$local` target is left alone.
    pub async fn sync_local_database(
        &self,
        checkpoint: &Checkpoint,
        priority: Option<i32>,
    ) -> SyncResult<SyncLocalDatabaseResult> {
        let _applying = self.checkpoint_lock.lock().await;

        let validation = self.validate_checksums(checkpoint, priority).await?;
        if !validation.valid {
            warn!(
                buckets = ?validation.failed_buckets,
                last_op_id = %checkpoint.last_op_id,
                "checksum mismatch, deleting buckets"
            );
            for bucket in &validation.failed_buckets {
                self.delete_bucket(bucket).await?;
            }
            return Ok(SyncLocalDatabaseResult::invalid(validation.failed_buckets));
        }

        let buckets: Vec<String> = match priority {
            Some(p) => checkpoint
                .buckets_for_priority(p)
                .into_iter()
                .map(|b| b.bucket.clone())
                .collect(),
            None => checkpoint.bucket_names(),
        };
        let write_checkpoint = match priority {
            Some(_) => None,
            None => checkpoint.write_checkpoint.as_deref(),
        };
        self.adapter
            .set_last_op(&buckets, &checkpoint.last_op_id, write_checkpoint)
            .await?;

        if !self.adapter.sync_local(checkpoint, priority).await? {
            debug!(
                last_op_id = %checkpoint.last_op_id,
                "local writes pending, not applying checkpoint"
            );
            return Ok(SyncLocalDatabaseResult::blocked());
        }

        self.auto_compact().await?;
        Ok(SyncLocalDatabaseResult::applied())
    }

    /// Runs whatever compaction is due.
    pub async fn auto_compact(&self) -> SyncResult<()> {
        self.delete_pending_buckets().await?;
        self.clear_remove_ops().await
    }

    /// Runs every compaction step regardless of counters.
    pub async fn force_compact(&self) -> SyncResult<()> {
        self.compact_counter
            .store(COMPACT_OPERATION_INTERVAL, Ordering::SeqCst);
        self.pending_bucket_deletes.store(true, Ordering::SeqCst);
        self.auto_compact().await
    }

    async fn delete_pending_buckets(&self) -> SyncResult<()> {
        if !self.pending_bucket_deletes.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.adapter.delete_pending_buckets().await {
            self.pending_bucket_deletes.store(true, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    async fn clear_remove_ops(&self) -> SyncResult<()> {
        if self.compact_counter.load(Ordering::SeqCst) < COMPACT_OPERATION_INTERVAL {
            return Ok(());
        }
        self.adapter.clear_remove_ops().await?;
        self.compact_counter.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Returns true if the write queue is not empty.
    pub async fn has_crud(&self) -> SyncResult<bool> {
        self.adapter.has_crud().await
    }

    /// Returns the oldest queued write.
    pub async fn next_crud_item(&self) -> SyncResult<Option<CrudEntry>> {
        Ok(self.adapter.crud_items(1).await?.into_iter().next())
    }

    /// Returns up to `limit` queued writes as one batch.
    pub async fn get_crud_batch(self: &Arc<Self>, limit: usize) -> SyncResult<Option<CrudBatch>> {
        let mut items = self.adapter.crud_items(limit + 1).await?;
        if items.is_empty() {
            return Ok(None);
        }
        let has_more = items.len() > limit;
        items.truncate(limit);
        Ok(Some(CrudBatch::new(items, has_more, Arc::clone(self))))
    }

    /// Returns the writes of the oldest local transaction.
    pub async fn next_crud_transaction(self: &Arc<Self>) -> SyncResult<Option<CrudTransaction>> {
        let Some(first) = self.next_crud_item().await? else {
            return Ok(None);
        };
        let crud = match first.transaction_id {
            Some(tx) => self.adapter.crud_transaction(tx).await?,
            None => vec![first.clone()],
        };
        Ok(Some(CrudTransaction::new(
            first.transaction_id,
            crud,
            Arc::clone(self),
        )))
    }

    pub(crate) async fn complete_crud(
        &self,
        last_client_id: i64,
        write_checkpoint: Option<&str>,
    ) -> SyncResult<()> {
        self.adapter
            .complete_crud(last_client_id, write_checkpoint)
            .await
    }

    /// Advances the `$local` target to a server-confirmed write checkpoint.
    ///
    /// `callback` fetches the write checkpoint. The target only moves if no
    /// write was queued while the callback ran; returns false otherwise, or
    /// when there is nothing to advance.
    pub async fn update_local_target<F, Fut>(&self, callback: F) -> SyncResult<bool>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = SyncResult<String>> + Send,
    {
        if self.adapter.local_target().await?.as_deref() != Some(MAX_OP_ID) {
            return Ok(false);
        }
        let Some(sequence_before) = self.adapter.crud_sequence().await? else {
            return Ok(false);
        };

        let op_id = callback().await?;
        debug!(%op_id, sequence_before, "updating local target");

        let updated = self
            .adapter
            .commit_local_target(sequence_before, &op_id)
            .await?;
        if !updated {
            debug!("writes queued while fetching write checkpoint, keeping local target");
        }
        Ok(updated)
    }

    /// Subscribes to table-change notifications.
    pub fn table_updates(&self) -> EventStream<TableUpdate> {
        self.adapter.table_updates()
    }
}
