//! The storage collaborator interface.

use crate::error::SyncResult;
use crate::event_bus::EventStream;
use async_trait::async_trait;
use std::collections::BTreeSet;
use tidemark_sync_protocol::{
    BucketState, Checkpoint, ControlOp, ControlPayload, CoreSyncStatus, CrudEntry, SyncDataBucket,
};

/// Name of the pending-write queue table.
pub const CRUD_TABLE: &str = "ps_crud";

/// Name of the per-bucket watermark table.
pub const BUCKETS_TABLE: &str = "ps_buckets";

/// Name of the per-bucket operation log table.
pub const OPLOG_TABLE: &str = "ps_oplog";

/// Outcome of comparing a checkpoint's checksums with local data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumValidation {
    /// All checksums matched.
    pub valid: bool,
    /// Buckets whose checksum did not match.
    pub failed_buckets: Vec<String>,
}

impl ChecksumValidation {
    /// A passing validation.
    pub fn valid() -> Self {
        Self {
            valid: true,
            failed_buckets: Vec::new(),
        }
    }

    /// A failing validation for `buckets`.
    pub fn failed(buckets: Vec<String>) -> Self {
        Self {
            valid: false,
            failed_buckets: buckets,
        }
    }
}

/// Tables written by one storage transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableUpdate {
    /// Affected table names.
    pub tables: BTreeSet<String>,
}

impl TableUpdate {
    /// Creates an update for the given tables.
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if `table` was written.
    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains(table)
    }
}

/// The embedded storage engine and its sync extension.
///
/// Implementations own the persisted layout (`ps_buckets`, `ps_oplog`,
/// `ps_crud`) and perform every multi-statement operation inside one
/// transaction. Checksum computation and oplog merging stay behind this
/// interface.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Names of the local tables data is synced into.
    async fn local_table_names(&self) -> SyncResult<Vec<String>>;

    /// Stable id of this client.
    async fn client_id(&self) -> SyncResult<String>;

    /// Invokes the extension's control call and returns its raw JSON answer.
    async fn control(&self, op: ControlOp, payload: ControlPayload) -> SyncResult<String>;

    /// Appends the operations of one bucket to its oplog.
    async fn save_bucket(&self, bucket: &SyncDataBucket) -> SyncResult<()>;

    /// Watermarks of all buckets that are not pending deletion.
    async fn bucket_states(&self) -> SyncResult<Vec<BucketState>>;

    /// Marks a bucket for deletion. Its data is no longer visible afterwards.
    async fn delete_bucket(&self, bucket: &str) -> SyncResult<()>;

    /// Physically removes buckets marked for deletion.
    async fn delete_pending_buckets(&self) -> SyncResult<()>;

    /// Collapses REMOVE operations superseded by later operations.
    async fn clear_remove_ops(&self) -> SyncResult<()>;

    /// Compares checksums of the buckets in `checkpoint` (restricted to
    /// `priority` if given) with local data.
    async fn validate_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        priority: Option<i32>,
    ) -> SyncResult<ChecksumValidation>;

    /// Advances `last_op` of `buckets` and, if given, of the `$local` bucket.
    async fn set_last_op(
        &self,
        buckets: &[String],
        last_op_id: &str,
        write_checkpoint: Option<&str>,
    ) -> SyncResult<()>;

    /// Applies oplog data up to the checkpoint to the local tables.
    ///
    /// Returns false without touching anything if pending local writes
    /// block the checkpoint.
    async fn sync_local(&self, checkpoint: &Checkpoint, priority: Option<i32>) -> SyncResult<bool>;

    /// Current `target_op` of the `$local` bucket.
    async fn local_target(&self) -> SyncResult<Option<String>>;

    /// Returns up to `limit` queued writes in queue order.
    async fn crud_items(&self, limit: usize) -> SyncResult<Vec<CrudEntry>>;

    /// Returns all queued writes of one local transaction.
    async fn crud_transaction(&self, transaction_id: i64) -> SyncResult<Vec<CrudEntry>>;

    /// Returns true if the write queue is not empty.
    async fn has_crud(&self) -> SyncResult<bool>;

    /// Current value of the write queue's sequence counter.
    async fn crud_sequence(&self) -> SyncResult<Option<i64>>;

    /// Deletes queued writes up to `last_client_id`.
    ///
    /// If the queue is empty afterwards and `write_checkpoint` is given, the
    /// `$local` target becomes that checkpoint; otherwise it becomes
    /// `MAX_OP_ID`.
    async fn complete_crud(
        &self,
        last_client_id: i64,
        write_checkpoint: Option<&str>,
    ) -> SyncResult<()>;

    /// Sets the `$local` target to `op_id` if the queue is empty and the
    /// sequence counter still equals `expected_sequence`.
    ///
    /// Check and update happen in one transaction.
    async fn commit_local_target(&self, expected_sequence: i64, op_id: &str) -> SyncResult<bool>;

    /// Persisted sync status, for use while no stream is active.
    async fn offline_sync_status(&self) -> SyncResult<CoreSyncStatus>;

    /// Subscribes to table-change notifications.
    fn table_updates(&self) -> EventStream<TableUpdate>;
}
