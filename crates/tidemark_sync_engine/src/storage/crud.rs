//! Views over the pending-write queue.

use crate::error::SyncResult;
use crate::storage::bucket_storage::BucketStorage;
use std::fmt;
use std::sync::Arc;
use tidemark_sync_protocol::CrudEntry;

/// A contiguous prefix of the write queue.
///
/// Call [`CrudBatch::complete`] once the writes were accepted by the
/// service. Batches must be completed in queue order.
pub struct CrudBatch {
    /// Writes in queue order.
    pub crud: Vec<CrudEntry>,
    /// More writes follow this batch.
    pub has_more: bool,
    storage: Arc<BucketStorage>,
}

impl CrudBatch {
    pub(crate) fn new(crud: Vec<CrudEntry>, has_more: bool, storage: Arc<BucketStorage>) -> Self {
        Self {
            crud,
            has_more,
            storage,
        }
    }

    /// Removes the batch from the queue.
    ///
    /// `write_checkpoint` is the server's write checkpoint covering these
    /// writes; the local target only advances to it if the queue is empty.
    pub async fn complete(self, write_checkpoint: Option<String>) -> SyncResult<()> {
        let Some(last) = self.crud.last() else {
            return Ok(());
        };
        self.storage
            .complete_crud(last.client_id, write_checkpoint.as_deref())
            .await
    }
}

impl fmt::Debug for CrudBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrudBatch")
            .field("crud", &self.crud)
            .field("has_more", &self.has_more)
            .finish()
    }
}

/// All writes of one local transaction.
pub struct CrudTransaction {
    /// The transaction id, `None` for writes outside a transaction.
    pub transaction_id: Option<i64>,
    /// Writes in queue order.
    pub crud: Vec<CrudEntry>,
    storage: Arc<BucketStorage>,
}

impl CrudTransaction {
    pub(crate) fn new(
        transaction_id: Option<i64>,
        crud: Vec<CrudEntry>,
        storage: Arc<BucketStorage>,
    ) -> Self {
        Self {
            transaction_id,
            crud,
            storage,
        }
    }

    /// Removes the transaction from the queue.
    pub async fn complete(self, write_checkpoint: Option<String>) -> SyncResult<()> {
        CrudBatch::new(self.crud, false, self.storage)
            .complete(write_checkpoint)
            .await
    }
}

impl fmt::Debug for CrudTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrudTransaction")
            .field("transaction_id", &self.transaction_id)
            .field("crud", &self.crud)
            .finish()
    }
}
