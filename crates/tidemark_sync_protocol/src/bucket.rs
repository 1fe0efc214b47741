//! Buckets, checkpoints and oplog entries.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of the pseudo-bucket tracking the local write target.
pub const LOCAL_BUCKET: &str = "$local";

/// The largest op id. Used as the `$local` target while writes are pending.
pub const MAX_OP_ID: &str = "9223372036854775807";

/// Authoritative checksum for one bucket as of a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketChecksum {
    /// Bucket name.
    pub bucket: String,
    /// Additive checksum over all operations in the bucket.
    pub checksum: i64,
    /// Number of operations, if the server sent it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    /// Sync priority of the bucket. Lower numbers sync first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

impl BucketChecksum {
    /// Creates a checksum entry without count or priority.
    pub fn new(bucket: impl Into<String>, checksum: i64) -> Self {
        Self {
            bucket: bucket.into(),
            checksum,
            count: None,
            priority: None,
        }
    }

    /// Sets the operation count.
    pub fn with_count(mut self, count: i64) -> Self {
        self.count = Some(count);
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Returns the effective priority (defaults to 3).
    pub fn effective_priority(&self) -> i32 {
        self.priority.unwrap_or(3)
    }
}

/// A server-declared consistent snapshot target across all buckets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Highest op id included in the checkpoint.
    pub last_op_id: String,
    /// Checksums for every bucket in the checkpoint.
    pub buckets: Vec<BucketChecksum>,
    /// Write checkpoint confirmed by the server, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_checkpoint: Option<String>,
}

impl Checkpoint {
    /// Creates a checkpoint without a write checkpoint.
    pub fn new(last_op_id: impl Into<String>, buckets: Vec<BucketChecksum>) -> Self {
        Self {
            last_op_id: last_op_id.into(),
            buckets,
            write_checkpoint: None,
        }
    }

    /// Sets the write checkpoint.
    pub fn with_write_checkpoint(mut self, write_checkpoint: impl Into<String>) -> Self {
        self.write_checkpoint = Some(write_checkpoint.into());
        self
    }

    /// Returns the names of all buckets in the checkpoint.
    pub fn bucket_names(&self) -> Vec<String> {
        self.buckets.iter().map(|b| b.bucket.clone()).collect()
    }

    /// Returns the buckets whose priority is at or above `priority`.
    ///
    /// Lower numbers are higher priorities, so this keeps every bucket with
    /// `effective_priority() <= priority`.
    pub fn buckets_for_priority(&self, priority: i32) -> Vec<&BucketChecksum> {
        self.buckets
            .iter()
            .filter(|b| b.effective_priority() <= priority)
            .collect()
    }
}

/// Local high-watermark for one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketState {
    /// Bucket name.
    pub bucket: String,
    /// Last op id applied locally.
    pub op_id: String,
}

/// Type of a replicated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpType {
    /// Insert or replace a row.
    Put,
    /// Remove a row.
    Remove,
    /// Operation moved to another bucket. Only the checksum counts.
    Move,
    /// Reset the bucket, keeping only the checksum.
    Clear,
}

impl OpType {
    /// Returns the wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Put => "PUT",
            OpType::Remove => "REMOVE",
            OpType::Move => "MOVE",
            OpType::Clear => "CLEAR",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PUT" => Ok(OpType::Put),
            "REMOVE" => Ok(OpType::Remove),
            "MOVE" => Ok(OpType::Move),
            "CLEAR" => Ok(OpType::Clear),
            other => Err(ProtocolError::UnknownOpType(other.to_string())),
        }
    }
}

/// A unit of replicated change inside a bucket's operation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OplogEntry {
    /// Operation id, as a decimal string.
    pub op_id: String,
    /// Operation type.
    pub op: OpType,
    /// Checksum contribution of this operation.
    pub checksum: i64,
    /// Distinguishes multiple rows with the same object id in one bucket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subkey: Option<String>,
    /// Target table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    /// Target row id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    /// Row data as a JSON document string (PUT only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl OplogEntry {
    /// Creates a PUT entry.
    pub fn put(
        op_id: impl Into<String>,
        object_type: impl Into<String>,
        object_id: impl Into<String>,
        data: impl Into<String>,
        checksum: i64,
    ) -> Self {
        Self {
            op_id: op_id.into(),
            op: OpType::Put,
            checksum,
            subkey: None,
            object_type: Some(object_type.into()),
            object_id: Some(object_id.into()),
            data: Some(data.into()),
        }
    }

    /// Creates a REMOVE entry.
    pub fn remove(
        op_id: impl Into<String>,
        object_type: impl Into<String>,
        object_id: impl Into<String>,
        checksum: i64,
    ) -> Self {
        Self {
            op_id: op_id.into(),
            op: OpType::Remove,
            checksum,
            subkey: None,
            object_type: Some(object_type.into()),
            object_id: Some(object_id.into()),
            data: None,
        }
    }

    /// Parses the op id as an integer.
    pub fn op_id_value(&self) -> ProtocolResult<i64> {
        self.op_id
            .parse()
            .map_err(|_| ProtocolError::invalid_structure(format!("invalid op_id {}", self.op_id)))
    }

    /// Encodes to the JSON wire form.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes from the JSON wire form.
    pub fn decode(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Data for one bucket as received in a `data` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDataBucket {
    /// Bucket name.
    pub bucket: String,
    /// Operations in op id order.
    pub data: Vec<OplogEntry>,
    /// Whether more data follows for this bucket.
    #[serde(default)]
    pub has_more: bool,
    /// Op id this chunk starts after.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    /// Op id the next chunk starts after.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_after: Option<String>,
}

impl SyncDataBucket {
    /// Creates a complete (no more data) bucket chunk.
    pub fn new(bucket: impl Into<String>, data: Vec<OplogEntry>) -> Self {
        Self {
            bucket: bucket.into(),
            data,
            has_more: false,
            after: None,
            next_after: None,
        }
    }
}

/// A batch of bucket data to persist in one write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDataBatch {
    /// Buckets in the batch.
    pub buckets: Vec<SyncDataBucket>,
}

impl SyncDataBatch {
    /// Creates a batch.
    pub fn new(buckets: Vec<SyncDataBucket>) -> Self {
        Self { buckets }
    }

    /// Total number of operations across all buckets.
    pub fn operation_count(&self) -> usize {
        self.buckets.iter().map(|b| b.data.len()).sum()
    }
}
