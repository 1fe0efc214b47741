//! # Tidemark Sync Protocol
//!
//! Wire types for the Tidemark streaming sync protocol.
//!
//! This crate provides:
//! - Checkpoints, bucket checksums and per-bucket watermarks
//! - Oplog entries and sync-data batches as they appear on the stream
//! - Newline-delimited streaming lines and the streaming request body
//! - Local write-queue (CRUD) entries
//! - Control operations and the instructions the storage extension answers with
//!
//! This is a pure protocol crate with no I/O operations. Everything is
//! encoded as JSON with `serde_json`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bucket;
mod crud;
mod error;
mod instruction;
mod line;
mod request;

pub use bucket::{
    BucketChecksum, BucketState, Checkpoint, OpType, OplogEntry, SyncDataBatch, SyncDataBucket,
    LOCAL_BUCKET, MAX_OP_ID,
};
pub use crud::{CrudEntry, UpdateType};
pub use error::{ProtocolError, ProtocolResult};
pub use instruction::{
    BucketProgress, ControlOp, ControlPayload, CoreDownloadProgress, CorePriorityStatus,
    CoreStreamStatus, CoreSyncStatus, Instruction, LogSeverity,
};
pub use line::{
    CheckpointComplete, CheckpointDiff, PartialCheckpointComplete, StreamingSyncLine,
};
pub use request::{
    BucketRequest, RequestedStream, StartSyncStream, StreamingSyncRequest, WriteCheckpointData,
    WriteCheckpointResponse,
};
