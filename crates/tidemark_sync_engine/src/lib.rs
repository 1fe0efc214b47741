//! # Tidemark Sync Engine
//!
//! Client sync engine for Tidemark.
//!
//! This crate provides:
//! - Streaming sync state machine with retries
//! - Connection manager serializing connect and disconnect requests
//! - Stream subscriptions with reference counting
//! - Bucket storage orchestration on top of a storage collaborator
//! - CRUD upload loop for the local write queue
//! - HTTP transport abstraction with a `reqwest` implementation
//! - Observable sync status and a multi-subscriber event bus
//!
//! ## Architecture
//!
//! The engine keeps a local store eventually consistent with the service:
//! 1. The service streams checkpoints and bucket data over one long-lived request
//! 2. Every line is fed into the storage extension, which answers with instructions
//! 3. Local writes are queued and uploaded independently of the stream
//!
//! ## Key Invariants
//!
//! - At most one streaming request per connection
//! - Local writes always take precedence over downloaded data
//! - The upload loop and protocol iterations never block each other
//! - Errors are retried and surfaced through [`SyncStatus`], never returned
//!   from the background loops

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connection;
mod connector;
mod error;
mod event_bus;
mod http;
mod lock;
mod status;
mod storage;
mod streaming;
mod subscription;
mod transport;
mod upload;

pub use config::{
    SubscribeOptions, SyncOptions, COMPACT_OPERATION_INTERVAL, DEFAULT_CRUD_THROTTLE,
    DEFAULT_RETRY_DELAY,
};
pub use connection::ConnectionManager;
pub use connector::{BackendConnector, Credentials};
pub use error::{SyncError, SyncResult};
pub use event_bus::{EventBus, EventStream};
pub use http::{HttpClient, HttpRequest, LineStream, ReqwestClient, MAX_LINE_LENGTH};
pub use lock::{LockType, SyncLocks};
pub use status::{
    DataFlowStatus, DownloadProgress, StatusHandle, SyncPriorityStatus, SyncStatus,
    FULL_SYNC_PRIORITY,
};
pub use storage::{
    BucketStorage, ChecksumValidation, CrudBatch, CrudTransaction, StorageAdapter,
    SyncLocalDatabaseResult, TableUpdate, BUCKETS_TABLE, CRUD_TABLE, OPLOG_TABLE,
};
pub use streaming::StreamingSyncImplementation;
pub use subscription::SyncStreamSubscription;
pub use transport::{RemoteTransport, SYNC_STREAM_PATH, WRITE_CHECKPOINT_PATH};
pub use upload::CrudUploader;
