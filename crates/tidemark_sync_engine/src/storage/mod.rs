//! Local sync state: the storage collaborator and the orchestrator on top of it.

mod adapter;
mod bucket_storage;
mod crud;

pub use adapter::{
    ChecksumValidation, StorageAdapter, TableUpdate, BUCKETS_TABLE, CRUD_TABLE, OPLOG_TABLE,
};
pub use bucket_storage::{BucketStorage, SyncLocalDatabaseResult};
pub use crud::{CrudBatch, CrudTransaction};
