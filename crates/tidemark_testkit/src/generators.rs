//! Property-based test generators using proptest.
//!
//! Strategies produce bucket data together with the checksum a service
//! would declare for it.

use proptest::prelude::*;
use tidemark_sync_protocol::{BucketChecksum, Checkpoint, OplogEntry, SyncDataBucket};

/// Strategy for bucket names.
pub fn bucket_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,8}\\[\\]").expect("Invalid regex")
}

/// Strategy for PUT operations with ids `1..=len` in table `todos`.
pub fn put_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<OplogEntry>> {
    prop::collection::vec((any::<u32>(), "[a-z]{1,6}"), 1..=max_len).prop_map(|entries| {
        entries
            .into_iter()
            .enumerate()
            .map(|(i, (checksum, id))| {
                let data = serde_json::json!({ "title": id }).to_string();
                OplogEntry::put((i + 1).to_string(), "todos", id, data, i64::from(checksum))
            })
            .collect()
    })
}

/// Declared checksum of `ops`: the wrapping 32-bit sum of their checksums.
pub fn declared_checksum(ops: &[OplogEntry]) -> i64 {
    i64::from(
        ops.iter()
            .fold(0u32, |acc, op| acc.wrapping_add(op.checksum as u32)),
    )
}

/// Strategy for a set of buckets and the checkpoint covering all of them.
pub fn bucket_data_strategy() -> impl Strategy<Value = (Vec<SyncDataBucket>, Checkpoint)> {
    prop::collection::btree_map(bucket_name_strategy(), put_ops_strategy(8), 1..4).prop_map(
        |buckets| {
            let last_op = buckets.values().map(Vec::len).max().unwrap_or(0);
            let checksums = buckets
                .iter()
                .map(|(name, ops)| BucketChecksum::new(name.clone(), declared_checksum(ops)))
                .collect();
            let data = buckets
                .into_iter()
                .map(|(name, ops)| SyncDataBucket::new(name, ops))
                .collect();
            (data, Checkpoint::new(last_op.to_string(), checksums))
        },
    )
}
