//! Lines received on the sync stream.
//!
//! The engine itself forwards lines verbatim to the storage extension. The
//! typed form exists for collaborators that need to look inside them.

use crate::bucket::{BucketChecksum, Checkpoint, SyncDataBucket};
use crate::error::ProtocolResult;
use serde::{Deserialize, Serialize};

/// Incremental update to the previous checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointDiff {
    /// New highest op id.
    pub last_op_id: String,
    /// Buckets added or changed since the previous checkpoint.
    #[serde(default)]
    pub updated_buckets: Vec<BucketChecksum>,
    /// Buckets no longer part of the checkpoint.
    #[serde(default)]
    pub removed_buckets: Vec<String>,
    /// New write checkpoint, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_checkpoint: Option<String>,
}

impl CheckpointDiff {
    /// Applies the diff to `base`, producing the new checkpoint.
    pub fn apply_to(&self, base: &Checkpoint) -> Checkpoint {
        let mut buckets: Vec<BucketChecksum> = base
            .buckets
            .iter()
            .filter(|b| !self.removed_buckets.contains(&b.bucket))
            .filter(|b| !self.updated_buckets.iter().any(|u| u.bucket == b.bucket))
            .cloned()
            .collect();
        buckets.extend(self.updated_buckets.iter().cloned());

        Checkpoint {
            last_op_id: self.last_op_id.clone(),
            buckets,
            write_checkpoint: self.write_checkpoint.clone(),
        }
    }
}

/// Marks the end of all data for a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointComplete {
    /// Op id of the completed checkpoint.
    pub last_op_id: String,
}

/// Marks the end of all data at or above a priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialCheckpointComplete {
    /// Op id of the checkpoint.
    pub last_op_id: String,
    /// Priority that is now complete.
    pub priority: i32,
}

/// One newline-delimited message of the sync stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingSyncLine {
    /// A full checkpoint.
    Checkpoint(Checkpoint),
    /// A checkpoint relative to the previous one.
    CheckpointDiff(CheckpointDiff),
    /// All data for the checkpoint has been sent.
    CheckpointComplete(CheckpointComplete),
    /// All data for one priority has been sent.
    PartialCheckpointComplete(PartialCheckpointComplete),
    /// Operations for one bucket.
    Data(SyncDataBucket),
    /// Seconds until the current token expires.
    TokenExpiresIn(i64),
}

impl StreamingSyncLine {
    /// Parses a line. Valid JSON with an unknown shape yields `Ok(None)`.
    pub fn parse(line: &str) -> ProtocolResult<Option<Self>> {
        let value: serde_json::Value = serde_json::from_str(line)?;
        Ok(serde_json::from_value(value).ok())
    }

    /// Encodes the line as JSON (without trailing newline).
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::OplogEntry;

    #[test]
    fn parses_each_line_kind() {
        let checkpoint = StreamingSyncLine::parse(
            r#"{"checkpoint":{"last_op_id":"1","buckets":[{"bucket":"global[]","checksum":5}]}}"#,
        )
        .unwrap()
        .unwrap();
        assert!(matches!(checkpoint, StreamingSyncLine::Checkpoint(ref c) if c.last_op_id == "1"));

        let data = StreamingSyncLine::parse(
            r#"{"data":{"bucket":"global[]","data":[{"op_id":"1","op":"PUT","object_type":"todos","object_id":"a","checksum":5,"data":"{}"}]}}"#,
        )
        .unwrap()
        .unwrap();
        assert!(matches!(data, StreamingSyncLine::Data(ref d) if d.data.len() == 1));

        let complete = StreamingSyncLine::parse(r#"{"checkpoint_complete":{"last_op_id":"1"}}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(complete, StreamingSyncLine::CheckpointComplete(_)));

        let expires = StreamingSyncLine::parse(r#"{"token_expires_in":30}"#)
            .unwrap()
            .unwrap();
        assert_eq!(expires, StreamingSyncLine::TokenExpiresIn(30));
    }

    #[test]
    fn unknown_line_is_not_an_error() {
        assert_eq!(StreamingSyncLine::parse(r#"{"keepalive":1}"#).unwrap(), None);
        assert!(StreamingSyncLine::parse("{not json").is_err());
    }

    #[test]
    fn diff_replaces_and_removes_buckets() {
        let base = Checkpoint::new(
            "1",
            vec![BucketChecksum::new("a", 1), BucketChecksum::new("b", 2)],
        );
        let diff = CheckpointDiff {
            last_op_id: "2".into(),
            updated_buckets: vec![BucketChecksum::new("b", 5), BucketChecksum::new("c", 1)],
            removed_buckets: vec!["a".into()],
            write_checkpoint: Some("7".into()),
        };

        let next = diff.apply_to(&base);
        assert_eq!(next.last_op_id, "2");
        assert_eq!(next.bucket_names(), vec!["b", "c"]);
        assert_eq!(next.buckets[0].checksum, 5);
        assert_eq!(next.write_checkpoint.as_deref(), Some("7"));
    }

    #[test]
    fn encode_uses_snake_case_tags() {
        let line = StreamingSyncLine::Data(SyncDataBucket::new(
            "b",
            vec![OplogEntry::remove("4", "todos", "x", 1)],
        ));
        assert!(line.encode().unwrap().starts_with(r#"{"data":{"bucket":"b""#));
    }
}
