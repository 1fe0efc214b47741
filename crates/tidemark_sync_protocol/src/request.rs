//! Request bodies sent to the sync service and to the storage extension.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A bucket the client already has data for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRequest {
    /// Bucket name.
    pub name: String,
    /// Op id the client has data up to.
    pub after: String,
}

/// Body of `POST {endpoint}/sync/stream`.
///
/// The storage extension builds this body and hands it to the engine in an
/// `EstablishSyncStream` instruction; the engine sends it unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamingSyncRequest {
    /// Buckets with local data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buckets: Option<Vec<BucketRequest>>,
    /// Restricts the stream to these buckets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only: Option<Vec<String>>,
    /// Whether checkpoints should include checksums.
    #[serde(default = "default_true")]
    pub include_checksum: bool,
    /// Whether row data is sent as raw JSON strings.
    #[serde(default = "default_true")]
    pub raw_data: bool,
    /// Client parameters for sync rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    /// Stable id of this client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Application metadata forwarded to the service logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_metadata: Option<BTreeMap<String, String>>,
    /// Stream subscriptions requested by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streams: Option<Value>,
}

fn default_true() -> bool {
    true
}

/// A stream subscription as announced to the storage extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedStream {
    /// Stream name.
    pub name: String,
    /// Stream parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// How long the subscription should outlive its last handle, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// Priority override for the stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

/// Payload of the `start` control command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartSyncStream {
    /// Client parameters for sync rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    /// Application metadata.
    #[serde(default)]
    pub app_metadata: BTreeMap<String, String>,
    /// Currently active stream subscriptions.
    #[serde(default)]
    pub active_streams: Vec<RequestedStream>,
    /// Whether streams marked as default on the service are synced.
    #[serde(default = "default_true")]
    pub include_defaults: bool,
}

/// Inner payload of the write-checkpoint response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCheckpointData {
    /// The write checkpoint.
    pub write_checkpoint: String,
}

/// Response of `GET {endpoint}/write-checkpoint2.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCheckpointResponse {
    /// Response data.
    pub data: WriteCheckpointData,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_request_omits_absent_fields() {
        let request = StreamingSyncRequest {
            client_id: Some("c1".into()),
            ..StreamingSyncRequest::default()
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["client_id"], "c1");
        assert!(json.get("buckets").is_none());
        assert_eq!(json["include_checksum"], false);
    }

    #[test]
    fn streaming_request_defaults_flags_on_decode() {
        let request: StreamingSyncRequest =
            serde_json::from_str(r#"{"buckets":[{"name":"a","after":"3"}]}"#).unwrap();
        assert!(request.include_checksum);
        assert!(request.raw_data);
        assert_eq!(request.buckets.unwrap()[0].after, "3");
    }

    #[test]
    fn write_checkpoint_response_decodes() {
        let response: WriteCheckpointResponse =
            serde_json::from_str(r#"{"data":{"write_checkpoint":"42"}}"#).unwrap();
        assert_eq!(response.data.write_checkpoint, "42");
    }
}
