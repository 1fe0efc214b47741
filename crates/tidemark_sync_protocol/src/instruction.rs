//! Control operations and the instructions returned for them.
//!
//! All protocol state is exchanged with the storage extension through a
//! single control call: the engine sends a [`ControlOp`] with a
//! [`ControlPayload`] and receives a JSON array of [`Instruction`]s. The
//! array is decoded once, here, and matched exhaustively by the engine.

use crate::error::ProtocolResult;
use crate::request::StreamingSyncRequest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Operations accepted by the storage extension's control call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlOp {
    /// Begin a sync iteration.
    Start,
    /// End the current sync iteration.
    Stop,
    /// Feed a text line received from the stream.
    LineText,
    /// Feed a binary line received from the stream.
    LineBinary,
    /// Fresh credentials are available.
    RefreshedToken,
    /// The upload queue was drained and the local target advanced.
    CompletedUpload,
    /// The set of active stream subscriptions changed.
    UpdateSubscriptions,
}

impl ControlOp {
    /// Returns the operation name understood by the extension.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlOp::Start => "start",
            ControlOp::Stop => "stop",
            ControlOp::LineText => "line_text",
            ControlOp::LineBinary => "line_binary",
            ControlOp::RefreshedToken => "refreshed_token",
            ControlOp::CompletedUpload => "completed_upload",
            ControlOp::UpdateSubscriptions => "update_subscriptions",
        }
    }
}

impl fmt::Display for ControlOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload passed along with a control operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlPayload {
    /// No payload.
    None,
    /// A text payload (stream lines).
    Text(String),
    /// A binary payload.
    Binary(Vec<u8>),
    /// A JSON document.
    Json(Value),
}

impl ControlPayload {
    /// Serializes `value` into a JSON payload.
    pub fn json<T: Serialize>(value: &T) -> ProtocolResult<Self> {
        Ok(ControlPayload::Json(serde_json::to_value(value)?))
    }

    /// Returns the payload as text, if it is textual or JSON.
    pub fn as_text(&self) -> Option<String> {
        match self {
            ControlPayload::Text(text) => Some(text.clone()),
            ControlPayload::Json(value) => Some(value.to_string()),
            ControlPayload::None | ControlPayload::Binary(_) => None,
        }
    }
}

/// Log severity of a [`Instruction::LogLine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogSeverity {
    /// Debug output.
    Debug,
    /// Informational output.
    Info,
    /// Something went wrong but was handled.
    Warning,
}

/// Sync state for one priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorePriorityStatus {
    /// The priority.
    pub priority: i32,
    /// Unix timestamp (seconds) of the last completed sync at this priority.
    #[serde(default)]
    pub last_synced_at: Option<i64>,
    /// Whether a sync at this priority ever completed.
    #[serde(default)]
    pub has_synced: Option<bool>,
}

/// Download counters for one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketProgress {
    /// Bucket priority.
    pub priority: i32,
    /// Operations downloaded as of the last completed checkpoint.
    pub at_last: i64,
    /// Operations downloaded since the last completed checkpoint.
    pub since_last: i64,
    /// Operations the bucket holds at the target checkpoint.
    pub target_count: i64,
}

/// Download progress towards the current checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreDownloadProgress {
    /// Per-bucket counters.
    pub buckets: BTreeMap<String, BucketProgress>,
}

/// State of one stream subscription as tracked by the extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreStreamStatus {
    /// Stream name.
    pub name: String,
    /// Stream parameters.
    #[serde(default)]
    pub parameters: Option<Value>,
    /// Effective priority.
    #[serde(default)]
    pub priority: Option<i32>,
    /// Whether the stream is part of the current checkpoint.
    #[serde(default)]
    pub active: bool,
    /// Whether the service syncs the stream by default.
    #[serde(default)]
    pub is_default: bool,
    /// Unix timestamp (seconds) at which the subscription expires.
    #[serde(default)]
    pub expires_at: Option<i64>,
    /// Unix timestamp (seconds) of the last completed sync.
    #[serde(default)]
    pub last_synced_at: Option<i64>,
}

/// The extension's view of the sync status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreSyncStatus {
    /// Whether a sync stream is open.
    pub connected: bool,
    /// Whether a sync stream is being opened.
    pub connecting: bool,
    /// Per-priority sync state, highest priority first.
    #[serde(default)]
    pub priority_status: Vec<CorePriorityStatus>,
    /// Download progress, while a checkpoint is being downloaded.
    #[serde(default)]
    pub downloading: Option<CoreDownloadProgress>,
    /// Stream subscriptions.
    #[serde(default)]
    pub streams: Vec<CoreStreamStatus>,
}

/// An instruction returned by the storage extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    /// Forward a line to the logger.
    LogLine {
        /// Severity.
        severity: LogSeverity,
        /// Message.
        line: String,
    },
    /// Replace the sync status.
    UpdateSyncStatus {
        /// New core status.
        status: CoreSyncStatus,
    },
    /// Open the sync stream with this request body.
    EstablishSyncStream {
        /// Request body.
        request: StreamingSyncRequest,
    },
    /// Credentials are about to expire or have expired.
    FetchCredentials {
        /// Whether the current token already expired.
        did_expire: bool,
    },
    /// Close the sync stream.
    CloseSyncStream {
        /// Reconnect immediately without reporting a disconnect.
        #[serde(default)]
        hide_disconnect: bool,
    },
    /// Flush pending file system writes.
    FlushFileSystem {},
    /// A checkpoint was applied completely.
    DidCompleteSync {},
}

impl Instruction {
    /// Decodes the JSON array returned by the control call.
    pub fn decode_all(json: &str) -> ProtocolResult<Vec<Instruction>> {
        Ok(serde_json::from_str(json)?)
    }

    /// Encodes a list of instructions as the control call would return it.
    pub fn encode_all(instructions: &[Instruction]) -> ProtocolResult<String> {
        Ok(serde_json::to_string(instructions)?)
    }
}
