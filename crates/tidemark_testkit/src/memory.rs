//! In-memory storage collaborator.
//!
//! [`MemoryStorage`] keeps buckets, the write queue and the synced tables in
//! memory. Its control call emulates the storage extension closely enough to
//! drive the engine end to end: it tracks the target checkpoint, validates
//! additive checksums and applies data once local writes allow it.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};
use tidemark_sync_engine::{
    ChecksumValidation, EventBus, EventStream, StorageAdapter, SyncError, SyncResult,
    TableUpdate, BUCKETS_TABLE, CRUD_TABLE, FULL_SYNC_PRIORITY, OPLOG_TABLE,
};
use tidemark_sync_protocol::{
    BucketProgress, BucketRequest, BucketState, Checkpoint, ControlOp, ControlPayload,
    CoreDownloadProgress, CorePriorityStatus, CoreStreamStatus, CoreSyncStatus, CrudEntry,
    Instruction, LogSeverity, OpType, OplogEntry, RequestedStream, StartSyncStream,
    StreamingSyncLine, StreamingSyncRequest, SyncDataBucket, UpdateType, MAX_OP_ID,
};

/// Seconds before expiry at which the emulated extension asks for a new token.
const TOKEN_REFRESH_THRESHOLD: i64 = 30;

fn parse_op_id(op_id: &str) -> SyncResult<i64> {
    op_id
        .parse()
        .map_err(|_| SyncError::storage(format!("invalid op id {op_id}")))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

fn payload_json<T: DeserializeOwned>(payload: &ControlPayload) -> SyncResult<T> {
    match payload {
        ControlPayload::Json(value) => Ok(serde_json::from_value(value.clone())?),
        ControlPayload::Text(text) => Ok(serde_json::from_str(text)?),
        ControlPayload::None | ControlPayload::Binary(_) => {
            Err(SyncError::Protocol("expected a JSON payload".to_string()))
        }
    }
}

fn log(severity: LogSeverity, line: impl Into<String>) -> Instruction {
    Instruction::LogLine {
        severity,
        line: line.into(),
    }
}

#[derive(Debug, Clone, Default)]
struct BucketRecord {
    last_op: i64,
    ops: Vec<OplogEntry>,
    checksum_base: i64,
    count_at_last: i64,
    pending_delete: bool,
}

impl BucketRecord {
    fn checksum_up_to(&self, op_id: i64) -> i64 {
        self.ops
            .iter()
            .filter(|op| op.op_id_value().map_or(false, |id| id <= op_id))
            .fold(self.checksum_base, |acc, op| acc.wrapping_add(op.checksum))
    }
}

/// Compaction calls observed by the storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionCounts {
    /// Calls of `delete_pending_buckets`.
    pub delete_pending_buckets: usize,
    /// Calls of `clear_remove_ops`.
    pub clear_remove_ops: usize,
}

struct MemoryState {
    table_names: Vec<String>,
    buckets: BTreeMap<String, BucketRecord>,
    local_last_op: String,
    local_target: String,
    crud: VecDeque<CrudEntry>,
    next_client_id: i64,
    crud_sequence: i64,
    tables: BTreeMap<String, BTreeMap<String, Map<String, Value>>>,
    compactions: CompactionCounts,

    target: Option<Checkpoint>,
    blocked: Option<Option<i32>>,
    downloading: bool,
    connected: bool,
    connecting: bool,
    priority_status: BTreeMap<i32, CorePriorityStatus>,
    subscriptions: Vec<RequestedStream>,
    control_log: Vec<(ControlOp, ControlPayload)>,
    scripted: HashMap<ControlOp, VecDeque<Vec<Instruction>>>,
}

impl MemoryState {
    fn new(table_names: Vec<String>) -> Self {
        Self {
            table_names,
            buckets: BTreeMap::new(),
            local_last_op: "0".to_string(),
            local_target: "0".to_string(),
            crud: VecDeque::new(),
            next_client_id: 1,
            crud_sequence: 0,
            tables: BTreeMap::new(),
            compactions: CompactionCounts::default(),
            target: None,
            blocked: None,
            downloading: false,
            connected: false,
            connecting: false,
            priority_status: BTreeMap::new(),
            subscriptions: Vec::new(),
            control_log: Vec::new(),
            scripted: HashMap::new(),
        }
    }

    fn save_bucket(&mut self, bucket: &SyncDataBucket) {
        let record = self.buckets.entry(bucket.bucket.clone()).or_default();
        if record.pending_delete {
            *record = BucketRecord::default();
        }
        record.ops.extend(bucket.data.iter().cloned());
    }

    fn bucket_states(&self) -> Vec<BucketState> {
        self.buckets
            .iter()
            .filter(|(_, record)| !record.pending_delete)
            .map(|(name, record)| BucketState {
                bucket: name.clone(),
                op_id: record.last_op.to_string(),
            })
            .collect()
    }

    fn delete_bucket(&mut self, bucket: &str) {
        if let Some(record) = self.buckets.get_mut(bucket) {
            *record = BucketRecord {
                pending_delete: true,
                ..BucketRecord::default()
            };
        }
    }

    fn delete_pending_buckets(&mut self) {
        self.buckets.retain(|_, record| !record.pending_delete);
        self.compactions.delete_pending_buckets += 1;
    }

    fn clear_remove_ops(&mut self) {
        for record in self.buckets.values_mut() {
            let last_op = record.last_op;
            let mut cleared = 0i64;
            record.ops.retain(|op| {
                let superseded = op.op == OpType::Remove
                    && op.op_id_value().map_or(false, |id| id <= last_op);
                if superseded {
                    cleared = cleared.wrapping_add(op.checksum);
                }
                !superseded
            });
            record.checksum_base = record.checksum_base.wrapping_add(cleared);
        }
        self.compactions.clear_remove_ops += 1;
    }

    fn in_scope(checkpoint: &Checkpoint, priority: Option<i32>) -> Vec<String> {
        match priority {
            Some(p) => checkpoint
                .buckets_for_priority(p)
                .into_iter()
                .map(|b| b.bucket.clone())
                .collect(),
            None => checkpoint.bucket_names(),
        }
    }

    fn validate(
        &self,
        checkpoint: &Checkpoint,
        priority: Option<i32>,
    ) -> SyncResult<ChecksumValidation> {
        let last_op = parse_op_id(&checkpoint.last_op_id)?;
        let in_scope: BTreeSet<String> = Self::in_scope(checkpoint, priority).into_iter().collect();
        let failed: Vec<String> = checkpoint
            .buckets
            .iter()
            .filter(|b| in_scope.contains(&b.bucket))
            .filter(|b| {
                let local = self
                    .buckets
                    .get(&b.bucket)
                    .filter(|record| !record.pending_delete)
                    .map_or(0, |record| record.checksum_up_to(last_op));
                local as u32 != b.checksum as u32
            })
            .map(|b| b.bucket.clone())
            .collect();
        if failed.is_empty() {
            Ok(ChecksumValidation::valid())
        } else {
            Ok(ChecksumValidation::failed(failed))
        }
    }

    fn set_last_op(
        &mut self,
        buckets: &[String],
        last_op_id: &str,
        write_checkpoint: Option<&str>,
    ) -> SyncResult<()> {
        let last_op = parse_op_id(last_op_id)?;
        for bucket in buckets {
            if let Some(record) = self.buckets.get_mut(bucket) {
                record.last_op = record.last_op.max(last_op);
            }
        }
        if let Some(write_checkpoint) = write_checkpoint {
            self.local_last_op = write_checkpoint.to_string();
        }
        Ok(())
    }

    fn can_apply(&self, priority: Option<i32>) -> SyncResult<bool> {
        if !self.crud.is_empty() {
            return Ok(false);
        }
        if priority.is_some() {
            return Ok(true);
        }
        if self.local_target == MAX_OP_ID {
            return Ok(false);
        }
        Ok(parse_op_id(&self.local_target)? <= parse_op_id(&self.local_last_op)?)
    }

    /// Applies bucket data to the tables. Returns the written tables, or
    /// `None` if local writes block the checkpoint.
    fn sync_local(
        &mut self,
        checkpoint: &Checkpoint,
        priority: Option<i32>,
    ) -> SyncResult<Option<BTreeSet<String>>> {
        if !self.can_apply(priority)? {
            return Ok(None);
        }

        let last_op = parse_op_id(&checkpoint.last_op_id)?;
        let mut ops: Vec<(i64, OplogEntry)> = Vec::new();
        for bucket in Self::in_scope(checkpoint, priority) {
            if let Some(record) = self.buckets.get_mut(&bucket) {
                for op in &record.ops {
                    let id = op.op_id_value()?;
                    if id <= last_op {
                        ops.push((id, op.clone()));
                    }
                }
                record.count_at_last = record.ops.len() as i64;
            }
        }
        ops.sort_by_key(|(id, _)| *id);

        let mut touched = BTreeSet::new();
        for (_, op) in ops {
            let (Some(table), Some(id)) = (op.object_type.clone(), op.object_id.clone()) else {
                continue;
            };
            match op.op {
                OpType::Put => {
                    let data = op.data.as_deref().unwrap_or("{}");
                    let row: Map<String, Value> = serde_json::from_str(data)
                        .map_err(|e| SyncError::storage(format!("invalid row data: {e}")))?;
                    self.tables.entry(table.clone()).or_default().insert(id, row);
                }
                OpType::Remove => {
                    if let Some(rows) = self.tables.get_mut(&table) {
                        rows.remove(&id);
                    }
                }
                OpType::Move | OpType::Clear => continue,
            }
            touched.insert(table);
        }

        let now = Some(unix_now());
        let entry_priority = priority.unwrap_or(FULL_SYNC_PRIORITY);
        self.priority_status.insert(
            entry_priority,
            CorePriorityStatus {
                priority: entry_priority,
                last_synced_at: now,
                has_synced: Some(true),
            },
        );
        Ok(Some(touched))
    }

    fn core_status(&self) -> CoreSyncStatus {
        let downloading = match (&self.target, self.downloading) {
            (Some(target), true) => Some(CoreDownloadProgress {
                buckets: target
                    .buckets
                    .iter()
                    .map(|b| {
                        let record = self.buckets.get(&b.bucket).cloned().unwrap_or_default();
                        let received = record.ops.len() as i64;
                        let progress = BucketProgress {
                            priority: b.effective_priority(),
                            at_last: record.count_at_last,
                            since_last: received - record.count_at_last,
                            target_count: b.count.unwrap_or(received),
                        };
                        (b.bucket.clone(), progress)
                    })
                    .collect(),
            }),
            _ => None,
        };
        CoreSyncStatus {
            connected: self.connected,
            connecting: self.connecting,
            priority_status: self.priority_status.values().cloned().collect(),
            downloading,
            streams: self
                .subscriptions
                .iter()
                .map(|s| CoreStreamStatus {
                    name: s.name.clone(),
                    parameters: s.params.clone(),
                    priority: s.priority,
                    active: true,
                    is_default: false,
                    expires_at: None,
                    last_synced_at: None,
                })
                .collect(),
        }
    }

    fn status_instruction(&self) -> Instruction {
        Instruction::UpdateSyncStatus {
            status: self.core_status(),
        }
    }

    fn start(&mut self, client_id: &str, payload: &ControlPayload) -> SyncResult<Vec<Instruction>> {
        let start: StartSyncStream = match payload {
            ControlPayload::None => StartSyncStream::default(),
            other => payload_json(other)?,
        };
        self.subscriptions = start.active_streams.clone();
        self.connecting = true;
        self.connected = false;

        let request = StreamingSyncRequest {
            buckets: Some(
                self.bucket_states()
                    .into_iter()
                    .map(|state| BucketRequest {
                        name: state.bucket,
                        after: state.op_id,
                    })
                    .collect(),
            ),
            only: None,
            include_checksum: true,
            raw_data: true,
            parameters: start.parameters,
            client_id: Some(client_id.to_string()),
            app_metadata: (!start.app_metadata.is_empty()).then_some(start.app_metadata),
            streams: Some(serde_json::json!({
                "include_defaults": start.include_defaults,
                "subscriptions": start.active_streams,
            })),
        };
        Ok(vec![
            self.status_instruction(),
            Instruction::EstablishSyncStream { request },
        ])
    }

    fn line(&mut self, payload: &ControlPayload) -> SyncResult<(Vec<Instruction>, BTreeSet<String>)> {
        let ControlPayload::Text(text) = payload else {
            return Err(SyncError::Protocol("line_text expects a text payload".to_string()));
        };
        let mut touched = BTreeSet::new();
        let was_connected = self.connected;
        self.connected = true;
        self.connecting = false;
        let mut out = Vec::new();
        if !was_connected {
            out.push(self.status_instruction());
        }

        match StreamingSyncLine::parse(text)? {
            Some(StreamingSyncLine::Checkpoint(checkpoint)) => {
                let keep: BTreeSet<String> = checkpoint.bucket_names().into_iter().collect();
                let stale: Vec<String> = self
                    .buckets
                    .keys()
                    .filter(|name| !keep.contains(*name))
                    .cloned()
                    .collect();
                for bucket in stale {
                    self.delete_bucket(&bucket);
                }
                self.target = Some(checkpoint);
                self.downloading = true;
                out.push(self.status_instruction());
            }
            Some(StreamingSyncLine::CheckpointDiff(diff)) => match self.target.take() {
                Some(base) => {
                    for bucket in &diff.removed_buckets {
                        self.delete_bucket(bucket);
                    }
                    self.target = Some(diff.apply_to(&base));
                    self.downloading = true;
                    out.push(self.status_instruction());
                }
                None => out.push(log(
                    LogSeverity::Warning,
                    "checkpoint_diff received without a checkpoint",
                )),
            },
            Some(StreamingSyncLine::Data(bucket)) => {
                self.save_bucket(&bucket);
                touched.insert(OPLOG_TABLE.to_string());
                out.push(self.status_instruction());
            }
            Some(StreamingSyncLine::CheckpointComplete(_)) => {
                let (instructions, applied) = self.complete_checkpoint(None)?;
                out.extend(instructions);
                touched.extend(applied);
            }
            Some(StreamingSyncLine::PartialCheckpointComplete(partial)) => {
                let (instructions, applied) = self.complete_checkpoint(Some(partial.priority))?;
                out.extend(instructions);
                touched.extend(applied);
            }
            Some(StreamingSyncLine::TokenExpiresIn(seconds)) => {
                if seconds <= 0 {
                    out.push(Instruction::FetchCredentials { did_expire: true });
                    out.push(Instruction::CloseSyncStream {
                        hide_disconnect: false,
                    });
                } else if seconds < TOKEN_REFRESH_THRESHOLD {
                    out.push(Instruction::FetchCredentials { did_expire: false });
                }
            }
            None => out.push(log(LogSeverity::Debug, format!("ignoring line {text}"))),
        }
        Ok((out, touched))
    }

    fn complete_checkpoint(
        &mut self,
        priority: Option<i32>,
    ) -> SyncResult<(Vec<Instruction>, BTreeSet<String>)> {
        let Some(target) = self.target.clone() else {
            return Ok((
                vec![log(
                    LogSeverity::Warning,
                    "checkpoint_complete received without a checkpoint",
                )],
                BTreeSet::new(),
            ));
        };

        let validation = self.validate(&target, priority)?;
        if !validation.valid {
            for bucket in &validation.failed_buckets {
                self.delete_bucket(bucket);
            }
            return Ok((
                vec![
                    log(
                        LogSeverity::Warning,
                        format!("checksum mismatch for {:?}", validation.failed_buckets),
                    ),
                    Instruction::CloseSyncStream {
                        hide_disconnect: false,
                    },
                ],
                BTreeSet::new(),
            ));
        }

        let buckets = Self::in_scope(&target, priority);
        let write_checkpoint = match priority {
            Some(_) => None,
            None => target.write_checkpoint.as_deref(),
        };
        self.set_last_op(&buckets, &target.last_op_id, write_checkpoint)?;

        let Some(touched) = self.sync_local(&target, priority)? else {
            self.blocked = Some(priority);
            return Ok((
                vec![log(
                    LogSeverity::Info,
                    "local writes pending, waiting before applying checkpoint",
                )],
                BTreeSet::new(),
            ));
        };

        let mut out = Vec::new();
        if priority.is_none() {
            self.blocked = None;
            self.downloading = false;
            self.delete_pending_buckets();
            out.push(self.status_instruction());
            out.push(Instruction::DidCompleteSync {});
        } else {
            out.push(self.status_instruction());
        }
        Ok((out, touched))
    }

    fn stop(&mut self) -> Vec<Instruction> {
        self.connected = false;
        self.connecting = false;
        self.target = None;
        self.blocked = None;
        self.downloading = false;
        Vec::new()
    }

    fn completed_upload(&mut self) -> SyncResult<(Vec<Instruction>, BTreeSet<String>)> {
        match self.blocked {
            Some(priority) => self.complete_checkpoint(priority),
            None => Ok((Vec::new(), BTreeSet::new())),
        }
    }
}

/// In-memory [`StorageAdapter`] with an emulated storage extension.
pub struct MemoryStorage {
    client_id: String,
    state: Mutex<MemoryState>,
    updates: EventBus<TableUpdate>,
}

impl MemoryStorage {
    /// Creates an empty storage with a fixed client id.
    pub fn new() -> Self {
        Self::with_tables(&[])
    }

    /// Creates an empty storage that reports `tables` as its local tables.
    pub fn with_tables(tables: &[&str]) -> Self {
        Self {
            client_id: "test-client".to_string(),
            state: Mutex::new(MemoryState::new(
                tables.iter().map(|t| t.to_string()).collect(),
            )),
            updates: EventBus::new(),
        }
    }

    fn notify(&self, tables: BTreeSet<String>) {
        if !tables.is_empty() {
            self.updates.emit(TableUpdate { tables });
        }
    }

    /// Queues a local write the way a table trigger would, and applies it to
    /// the local table.
    pub fn insert_crud(
        &self,
        op: UpdateType,
        table: &str,
        id: &str,
        data: Option<Map<String, Value>>,
        transaction_id: Option<i64>,
    ) -> i64 {
        let client_id = {
            let mut state = self.state.lock();
            let client_id = state.next_client_id;
            state.next_client_id += 1;
            state.crud_sequence += 1;
            state.local_target = MAX_OP_ID.to_string();

            let rows = state.tables.entry(table.to_string()).or_default();
            match op {
                UpdateType::Put => {
                    rows.insert(id.to_string(), data.clone().unwrap_or_default());
                }
                UpdateType::Patch => {
                    let row = rows.entry(id.to_string()).or_default();
                    if let Some(data) = &data {
                        row.extend(data.clone());
                    }
                }
                UpdateType::Delete => {
                    rows.remove(id);
                }
            }

            state.crud.push_back(CrudEntry {
                client_id,
                op,
                table: table.to_string(),
                id: id.to_string(),
                transaction_id,
                op_data: data,
                metadata: None,
                previous_values: None,
            });
            client_id
        };
        self.notify([CRUD_TABLE.to_string(), table.to_string()].into());
        client_id
    }

    /// Returns a row of a local table.
    pub fn row(&self, table: &str, id: &str) -> Option<Map<String, Value>> {
        self.state
            .lock()
            .tables
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned()
    }

    /// Number of rows in a local table.
    pub fn row_count(&self, table: &str) -> usize {
        self.state.lock().tables.get(table).map_or(0, BTreeMap::len)
    }

    /// Number of queued writes.
    pub fn crud_len(&self) -> usize {
        self.state.lock().crud.len()
    }

    /// Current `$local` target.
    pub fn local_target_op(&self) -> String {
        self.state.lock().local_target.clone()
    }

    /// Current `$local` last op.
    pub fn local_last_op(&self) -> String {
        self.state.lock().local_last_op.clone()
    }

    /// Number of stored operations of a bucket, including pending deletes.
    pub fn bucket_op_count(&self, bucket: &str) -> usize {
        self.state.lock().buckets.get(bucket).map_or(0, |b| b.ops.len())
    }

    /// Compaction calls so far.
    pub fn compaction_counts(&self) -> CompactionCounts {
        self.state.lock().compactions
    }

    /// Operations of every control call so far.
    pub fn control_calls(&self) -> Vec<ControlOp> {
        self.state.lock().control_log.iter().map(|(op, _)| *op).collect()
    }

    /// Control calls with their payloads.
    pub fn control_log(&self) -> Vec<(ControlOp, ControlPayload)> {
        self.state.lock().control_log.clone()
    }

    /// The subscription set last announced through `start` or
    /// `update_subscriptions`.
    pub fn announced_subscriptions(&self) -> Vec<RequestedStream> {
        self.state.lock().subscriptions.clone()
    }

    /// Makes the next control call for `op` answer `instructions` instead of
    /// the emulated answer.
    pub fn script_control(&self, op: ControlOp, instructions: Vec<Instruction>) {
        self.state
            .lock()
            .scripted
            .entry(op)
            .or_default()
            .push_back(instructions);
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn local_table_names(&self) -> SyncResult<Vec<String>> {
        Ok(self.state.lock().table_names.clone())
    }

    async fn client_id(&self) -> SyncResult<String> {
        Ok(self.client_id.clone())
    }

    async fn control(&self, op: ControlOp, payload: ControlPayload) -> SyncResult<String> {
        let (instructions, touched) = {
            let mut state = self.state.lock();
            state.control_log.push((op, payload.clone()));

            let scripted = state.scripted.get_mut(&op).and_then(VecDeque::pop_front);
            match scripted {
                Some(instructions) => (instructions, BTreeSet::new()),
                None => match op {
                    ControlOp::Start => (state.start(&self.client_id, &payload)?, BTreeSet::new()),
                    ControlOp::Stop => (state.stop(), BTreeSet::new()),
                    ControlOp::LineText => state.line(&payload)?,
                    ControlOp::LineBinary => {
                        return Err(SyncError::Protocol(
                            "binary lines are not supported".to_string(),
                        ))
                    }
                    ControlOp::CompletedUpload => state.completed_upload()?,
                    ControlOp::RefreshedToken => (Vec::new(), BTreeSet::new()),
                    ControlOp::UpdateSubscriptions => {
                        state.subscriptions = payload_json(&payload)?;
                        (Vec::new(), BTreeSet::new())
                    }
                },
            }
        };
        self.notify(touched);
        Ok(Instruction::encode_all(&instructions)?)
    }

    async fn save_bucket(&self, bucket: &SyncDataBucket) -> SyncResult<()> {
        self.state.lock().save_bucket(bucket);
        self.notify([OPLOG_TABLE.to_string(), BUCKETS_TABLE.to_string()].into());
        Ok(())
    }

    async fn bucket_states(&self) -> SyncResult<Vec<BucketState>> {
        Ok(self.state.lock().bucket_states())
    }

    async fn delete_bucket(&self, bucket: &str) -> SyncResult<()> {
        self.state.lock().delete_bucket(bucket);
        Ok(())
    }

    async fn delete_pending_buckets(&self) -> SyncResult<()> {
        self.state.lock().delete_pending_buckets();
        Ok(())
    }

    async fn clear_remove_ops(&self) -> SyncResult<()> {
        self.state.lock().clear_remove_ops();
        Ok(())
    }

    async fn validate_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        priority: Option<i32>,
    ) -> SyncResult<ChecksumValidation> {
        self.state.lock().validate(checkpoint, priority)
    }

    async fn set_last_op(
        &self,
        buckets: &[String],
        last_op_id: &str,
        write_checkpoint: Option<&str>,
    ) -> SyncResult<()> {
        self.state
            .lock()
            .set_last_op(buckets, last_op_id, write_checkpoint)
    }

    async fn sync_local(&self, checkpoint: &Checkpoint, priority: Option<i32>) -> SyncResult<bool> {
        let touched = self.state.lock().sync_local(checkpoint, priority)?;
        match touched {
            Some(tables) => {
                self.notify(tables);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn local_target(&self) -> SyncResult<Option<String>> {
        Ok(Some(self.state.lock().local_target.clone()))
    }

    async fn crud_items(&self, limit: usize) -> SyncResult<Vec<CrudEntry>> {
        Ok(self.state.lock().crud.iter().take(limit).cloned().collect())
    }

    async fn crud_transaction(&self, transaction_id: i64) -> SyncResult<Vec<CrudEntry>> {
        Ok(self
            .state
            .lock()
            .crud
            .iter()
            .filter(|entry| entry.transaction_id == Some(transaction_id))
            .cloned()
            .collect())
    }

    async fn has_crud(&self) -> SyncResult<bool> {
        Ok(!self.state.lock().crud.is_empty())
    }

    async fn crud_sequence(&self) -> SyncResult<Option<i64>> {
        Ok(Some(self.state.lock().crud_sequence))
    }

    async fn complete_crud(
        &self,
        last_client_id: i64,
        write_checkpoint: Option<&str>,
    ) -> SyncResult<()> {
        {
            let mut state = self.state.lock();
            state.crud.retain(|entry| entry.client_id > last_client_id);
            state.local_target = match write_checkpoint {
                Some(checkpoint) if state.crud.is_empty() => checkpoint.to_string(),
                _ => MAX_OP_ID.to_string(),
            };
        }
        self.notify([CRUD_TABLE.to_string()].into());
        Ok(())
    }

    async fn commit_local_target(&self, expected_sequence: i64, op_id: &str) -> SyncResult<bool> {
        let mut state = self.state.lock();
        if !state.crud.is_empty() || state.crud_sequence != expected_sequence {
            return Ok(false);
        }
        state.local_target = op_id.to_string();
        Ok(true)
    }

    async fn offline_sync_status(&self) -> SyncResult<CoreSyncStatus> {
        let state = self.state.lock();
        let mut status = state.core_status();
        status.connected = false;
        status.connecting = false;
        status.downloading = None;
        Ok(status)
    }

    fn table_updates(&self) -> EventStream<TableUpdate> {
        self.updates.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_sync_protocol::BucketChecksum;

    fn put(op_id: &str, id: &str, checksum: i64) -> OplogEntry {
        OplogEntry::put(op_id, "todos", id, r#"{"title":"a"}"#, checksum)
    }

    #[tokio::test]
    async fn checksums_are_additive() {
        let storage = MemoryStorage::new();
        storage
            .save_bucket(&SyncDataBucket::new("b", vec![put("1", "a", 3), put("2", "b", 4)]))
            .await
            .unwrap();

        let valid = Checkpoint::new("2", vec![BucketChecksum::new("b", 7)]);
        assert!(storage.validate_checkpoint(&valid, None).await.unwrap().valid);

        let partial = Checkpoint::new("1", vec![BucketChecksum::new("b", 3)]);
        assert!(storage.validate_checkpoint(&partial, None).await.unwrap().valid);

        let wrong = Checkpoint::new("2", vec![BucketChecksum::new("b", 8)]);
        let result = storage.validate_checkpoint(&wrong, None).await.unwrap();
        assert_eq!(result.failed_buckets, vec!["b"]);
    }

    #[tokio::test]
    async fn crud_blocks_sync_local() {
        let storage = MemoryStorage::new();
        storage.insert_crud(UpdateType::Put, "todos", "x", None, None);
        let checkpoint = Checkpoint::new("0", Vec::new());
        assert!(!storage.sync_local(&checkpoint, None).await.unwrap());
        assert_eq!(storage.local_target_op(), MAX_OP_ID);
    }

    #[tokio::test]
    async fn complete_crud_sets_target_only_when_empty() {
        let storage = MemoryStorage::new();
        let first = storage.insert_crud(UpdateType::Put, "todos", "x", None, None);
        storage.insert_crud(UpdateType::Put, "todos", "y", None, None);

        storage.complete_crud(first, Some("10")).await.unwrap();
        assert_eq!(storage.local_target_op(), MAX_OP_ID);
        assert_eq!(storage.crud_len(), 1);

        storage.complete_crud(first + 1, Some("11")).await.unwrap();
        assert_eq!(storage.local_target_op(), "11");
    }

    #[tokio::test]
    async fn scripted_answers_take_precedence() {
        let storage = MemoryStorage::new();
        storage.script_control(ControlOp::Stop, vec![Instruction::FlushFileSystem {}]);

        let raw = storage.control(ControlOp::Stop, ControlPayload::None).await.unwrap();
        assert_eq!(
            Instruction::decode_all(&raw).unwrap(),
            vec![Instruction::FlushFileSystem {}]
        );
        let raw = storage.control(ControlOp::Stop, ControlPayload::None).await.unwrap();
        assert!(Instruction::decode_all(&raw).unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_remove_ops_keeps_checksums() {
        let storage = MemoryStorage::new();
        storage
            .save_bucket(&SyncDataBucket::new(
                "b",
                vec![put("1", "a", 3), OplogEntry::remove("2", "todos", "a", 5)],
            ))
            .await
            .unwrap();
        storage.set_last_op(&["b".to_string()], "2", None).await.unwrap();
        storage.clear_remove_ops().await.unwrap();

        assert_eq!(storage.bucket_op_count("b"), 1);
        let checkpoint = Checkpoint::new("2", vec![BucketChecksum::new("b", 8)]);
        assert!(storage.validate_checkpoint(&checkpoint, None).await.unwrap().valid);
    }
}
