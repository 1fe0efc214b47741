//! The streaming sync state machine.
//!
//! A [`StreamingSyncImplementation`] owns at most one streaming connection.
//! Its retry loop runs protocol iterations until disconnected: each
//! iteration sends `start` to the storage extension, opens the stream the
//! extension asks for, feeds every received line back into the extension
//! and acts on the returned [`Instruction`]s.
//!
//! Cancellation is hierarchical. The connection token is the parent of one
//! token per iteration, which in turn is the parent of the token of the
//! open HTTP stream. Iteration tokens are never reused.

use crate::config::SyncOptions;
use crate::connector::BackendConnector;
use crate::error::{SyncError, SyncResult};
use crate::http::HttpClient;
use crate::lock::{LockType, SyncLocks};
use crate::status::StatusHandle;
use crate::storage::{BucketStorage, CRUD_TABLE};
use crate::transport::RemoteTransport;
use crate::upload::CrudUploader;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tidemark_sync_protocol::{
    ControlOp, ControlPayload, Instruction, LogSeverity, RequestedStream, StartSyncStream,
    StreamingSyncRequest,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Inputs to the extension during one iteration, consumed in order.
#[derive(Debug)]
enum ControlEvent {
    Line(String),
    StreamClosed(Option<SyncError>),
    CompletedUpload,
    RefreshedToken,
    UpdateSubscriptions(Vec<RequestedStream>),
}

#[derive(Debug, Default, Clone, Copy)]
struct IterationOutcome {
    hide_disconnect: bool,
}

struct StreamTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct IterationState {
    events: mpsc::UnboundedSender<ControlEvent>,
    stream: Option<StreamTask>,
}

impl IterationState {
    async fn close_stream(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        stream.cancel.cancel();
        if let Err(e) = stream.task.await {
            if e.is_panic() {
                error!(error = %e, "sync stream task panicked");
            }
        }
    }
}

struct RunState {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Drives one streaming connection with retries.
pub struct StreamingSyncImplementation {
    storage: Arc<BucketStorage>,
    transport: Arc<RemoteTransport>,
    uploader: Arc<CrudUploader>,
    options: SyncOptions,
    status: StatusHandle,
    locks: Arc<SyncLocks>,
    subscriptions: Mutex<Vec<RequestedStream>>,
    run: Mutex<Option<RunState>>,
    closed: AtomicBool,
    control_tx: Mutex<Option<mpsc::UnboundedSender<ControlEvent>>>,
    upload_requested: AtomicBool,
}

impl StreamingSyncImplementation {
    /// Creates a disconnected state machine.
    pub fn new(
        storage: Arc<BucketStorage>,
        connector: Arc<dyn BackendConnector>,
        client: Arc<dyn HttpClient>,
        options: SyncOptions,
        status: StatusHandle,
        locks: Arc<SyncLocks>,
        subscriptions: Vec<RequestedStream>,
    ) -> Self {
        let transport = Arc::new(RemoteTransport::new(
            client,
            Arc::clone(&connector),
            options.user_agent.clone(),
        ));
        let uploader = Arc::new(CrudUploader::new(
            Arc::clone(&storage),
            connector,
            Arc::clone(&transport),
            status.clone(),
            Arc::clone(&locks),
            options.retry_delay,
        ));
        Self {
            storage,
            transport,
            uploader,
            options,
            status,
            locks,
            subscriptions: Mutex::new(subscriptions),
            run: Mutex::new(None),
            closed: AtomicBool::new(false),
            control_tx: Mutex::new(None),
            upload_requested: AtomicBool::new(false),
        }
    }

    /// The options this state machine was created with.
    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// The transport used for service requests.
    pub fn transport(&self) -> &Arc<RemoteTransport> {
        &self.transport
    }

    /// Starts the retry loop if it is not running.
    ///
    /// Resolves once the first connection attempt either opened a stream or
    /// failed. Does not wait for data to sync. After [`disconnect`] this
    /// instance never connects again.
    ///
    /// [`disconnect`]: StreamingSyncImplementation::disconnect
    pub async fn connect(self: &Arc<Self>) -> SyncResult<()> {
        let cancel = {
            let mut run = self.run.lock();
            if self.closed.load(Ordering::SeqCst) {
                debug!("connect after disconnect ignored");
                return Ok(());
            }
            match run.as_ref() {
                Some(state) => state.cancel.clone(),
                None => {
                    let cancel = CancellationToken::new();
                    self.status.update(|s| {
                        s.connecting = true;
                        s.data_flow.download_error = None;
                    });
                    let sync = tokio::spawn(Arc::clone(self).streaming_sync(cancel.clone()));
                    let watcher = tokio::spawn(Arc::clone(self).watch_crud(cancel.clone()));
                    *run = Some(RunState {
                        cancel: cancel.clone(),
                        tasks: vec![sync, watcher],
                    });
                    cancel
                }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            outcome = self.status.wait_for(|s| s.connected || s.data_flow.download_error.is_some()) => {
                outcome.map(|_| ())
            }
        }
    }

    /// Stops the retry loop and waits for it to finish.
    ///
    /// Errors of the stopped tasks are swallowed. Calling this while
    /// disconnected only resets the connection flags.
    pub async fn disconnect(&self) {
        let state = {
            let mut run = self.run.lock();
            self.closed.store(true, Ordering::SeqCst);
            run.take()
        };
        if let Some(state) = state {
            state.cancel.cancel();
            for task in state.tasks {
                if let Err(e) = task.await {
                    if e.is_panic() {
                        error!(error = %e, "sync task panicked");
                    }
                }
            }
        }
        self.status.update(|s| {
            s.connected = false;
            s.connecting = false;
            s.data_flow.downloading = false;
            s.data_flow.download_progress = None;
        });
        info!("disconnected");
    }

    /// Returns true once [`StreamingSyncImplementation::disconnect`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns true while the retry loop is running.
    pub fn is_running(&self) -> bool {
        self.run.lock().is_some()
    }

    /// Returns true while a protocol iteration accepts control commands.
    pub fn is_iteration_active(&self) -> bool {
        self.control_tx.lock().is_some()
    }

    /// Replaces the stream subscriptions sent with the next `start`.
    ///
    /// Returns true if the change was also queued to the active iteration.
    pub fn update_subscriptions(&self, streams: Vec<RequestedStream>) -> bool {
        *self.subscriptions.lock() = streams.clone();
        self.send_control(ControlEvent::UpdateSubscriptions(streams))
    }

    /// Current stream subscriptions.
    pub fn subscriptions(&self) -> Vec<RequestedStream> {
        self.subscriptions.lock().clone()
    }

    fn send_control(&self, event: ControlEvent) -> bool {
        match self.control_tx.lock().as_ref() {
            Some(events) => events.send(event).is_ok(),
            None => false,
        }
    }

    async fn streaming_sync(self: Arc<Self>, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            self.status.update(|s| s.connecting = true);

            let iteration = cancel.child_token();
            let result = self.streaming_sync_iteration(&iteration).await;
            iteration.cancel();
            if cancel.is_cancelled() {
                break;
            }

            match result {
                Ok(outcome) => {
                    if !outcome.hide_disconnect {
                        self.status.update(|s| {
                            s.connected = false;
                            s.connecting = true;
                        });
                    }
                    debug!(
                        hide_disconnect = outcome.hide_disconnect,
                        "sync iteration ended, reconnecting"
                    );
                }
                Err(err) => {
                    warn!(error = %err, "sync iteration failed");
                    self.status.update(|s| {
                        s.connected = false;
                        s.connecting = false;
                        s.data_flow.download_error = Some(err.to_string());
                    });
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.options.retry_delay) => {}
                    }
                }
            }
        }
        debug!("sync loop stopped");
    }

    async fn streaming_sync_iteration(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> SyncResult<IterationOutcome> {
        let _sync = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(IterationOutcome::default()),
            guard = self.locks.acquire(LockType::Sync) => guard,
        };

        let (events, mut receiver) = mpsc::unbounded_channel();
        *self.control_tx.lock() = Some(events.clone());
        let mut state = IterationState {
            events,
            stream: None,
        };

        let result = self.run_iteration(&mut state, &mut receiver, cancel).await;

        self.control_tx.lock().take();
        state.close_stream().await;
        self.stop_iteration().await;
        result
    }

    async fn run_iteration(
        self: &Arc<Self>,
        state: &mut IterationState,
        receiver: &mut mpsc::UnboundedReceiver<ControlEvent>,
        cancel: &CancellationToken,
    ) -> SyncResult<IterationOutcome> {
        let start = StartSyncStream {
            parameters: self.options.params.clone(),
            app_metadata: self.options.app_metadata.clone(),
            active_streams: self.subscriptions(),
            include_defaults: self.options.include_default_streams,
        };
        let instructions = self
            .storage
            .control(ControlOp::Start, ControlPayload::json(&start)?)
            .await?;
        if let Some(outcome) = self.handle_instructions(instructions, state, cancel).await? {
            return Ok(outcome);
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(IterationOutcome::default()),
                event = receiver.recv() => event,
            };
            let Some(event) = event else {
                return Ok(IterationOutcome::default());
            };

            let (op, payload) = match event {
                ControlEvent::Line(line) => (ControlOp::LineText, ControlPayload::Text(line)),
                ControlEvent::StreamClosed(None) => {
                    debug!("sync stream ended");
                    return Ok(IterationOutcome::default());
                }
                ControlEvent::StreamClosed(Some(err)) => return Err(err),
                ControlEvent::CompletedUpload => (ControlOp::CompletedUpload, ControlPayload::None),
                ControlEvent::RefreshedToken => (ControlOp::RefreshedToken, ControlPayload::None),
                ControlEvent::UpdateSubscriptions(streams) => (
                    ControlOp::UpdateSubscriptions,
                    ControlPayload::json(&streams)?,
                ),
            };

            let instructions = self.storage.control(op, payload).await?;
            if let Some(outcome) = self.handle_instructions(instructions, state, cancel).await? {
                return Ok(outcome);
            }
        }
    }

    async fn stop_iteration(&self) {
        match self.storage.control(ControlOp::Stop, ControlPayload::None).await {
            Ok(instructions) => {
                for instruction in instructions {
                    match instruction {
                        Instruction::LogLine { severity, line } => log_line(severity, &line),
                        Instruction::UpdateSyncStatus { status } => {
                            self.status.update(|s| s.apply_core(&status));
                        }
                        other => debug!(instruction = ?other, "ignoring instruction after stop"),
                    }
                }
            }
            Err(err) => warn!(error = %err, "stop command failed"),
        }
    }

    /// Acts on instructions. Returns an outcome if the iteration must end.
    async fn handle_instructions(
        self: &Arc<Self>,
        instructions: Vec<Instruction>,
        state: &mut IterationState,
        cancel: &CancellationToken,
    ) -> SyncResult<Option<IterationOutcome>> {
        let mut outcome = None;
        for instruction in instructions {
            match instruction {
                Instruction::LogLine { severity, line } => log_line(severity, &line),
                Instruction::UpdateSyncStatus { status } => {
                    self.status.update(|s| {
                        s.apply_core(&status);
                        s.data_flow.download_error = None;
                    });
                }
                Instruction::EstablishSyncStream { request } => {
                    self.open_stream(request, state, cancel)?;
                }
                Instruction::FetchCredentials { did_expire } => {
                    self.fetch_credentials(did_expire, state, cancel).await;
                }
                Instruction::CloseSyncStream { hide_disconnect } => {
                    state.close_stream().await;
                    outcome = Some(IterationOutcome { hide_disconnect });
                }
                Instruction::FlushFileSystem {} => {}
                Instruction::DidCompleteSync {} => {
                    self.status.update(|s| s.data_flow.download_error = None);
                }
            }
        }
        Ok(outcome)
    }

    fn open_stream(
        self: &Arc<Self>,
        request: StreamingSyncRequest,
        state: &mut IterationState,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        if state.stream.is_some() {
            return Err(SyncError::Protocol(
                "EstablishSyncStream received while a stream is open".to_string(),
            ));
        }

        let stream_cancel = cancel.child_token();
        let this = Arc::clone(self);
        let events = state.events.clone();
        let token = stream_cancel.clone();
        let task = tokio::spawn(async move {
            let result = this.pump_stream(request, &token, &events).await;
            let _ = events.send(ControlEvent::StreamClosed(result.err()));
        });

        state.stream = Some(StreamTask {
            cancel: stream_cancel,
            task,
        });
        Ok(())
    }

    async fn pump_stream(
        &self,
        request: StreamingSyncRequest,
        cancel: &CancellationToken,
        events: &mpsc::UnboundedSender<ControlEvent>,
    ) -> SyncResult<()> {
        let mut lines = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            opened = self.transport.post_stream(&request) => opened?,
        };
        self.status.update(|s| {
            s.connected = true;
            s.connecting = false;
        });
        info!("sync stream opened");

        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                line = lines.next() => line,
            };
            match line {
                Some(line) => {
                    if events.send(ControlEvent::Line(line?)).is_err() {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            }
        }
    }

    async fn fetch_credentials(
        &self,
        did_expire: bool,
        state: &IterationState,
        cancel: &CancellationToken,
    ) {
        if did_expire {
            debug!("credentials expired, invalidating");
            self.transport.invalidate_credentials().await;
            return;
        }

        let transport = Arc::clone(&self.transport);
        let events = state.events.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let fetched = tokio::select! {
                _ = cancel.cancelled() => return,
                fetched = transport.prefetch_credentials() => fetched,
            };
            match fetched {
                Ok(Some(_)) => {
                    let _ = events.send(ControlEvent::RefreshedToken);
                }
                Ok(None) => warn!("connector returned no credentials during refresh"),
                Err(err) => warn!(error = %err, "could not prefetch credentials"),
            }
        });
    }

    /// Runs the upload loop in the background if connected and no loop is
    /// running.
    pub fn trigger_crud_upload(self: &Arc<Self>) {
        let cancel = match self.run.lock().as_ref() {
            Some(state) => state.cancel.clone(),
            None => return,
        };
        self.spawn_upload(&cancel);
    }

    fn spawn_upload(self: &Arc<Self>, cancel: &CancellationToken) {
        // A running loop picks the request up when it finishes.
        self.upload_requested.store(true, Ordering::SeqCst);
        if !self.status.current().connected || self.locks.is_locked(LockType::Crud) {
            return;
        }
        let this = Arc::clone(self);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while !cancel.is_cancelled() && this.upload_requested.swap(false, Ordering::SeqCst) {
                if this.uploader.upload_all(&cancel).await {
                    debug!("local target advanced after upload");
                    this.send_control(ControlEvent::CompletedUpload);
                }
            }
        });
    }

    async fn watch_crud(self: Arc<Self>, cancel: CancellationToken) {
        let mut updates = self.storage.table_updates();
        let mut status = self.status.watch();
        let mut was_connected = status.borrow_and_update().connected;
        let mut last_trigger: Option<Instant> = None;

        loop {
            let trigger = tokio::select! {
                _ = cancel.cancelled() => break,
                update = updates.next() => match update {
                    Some(update) => update.contains(CRUD_TABLE),
                    None => break,
                },
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let connected = status.borrow_and_update().connected;
                    let rising = connected && !was_connected;
                    was_connected = connected;
                    rising
                }
            };
            if !trigger {
                continue;
            }

            if let Some(last) = last_trigger {
                let elapsed = last.elapsed();
                if elapsed < self.options.crud_throttle {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.options.crud_throttle - elapsed) => {}
                    }
                }
            }
            while updates.try_next().is_some() {}
            last_trigger = Some(Instant::now());
            self.spawn_upload(&cancel);
        }
    }
}

pub(crate) fn log_line(severity: LogSeverity, line: &str) {
    match severity {
        LogSeverity::Debug => debug!(target: "tidemark::core", "{line}"),
        LogSeverity::Info => info!(target: "tidemark::core", "{line}"),
        LogSeverity::Warning => warn!(target: "tidemark::core", "{line}"),
    }
}
