//! The application-facing connection manager.
//!
//! [`ConnectionManager`] serializes overlapping `connect` and `disconnect`
//! calls. Three operations cooperate, each shared by every caller that is
//! waiting for it:
//!
//! - the connect operation, which keeps connecting until the requested
//!   options stop changing,
//! - the disconnect operation, which tears down the current state machine,
//! - the construction of a new state machine.
//!
//! Stream subscriptions are tracked here independently of the connection
//! and handed to every state machine that gets created.

use crate::config::{SubscribeOptions, SyncOptions};
use crate::connector::BackendConnector;
use crate::error::SyncResult;
use crate::event_bus::EventStream;
use crate::http::{HttpClient, ReqwestClient};
use crate::lock::SyncLocks;
use crate::status::{StatusHandle, SyncStatus};
use crate::storage::{BucketStorage, StorageAdapter};
use crate::streaming::{log_line, StreamingSyncImplementation};
use crate::subscription::{subscription_key, SubscriptionKey, SyncStreamSubscription};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use tidemark_sync_protocol::{ControlOp, ControlPayload, Instruction, RequestedStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

type SharedOp = Shared<BoxFuture<'static, ()>>;

/// Spawns `future` and returns a handle any number of callers can await.
fn spawn_shared<F>(future: F) -> SharedOp
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(future)
        .map(|result| {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(error = %e, "connection task panicked");
                }
            }
        })
        .boxed()
        .shared()
}

struct PendingConnection {
    connector: Arc<dyn BackendConnector>,
    options: SyncOptions,
}

#[derive(Default)]
struct ManagerState {
    pending: Option<PendingConnection>,
    connecting: Option<SharedOp>,
    disconnecting: Option<SharedOp>,
    sync_init: Option<SharedOp>,
    sync: Option<Arc<StreamingSyncImplementation>>,
}

struct SubscriptionEntry {
    name: String,
    params: Option<Value>,
    options: SubscribeOptions,
    handles: BTreeSet<u64>,
}

#[derive(Default)]
struct SubscriptionRegistry {
    entries: BTreeMap<SubscriptionKey, SubscriptionEntry>,
    next_handle: u64,
}

impl SubscriptionRegistry {
    fn active_streams(&self) -> Vec<RequestedStream> {
        self.entries
            .values()
            .map(|entry| RequestedStream {
                name: entry.name.clone(),
                params: entry.params.clone(),
                ttl: entry.options.ttl.map(|ttl| ttl.as_secs()),
                priority: entry.options.priority,
            })
            .collect()
    }
}

pub(crate) struct ManagerInner {
    storage: Arc<BucketStorage>,
    http: Arc<dyn HttpClient>,
    status: StatusHandle,
    locks: Arc<SyncLocks>,
    state: Mutex<ManagerState>,
    subscriptions: Mutex<SubscriptionRegistry>,
}

impl ManagerInner {
    async fn run_connect(self: Arc<Self>) {
        loop {
            self.disconnect_internal().await;

            let pending = {
                let mut state = self.state.lock();
                match state.pending.take() {
                    Some(pending) => pending,
                    None => {
                        state.connecting = None;
                        return;
                    }
                }
            };

            let init = {
                let mut state = self.state.lock();
                let inner = Arc::clone(&self);
                let init = spawn_shared(async move { inner.init_sync(pending).await });
                state.sync_init = Some(init.clone());
                init
            };
            init.await;

            let disconnecting = self.state.lock().disconnecting.clone();
            if let Some(disconnecting) = disconnecting {
                disconnecting.await;
            }

            let sync = self.state.lock().sync.clone();
            if let Some(sync) = sync {
                if let Err(err) = sync.connect().await {
                    debug!(error = %err, "connect interrupted");
                }
            }

            let mut state = self.state.lock();
            if state.pending.is_none() {
                state.connecting = None;
                return;
            }
            debug!("connection options changed while connecting, reconnecting");
        }
    }

    async fn init_sync(self: Arc<Self>, pending: PendingConnection) {
        let created = match self.storage.init().await {
            Ok(()) => {
                let streams = self.subscriptions.lock().active_streams();
                Some(Arc::new(StreamingSyncImplementation::new(
                    Arc::clone(&self.storage),
                    pending.connector,
                    Arc::clone(&self.http),
                    pending.options,
                    self.status.clone(),
                    Arc::clone(&self.locks),
                    streams,
                )))
            }
            Err(err) => {
                warn!(error = %err, "could not initialize bucket storage");
                self.status
                    .update(|s| s.data_flow.download_error = Some(err.to_string()));
                None
            }
        };

        let mut state = self.state.lock();
        state.sync = created;
        state.sync_init = None;
    }

    async fn disconnect_internal(self: &Arc<Self>) {
        let op = {
            let mut state = self.state.lock();
            match &state.disconnecting {
                Some(op) => op.clone(),
                None => {
                    let inner = Arc::clone(self);
                    let op = spawn_shared(async move { inner.perform_disconnect().await });
                    state.disconnecting = Some(op.clone());
                    op
                }
            }
        };
        op.await;
    }

    async fn perform_disconnect(self: Arc<Self>) {
        let init = self.state.lock().sync_init.clone();
        if let Some(init) = init {
            init.await;
        }

        let sync = self.state.lock().sync.take();
        if let Some(sync) = sync {
            sync.disconnect().await;
        }

        self.state.lock().disconnecting = None;
    }

    fn subscribe(
        self: &Arc<Self>,
        name: &str,
        params: Option<Value>,
        options: SubscribeOptions,
    ) -> (SyncStreamSubscription, Vec<RequestedStream>) {
        let key = subscription_key(name, params.as_ref());
        let mut registry = self.subscriptions.lock();
        let id = registry.next_handle;
        registry.next_handle += 1;

        let entry = registry
            .entries
            .entry(key)
            .or_insert_with(|| SubscriptionEntry {
                name: name.to_string(),
                params: params.clone(),
                options: options.clone(),
                handles: BTreeSet::new(),
            });
        entry.options = options;
        entry.handles.insert(id);
        debug!(stream = name, handles = entry.handles.len(), "subscribed");

        let streams = registry.active_streams();
        let handle = SyncStreamSubscription::new(
            id,
            name.to_string(),
            params,
            Arc::downgrade(self),
        );
        (handle, streams)
    }

    pub(crate) async fn unsubscribe(&self, key: &SubscriptionKey, id: u64) -> SyncResult<()> {
        let streams = {
            let mut registry = self.subscriptions.lock();
            let Some(entry) = registry.entries.get_mut(key) else {
                return Ok(());
            };
            if !entry.handles.remove(&id) || !entry.handles.is_empty() {
                return Ok(());
            }
            registry.entries.remove(key);
            debug!(stream = %key.0, "last handle released, removing subscription");
            registry.active_streams()
        };
        self.announce(streams).await
    }

    /// Tells the storage extension about the current subscription set.
    async fn announce(&self, streams: Vec<RequestedStream>) -> SyncResult<()> {
        let sync = self.state.lock().sync.clone();
        if let Some(sync) = sync {
            if sync.update_subscriptions(streams.clone()) {
                return Ok(());
            }
        }

        let instructions = self
            .storage
            .control(ControlOp::UpdateSubscriptions, ControlPayload::json(&streams)?)
            .await?;
        for instruction in instructions {
            match instruction {
                Instruction::LogLine { severity, line } => log_line(severity, &line),
                other => debug!(instruction = ?other, "ignoring instruction without active stream"),
            }
        }

        let offline = self.storage.adapter().offline_sync_status().await?;
        self.status.update(|s| s.apply_offline(&offline));
        Ok(())
    }
}

/// Front door of the sync engine.
///
/// Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Creates a manager over `adapter`, talking to the service through `http`.
    pub fn new(adapter: Arc<dyn StorageAdapter>, http: Arc<dyn HttpClient>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                storage: Arc::new(BucketStorage::new(adapter)),
                http,
                status: StatusHandle::new(),
                locks: Arc::new(SyncLocks::new()),
                state: Mutex::new(ManagerState::default()),
                subscriptions: Mutex::new(SubscriptionRegistry::default()),
            }),
        }
    }

    /// Creates a manager using [`ReqwestClient`].
    pub fn with_reqwest(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self::new(adapter, Arc::new(ReqwestClient::new()))
    }

    /// Connects with `options`, replacing any earlier connection.
    ///
    /// Overlapping calls share one connect operation: only the options of the
    /// latest call are used. Resolves once the connection attempt opened a
    /// stream or failed. Failures are reported through [`SyncStatus`].
    pub async fn connect(&self, connector: Arc<dyn BackendConnector>, options: SyncOptions) {
        let (op, abort) = {
            let mut state = self.inner.state.lock();
            let had_pending = state.pending.is_some();
            state.pending = Some(PendingConnection { connector, options });
            let abort = !had_pending && (state.connecting.is_some() || state.sync.is_some());

            let op = match &state.connecting {
                Some(op) => op.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let op = spawn_shared(async move { inner.run_connect().await });
                    state.connecting = Some(op.clone());
                    op
                }
            };
            (op, abort)
        };

        if abort {
            debug!("aborting current connection for new options");
            self.inner.disconnect_internal().await;
        }
        op.await;
        info!("connect finished");
    }

    /// Disconnects and drops any queued reconnect.
    pub async fn disconnect(&self) {
        self.inner.state.lock().pending = None;
        self.inner.disconnect_internal().await;
    }

    /// Disconnects and completes every status subscription.
    pub async fn close(&self) {
        self.disconnect().await;
        self.inner.status.close();
    }

    /// Subscribes to a sync stream.
    ///
    /// The subscription set is announced to the storage extension on every
    /// call, which also refreshes the time-to-live of existing subscriptions.
    pub async fn subscribe(
        &self,
        name: &str,
        params: Option<Value>,
        options: SubscribeOptions,
    ) -> SyncResult<SyncStreamSubscription> {
        let (handle, streams) = self.inner.subscribe(name, params, options);
        if let Err(err) = self.inner.announce(streams).await {
            let id = handle.id();
            if let Err(rollback) = handle.unsubscribe().await {
                warn!(id, error = %rollback, "could not roll back subscription");
            }
            return Err(err);
        }
        Ok(handle)
    }

    /// Streams currently subscribed, as sent with `start`.
    pub fn active_subscriptions(&self) -> Vec<RequestedStream> {
        self.inner.subscriptions.lock().active_streams()
    }

    /// Ids of subscription handles that were not released yet.
    pub fn outstanding_subscription_handles(&self) -> Vec<u64> {
        self.inner
            .subscriptions
            .lock()
            .entries
            .values()
            .flat_map(|entry| entry.handles.iter().copied())
            .collect()
    }

    /// Current status.
    pub fn status(&self) -> SyncStatus {
        self.inner.status.current()
    }

    /// Every status change from now on.
    pub fn status_stream(&self) -> EventStream<SyncStatus> {
        self.inner.status.subscribe()
    }

    /// A receiver that always sees the latest status.
    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.watch()
    }

    /// Waits until a complete sync finished, or one up to `priority`.
    pub async fn wait_for_first_sync(&self, priority: Option<i32>) -> SyncResult<()> {
        self.inner
            .status
            .wait_for(|s| match priority {
                Some(priority) => s.status_for_priority(priority).has_synced == Some(true),
                None => s.has_synced == Some(true),
            })
            .await
            .map(|_| ())
    }

    /// The bucket storage orchestrator.
    pub fn storage(&self) -> &Arc<BucketStorage> {
        &self.inner.storage
    }

    /// The current state machine, if connected or connecting.
    pub fn sync_implementation(&self) -> Option<Arc<StreamingSyncImplementation>> {
        self.inner.state.lock().sync.clone()
    }

    /// Runs the upload loop now if connected.
    pub fn trigger_crud_upload(&self) {
        if let Some(sync) = self.sync_implementation() {
            sync.trigger_crud_upload();
        }
    }
}
