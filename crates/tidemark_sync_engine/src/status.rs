//! Observable sync status.
//!
//! A [`SyncStatus`] is an immutable snapshot. [`StatusHandle::update`]
//! produces a new snapshot and only notifies listeners when it differs from
//! the previous one by value.

use crate::error::{SyncError, SyncResult};
use crate::event_bus::{EventBus, EventStream};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tidemark_sync_protocol::{BucketProgress, CoreStreamStatus, CoreSyncStatus};
use tokio::sync::watch;

/// Priority of the complete (all buckets) sync.
pub const FULL_SYNC_PRIORITY: i32 = i32::MAX;

fn from_unix_seconds(seconds: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(seconds.max(0) as u64)
}

/// Sync state for one priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPriorityStatus {
    /// The priority. Lower numbers are synced first.
    pub priority: i32,
    /// When data at this priority was last synced completely.
    pub last_synced_at: Option<SystemTime>,
    /// Whether data at this priority was ever synced completely.
    pub has_synced: Option<bool>,
}

/// Download progress towards the current checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadProgress {
    buckets: BTreeMap<String, BucketProgress>,
}

impl DownloadProgress {
    /// Creates progress from per-bucket counters.
    pub fn new(buckets: BTreeMap<String, BucketProgress>) -> Self {
        Self { buckets }
    }

    /// Operations to download in total.
    pub fn total_operations(&self) -> i64 {
        self.buckets
            .values()
            .map(|b| (b.target_count - b.at_last).max(0))
            .sum()
    }

    /// Operations downloaded so far.
    pub fn downloaded_operations(&self) -> i64 {
        self.buckets.values().map(|b| b.since_last).sum()
    }

    /// Downloaded fraction in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        let total = self.total_operations();
        if total == 0 {
            return 0.0;
        }
        (self.downloaded_operations() as f64 / total as f64).clamp(0.0, 1.0)
    }

    /// Progress restricted to buckets at or above `priority`.
    pub fn until_priority(&self, priority: i32) -> DownloadProgress {
        DownloadProgress {
            buckets: self
                .buckets
                .iter()
                .filter(|(_, b)| b.priority <= priority)
                .map(|(name, b)| (name.clone(), b.clone()))
                .collect(),
        }
    }
}

/// Upload and download activity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataFlowStatus {
    /// An upload loop is running.
    pub uploading: bool,
    /// A checkpoint is being downloaded.
    pub downloading: bool,
    /// Last upload error, cleared on the next successful upload.
    pub upload_error: Option<String>,
    /// Last download error, cleared by the next status update from the stream.
    pub download_error: Option<String>,
    /// Progress of the current download.
    pub download_progress: Option<DownloadProgress>,
}

/// Snapshot of the sync state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStatus {
    /// A sync stream is open.
    pub connected: bool,
    /// A sync stream is being opened.
    pub connecting: bool,
    /// When the last complete sync finished.
    pub last_synced_at: Option<SystemTime>,
    /// Whether a complete sync ever finished. `None` until known.
    pub has_synced: Option<bool>,
    /// Upload and download activity.
    pub data_flow: DataFlowStatus,
    /// Per-priority sync state, highest priority first.
    pub priority_status_entries: Vec<SyncPriorityStatus>,
    /// Stream subscriptions known to the storage extension.
    pub streams: Vec<CoreStreamStatus>,
}

impl SyncStatus {
    /// Applies a status reported by the storage extension.
    pub fn apply_core(&mut self, core: &CoreSyncStatus) {
        self.connected = core.connected;
        self.connecting = core.connecting;
        self.data_flow.downloading = core.downloading.is_some();
        self.data_flow.download_progress = core
            .downloading
            .as_ref()
            .map(|d| DownloadProgress::new(d.buckets.clone()));
        self.apply_priorities(core);
    }

    /// Applies the persisted part of a status, leaving connection flags alone.
    pub fn apply_offline(&mut self, core: &CoreSyncStatus) {
        self.apply_priorities(core);
    }

    fn apply_priorities(&mut self, core: &CoreSyncStatus) {
        let mut entries: Vec<SyncPriorityStatus> = core
            .priority_status
            .iter()
            .map(|p| SyncPriorityStatus {
                priority: p.priority,
                last_synced_at: p.last_synced_at.map(from_unix_seconds),
                has_synced: p.has_synced,
            })
            .collect();
        entries.sort_by_key(|e| e.priority);

        let full = entries.iter().find(|e| e.priority == FULL_SYNC_PRIORITY);
        self.last_synced_at = full.and_then(|e| e.last_synced_at);
        self.has_synced = Some(
            full.map(|e| e.has_synced.unwrap_or(e.last_synced_at.is_some()))
                .unwrap_or(false),
        );
        self.priority_status_entries = entries;
        self.streams = core.streams.clone();
    }

    /// Sync state for `priority`.
    ///
    /// A completed sync at a lower priority includes every higher priority,
    /// so the first entry at or below `priority` answers the question.
    pub fn status_for_priority(&self, priority: i32) -> SyncPriorityStatus {
        self.priority_status_entries
            .iter()
            .find(|e| e.priority >= priority)
            .cloned()
            .unwrap_or(SyncPriorityStatus {
                priority,
                last_synced_at: self.last_synced_at,
                has_synced: self.has_synced,
            })
    }

    /// Download progress, if a download is running.
    pub fn download_progress(&self) -> Option<&DownloadProgress> {
        self.data_flow.download_progress.as_ref()
    }

    /// Returns the error of the last failed upload or download.
    pub fn any_error(&self) -> Option<&str> {
        self.data_flow
            .download_error
            .as_deref()
            .or(self.data_flow.upload_error.as_deref())
    }
}

/// Shared owner of the current [`SyncStatus`].
///
/// Listeners either watch the latest value or subscribe to every change
/// through an [`EventBus`].
#[derive(Clone)]
pub struct StatusHandle {
    sender: Arc<watch::Sender<SyncStatus>>,
    changes: EventBus<SyncStatus>,
}

impl StatusHandle {
    /// Creates a handle holding the default (disconnected) status.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(SyncStatus::default());
        Self {
            sender: Arc::new(sender),
            changes: EventBus::new(),
        }
    }

    /// Returns the current snapshot.
    pub fn current(&self) -> SyncStatus {
        self.sender.borrow().clone()
    }

    /// Applies `f` to a copy of the status and publishes it if it changed.
    ///
    /// Returns true if listeners were notified. Event bus subscribers see
    /// snapshots in the same order as watch receivers.
    pub fn update(&self, f: impl FnOnce(&mut SyncStatus)) -> bool {
        let changes = &self.changes;
        self.sender.send_if_modified(|status| {
            let mut next = status.clone();
            f(&mut next);
            if next == *status {
                return false;
            }
            *status = next.clone();
            changes.emit(next);
            true
        })
    }

    /// Returns a receiver that always sees the latest status.
    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.sender.subscribe()
    }

    /// Subscribes to every status change from now on.
    pub fn subscribe(&self) -> EventStream<SyncStatus> {
        self.changes.subscribe()
    }

    /// Waits until `predicate` holds for the current status.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SyncStatus) -> bool,
    ) -> SyncResult<SyncStatus> {
        let mut receiver = self.watch();
        let status = receiver
            .wait_for(predicate)
            .await
            .map_err(|_| SyncError::Cancelled)?;
        Ok(status.clone())
    }

    /// Completes every change subscription.
    pub fn close(&self) {
        self.changes.close();
    }
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_sync_protocol::{CoreDownloadProgress, CorePriorityStatus};

    fn core_status(entries: Vec<(i32, Option<i64>)>) -> CoreSyncStatus {
        CoreSyncStatus {
            connected: true,
            connecting: false,
            priority_status: entries
                .into_iter()
                .map(|(priority, last)| CorePriorityStatus {
                    priority,
                    last_synced_at: last,
                    has_synced: Some(last.is_some()),
                })
                .collect(),
            downloading: None,
            streams: Vec::new(),
        }
    }

    #[test]
    fn apply_core_sets_full_sync_fields() {
        let mut status = SyncStatus::default();
        status.apply_core(&core_status(vec![
            (FULL_SYNC_PRIORITY, Some(1_700_000_000)),
            (1, Some(1_700_000_100)),
        ]));

        assert!(status.connected);
        assert_eq!(status.has_synced, Some(true));
        assert_eq!(status.last_synced_at, Some(from_unix_seconds(1_700_000_000)));
        assert_eq!(status.priority_status_entries[0].priority, 1);
    }

    #[test]
    fn status_for_priority_falls_back_to_lower_priorities() {
        let mut status = SyncStatus::default();
        status.apply_core(&core_status(vec![(2, Some(10)), (FULL_SYNC_PRIORITY, None)]));

        assert_eq!(status.status_for_priority(1).has_synced, Some(true));
        assert_eq!(status.status_for_priority(2).has_synced, Some(true));
        assert_eq!(status.status_for_priority(3).has_synced, Some(false));
        assert_eq!(status.has_synced, Some(false));
    }

    #[test]
    fn download_progress_counts() {
        let mut buckets = BTreeMap::new();
        buckets.insert(
            "a".to_string(),
            BucketProgress {
                priority: 1,
                at_last: 0,
                since_last: 5,
                target_count: 10,
            },
        );
        buckets.insert(
            "b".to_string(),
            BucketProgress {
                priority: 3,
                at_last: 10,
                since_last: 0,
                target_count: 20,
            },
        );
        let mut status = SyncStatus::default();
        status.apply_core(&CoreSyncStatus {
            downloading: Some(CoreDownloadProgress { buckets }),
            ..CoreSyncStatus::default()
        });

        let progress = status.download_progress().unwrap();
        assert!(status.data_flow.downloading);
        assert_eq!(progress.total_operations(), 20);
        assert_eq!(progress.downloaded_operations(), 5);
        assert_eq!(progress.until_priority(1).fraction(), 0.5);
    }

    #[tokio::test]
    async fn update_notifies_only_on_change() {
        let handle = StatusHandle::new();
        let mut changes = handle.subscribe();

        assert!(handle.update(|s| s.connecting = true));
        assert!(!handle.update(|s| s.connecting = true));
        assert!(handle.update(|s| s.data_flow.download_error = Some("boom".into())));

        assert!(changes.next().await.unwrap().connecting);
        let second = changes.next().await.unwrap();
        assert_eq!(second.any_error(), Some("boom"));
        assert!(changes.try_next().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_stream_ends_on_latest_snapshot() {
        let handle = StatusHandle::new();
        let mut changes = handle.subscribe();

        let writers: Vec<_> = (0..4)
            .map(|writer| {
                let handle = handle.clone();
                tokio::spawn(async move {
                    for i in 0..200 {
                        handle.update(|s| {
                            s.data_flow.download_error = Some(format!("{writer}-{i}"))
                        });
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let mut last = None;
        while let Some(status) = changes.try_next() {
            last = Some(status);
        }
        assert_eq!(last, Some(handle.current()));
    }

    #[tokio::test]
    async fn wait_for_resolves_on_matching_update() {
        let handle = StatusHandle::new();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_for(|s| s.connected).await })
        };
        tokio::task::yield_now().await;
        handle.update(|s| s.connected = true);
        assert!(waiter.await.unwrap().unwrap().connected);
    }
}
