//! Sync processor
//!
//! Drains the durable queue into the remote store. One pass at a time: a
//! trigger that arrives while a pass is running is coalesced into it.
//!
//! A pass works on the queue as it was when the pass started. Items are
//! pushed in enqueue order; once an item for a (collection, document) fails,
//! later items for that document wait for the next pass while independent
//! items carry on. Each remote call is bounded by the item timeout, and a
//! timeout counts as a transient failure. Ownership is checked against the
//! identity current when each item is reached, not when the pass started.
//!
//! Local edits that pair a queue write with a cache edit run under
//! [`SyncProcessor::lock_local`]; completions and snapshot stores take the
//! same lock so they never land between the two halves.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::cache::{self, CacheStore};
use crate::config::EngineConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{SyncError, SyncResult};
use crate::identity::IdentityResolver;
use crate::queue::{OperationType, QueueItem, QueueStore};
use crate::remote::{RemoteError, RemoteResult, RemoteStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorState {
    Idle,
    Draining,
    /// The last pass was cut short or left transient failures behind
    Backoff,
}

/// Tally of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Items the remote accepted
    pub succeeded: usize,
    /// Transient failures, left queued for a later pass
    pub failed: usize,
    /// Items moved to the permanently failed state during this pass
    pub permanently_failed: usize,
    /// Items belonging to another identity
    pub skipped: usize,
    /// Items held back behind an earlier failure for the same document
    pub blocked: usize,
    /// Items not reached because the pass was cut short
    pub remaining: usize,
    /// Collections refreshed from the remote afterwards
    pub refreshed: usize,
    pub errors: Vec<String>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.errors.is_empty() && self.remaining == 0
    }
}

/// What a drain trigger resulted in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another pass was already running
    Coalesced,
    /// Not attempted, the device is offline
    Offline,
    Completed(DrainReport),
    /// Connectivity dropped or local storage failed mid-pass
    Interrupted(DrainReport),
}

impl DrainOutcome {
    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            DrainOutcome::Completed(report) | DrainOutcome::Interrupted(report) => Some(report),
            _ => None,
        }
    }
}

pub struct SyncProcessor {
    queue: Arc<QueueStore>,
    cache: Arc<CacheStore>,
    remote: Arc<dyn RemoteStore>,
    identity: Arc<dyn IdentityResolver>,
    connectivity: Arc<ConnectivityMonitor>,
    config: EngineConfig,
    drain_lock: Mutex<()>,
    local_lock: Mutex<()>,
    state: RwLock<ProcessorState>,
    last_sync: RwLock<Option<DateTime<Utc>>>,
}

enum Stop {
    Offline,
    Storage(SyncError),
}

impl SyncProcessor {
    pub fn new(
        queue: Arc<QueueStore>,
        cache: Arc<CacheStore>,
        remote: Arc<dyn RemoteStore>,
        identity: Arc<dyn IdentityResolver>,
        connectivity: Arc<ConnectivityMonitor>,
        config: EngineConfig,
    ) -> Self {
        Self {
            queue,
            cache,
            remote,
            identity,
            connectivity,
            config,
            drain_lock: Mutex::new(()),
            local_lock: Mutex::new(()),
            state: RwLock::new(ProcessorState::Idle),
            last_sync: RwLock::new(None),
        }
    }

    pub fn state(&self) -> ProcessorState {
        *self.state.read()
    }

    pub fn is_processing(&self) -> bool {
        self.state() == ProcessorState::Draining
    }

    /// End of the last pass that ran to completion
    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.read()
    }

    /// Serializes local queue+cache edits against completions and snapshot
    /// stores
    pub async fn lock_local(&self) -> MutexGuard<'_, ()> {
        self.local_lock.lock().await
    }

    fn set_state(&self, state: ProcessorState) {
        let mut current = self.state.write();
        if *current != state {
            debug!("sync processor {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    /// Run one drain pass. Returns `Coalesced` at once when a pass is
    /// already running.
    pub async fn drain(&self) -> DrainOutcome {
        let _pass = match self.drain_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("drain already in progress, coalescing");
                return DrainOutcome::Coalesced;
            }
        };

        if !self.connectivity.is_online() {
            debug!("offline, drain skipped");
            return DrainOutcome::Offline;
        }

        self.set_state(ProcessorState::Draining);
        let snapshot = self.queue.list_pending();
        if !snapshot.is_empty() {
            info!("Draining {} queued operations", snapshot.len());
        }

        let mut report = DrainReport::default();
        let mut touched = BTreeSet::new();
        let stopped = self
            .push_items(&snapshot, &mut report, &mut touched)
            .await;

        match stopped {
            Some(stop) => {
                if let Stop::Storage(e) = stop {
                    error!("Local storage failed during drain: {}", e);
                    report.errors.push(e.to_string());
                }
                warn!(
                    "Drain interrupted with {} operations not attempted",
                    report.remaining
                );
                self.set_state(ProcessorState::Backoff);
                DrainOutcome::Interrupted(report)
            }
            None => {
                if self.config.refresh_after_sync {
                    for (identity, collection) in &touched {
                        if !self.identity.is_current(identity) {
                            debug!(
                                "Skipping {} refresh, {} no longer current",
                                collection, identity
                            );
                            continue;
                        }
                        match self.refresh(collection, identity).await {
                            Ok(Some(_)) => report.refreshed += 1,
                            Ok(None) => {}
                            Err(e) if e.is_storage() => {
                                error!("Failed to store refreshed {}: {}", collection, e);
                                report.errors.push(e.to_string());
                            }
                            Err(e) => warn!("Failed to refresh {}: {}", collection, e),
                        }
                    }
                }

                *self.last_sync.write() = Some(Utc::now());
                let next = if report.failed > 0 || !report.errors.is_empty() {
                    ProcessorState::Backoff
                } else {
                    ProcessorState::Idle
                };
                self.set_state(next);

                if report.succeeded > 0 || report.failed > 0 || report.permanently_failed > 0 {
                    info!(
                        "Drain complete: {} synced, {} failed, {} permanently failed, {} blocked",
                        report.succeeded, report.failed, report.permanently_failed, report.blocked
                    );
                }
                DrainOutcome::Completed(report)
            }
        }
    }

    async fn push_items(
        &self,
        snapshot: &[QueueItem],
        report: &mut DrainReport,
        touched: &mut BTreeSet<(String, String)>,
    ) -> Option<Stop> {
        let mut blocked: HashSet<(String, String)> = HashSet::new();

        for (index, queued) in snapshot.iter().enumerate() {
            // Re-read: an earlier create in this pass may have rewritten its id
            let Some(item) = self.queue.get(&queued.id) else {
                continue;
            };

            let is_current = self.identity.is_current(&item.owner_identity);
            if !is_current && !self.config.flush_other_identities {
                report.skipped += 1;
                continue;
            }

            let key = (item.collection.clone(), item.document_id.clone());
            if item.is_permanently_failed() {
                blocked.insert(key);
                report.blocked += 1;
                continue;
            }
            if blocked.contains(&key) {
                report.blocked += 1;
                continue;
            }

            if !self.connectivity.is_online() {
                report.remaining = snapshot.len() - index;
                return Some(Stop::Offline);
            }

            match self.push(&item).await {
                Ok(remote_id) => {
                    if let Err(e) = self.complete(&item, remote_id).await {
                        report.remaining = snapshot.len() - index - 1;
                        return Some(Stop::Storage(e));
                    }
                    report.succeeded += 1;
                    if is_current {
                        touched.insert((item.owner_identity.clone(), item.collection.clone()));
                    }
                }
                Err(err) => {
                    blocked.insert(key);
                    if let Err(e) = self.record_failure(&item, &err, report).await {
                        report.remaining = snapshot.len() - index - 1;
                        return Some(Stop::Storage(e));
                    }
                    if err.is_connectivity() && !self.connectivity.is_online() {
                        report.remaining = snapshot.len() - index - 1;
                        return Some(Stop::Offline);
                    }
                }
            }
        }
        None
    }

    /// Send one item to the remote, bounded by the item timeout. Returns the
    /// remote id for creates.
    async fn push(&self, item: &QueueItem) -> RemoteResult<Option<String>> {
        let call = async {
            match item.operation {
                OperationType::Create => self
                    .remote
                    .create_record(
                        &item.collection,
                        &item.owner_identity,
                        &item.document_id,
                        &item.payload,
                    )
                    .await
                    .map(Some),
                OperationType::Update => self
                    .remote
                    .update_record(
                        &item.collection,
                        &item.owner_identity,
                        &item.document_id,
                        &item.payload,
                    )
                    .await
                    .map(|_| None),
                OperationType::Delete => self
                    .remote
                    .delete_record(&item.collection, &item.owner_identity, &item.document_id)
                    .await
                    .map(|_| None),
            }
        };

        match tokio::time::timeout(self.config.item_timeout(), call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout),
        }
    }

    async fn complete(&self, item: &QueueItem, remote_id: Option<String>) -> SyncResult<()> {
        let _local = self.lock_local().await;
        if self.queue.get(&item.id).is_none() {
            debug!("{} was cleared while in flight", item.id);
            return Ok(());
        }
        let Some(remote_id) = remote_id else {
            return self.queue.mark_succeeded(&item.id).await;
        };

        self.queue.complete_create(&item.id, &remote_id).await?;
        if remote_id == item.document_id {
            return Ok(());
        }

        debug!(
            "{} {} is now {}",
            item.collection, item.document_id, remote_id
        );
        if self
            .cache
            .get(&item.collection, &item.owner_identity)
            .await?
            .is_some()
        {
            self.cache
                .update(&item.collection, &item.owner_identity, |entry| {
                    cache::rekey(entry, &item.document_id, &remote_id)
                })
                .await?;
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        item: &QueueItem,
        err: &RemoteError,
        report: &mut DrainReport,
    ) -> SyncResult<()> {
        let reason = err.to_string();
        if err.is_permanent() {
            self.queue.mark_permanently_failed(&item.id, &reason).await?;
            report.permanently_failed += 1;
            return Ok(());
        }

        let outcome = self
            .queue
            .mark_failed(&item.id, &reason, self.config.max_retries)
            .await?;
        if outcome.status == crate::queue::ItemStatus::PermanentlyFailed {
            report.permanently_failed += 1;
        } else {
            debug!(
                "{} {}/{} failed (attempt {}): {}",
                item.operation, item.collection, item.document_id, outcome.retry_count, reason
            );
            report.failed += 1;
        }
        Ok(())
    }

    /// Fetch a collection and store it through the merge path. Returns the
    /// number of records cached, `None` when the snapshot was dropped.
    pub async fn refresh(&self, collection: &str, identity: &str) -> SyncResult<Option<usize>> {
        let fetched = tokio::time::timeout(
            self.config.item_timeout(),
            self.remote.fetch_all(collection, identity),
        )
        .await
        .map_err(|_| RemoteError::Timeout)??;

        self.store_snapshot(collection, identity, fetched).await
    }

    /// Replace the cached snapshot, keeping every still-queued local write on
    /// top. `None` when `identity` is no longer current and nothing was
    /// stored.
    pub async fn store_snapshot(
        &self,
        collection: &str,
        identity: &str,
        snapshot: Vec<crate::record::Record>,
    ) -> SyncResult<Option<usize>> {
        let _local = self.lock_local().await;
        if !self.identity.is_current(identity) {
            debug!(
                "Dropping {} snapshot for {}, identity no longer current",
                collection, identity
            );
            return Ok(None);
        }

        let pending = self.queue.list_for_collection(collection, identity);
        let mut entry = cache::merge_snapshot(collection, identity, snapshot, &pending);
        entry.fetched_at = Some(Utc::now());
        let count = entry.len();
        self.cache.put(entry).await?;
        Ok(Some(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ManualConnectivity;
    use crate::identity::IdentityHandle;
    use crate::notify::ChangeNotifier;
    use crate::queue::QueueConfig;
    use crate::record::Payload;
    use crate::remote::{InMemoryRemote, RemoteCall};
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        queue: Arc<QueueStore>,
        cache: Arc<CacheStore>,
        remote: Arc<InMemoryRemote>,
        source: ManualConnectivity,
        processor: Arc<SyncProcessor>,
    }

    async fn harness(config: EngineConfig) -> Harness {
        let storage = Arc::new(MemoryStore::new());
        let notifier = ChangeNotifier::default();
        let queue = Arc::new(
            QueueStore::open(storage.clone(), notifier.clone(), QueueConfig::default())
                .await
                .unwrap(),
        );
        let cache = Arc::new(CacheStore::new(storage, notifier));
        let remote = Arc::new(InMemoryRemote::with_server_ids());
        let source = ManualConnectivity::new(true);
        let monitor = Arc::new(ConnectivityMonitor::new(&source, Duration::ZERO));
        let identity = Arc::new(IdentityHandle::signed_in("u1"));

        let processor = Arc::new(SyncProcessor::new(
            queue.clone(),
            cache.clone(),
            remote.clone(),
            identity,
            monitor,
            config,
        ));
        Harness {
            queue,
            cache,
            remote,
            source,
            processor,
        }
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_drain_rewrites_temporary_ids() {
        let h = harness(EngineConfig::default()).await;
        h.queue
            .enqueue(
                OperationType::Create,
                "appointments",
                "tmp-1",
                "u1",
                payload(json!({"title": "Dentist"})),
            )
            .await
            .unwrap();
        h.queue
            .enqueue(
                OperationType::Update,
                "appointments",
                "tmp-1",
                "u1",
                payload(json!({"title": "Dentist 3pm"})),
            )
            .await
            .unwrap();

        let outcome = h.processor.drain().await;
        let report = outcome.report().unwrap();
        assert_eq!(report.succeeded, 2);
        assert!(h.queue.is_empty());

        assert_eq!(
            h.remote.calls()[1],
            RemoteCall::Update {
                collection: "appointments".to_string(),
                id: "R1".to_string()
            }
        );
        assert_eq!(
            h.remote.get("appointments", "u1", "R1").unwrap()["title"],
            "Dentist 3pm"
        );
        assert_eq!(h.processor.state(), ProcessorState::Idle);
        assert!(h.processor.last_sync_time().is_some());
    }

    #[tokio::test]
    async fn test_failure_blocks_same_document_only() {
        let h = harness(EngineConfig::default()).await;
        h.remote.fail_next(RemoteError::Network("reset".into()));

        for (doc, op) in [
            ("h1", OperationType::Create),
            ("h1", OperationType::Update),
            ("h2", OperationType::Create),
        ] {
            h.queue
                .enqueue(op, "habits", doc, "u1", Payload::new())
                .await
                .unwrap();
        }

        let outcome = h.processor.drain().await;
        let report = outcome.report().unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.blocked, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(h.queue.len(), 2);
        assert_eq!(h.processor.state(), ProcessorState::Backoff);

        let failed = &h.queue.list_pending()[0];
        assert_eq!(failed.retry_count, 1);
        assert!(failed.last_error.as_deref().unwrap().contains("reset"));
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let h = harness(EngineConfig::default()).await;
        h.remote.deny_collection("care_links");
        h.queue
            .enqueue(OperationType::Create, "care_links", "c1", "u1", Payload::new())
            .await
            .unwrap();

        let first = h.processor.drain().await;
        assert_eq!(first.report().unwrap().permanently_failed, 1);
        assert!(h.queue.list_pending()[0].is_permanently_failed());

        let attempts = h.remote.attempts();
        let second = h.processor.drain().await;
        assert_eq!(second.report().unwrap().blocked, 1);
        assert_eq!(h.remote.attempts(), attempts);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let config = EngineConfig {
            item_timeout_ms: 20,
            ..EngineConfig::default()
        };
        let h = harness(config).await;
        h.remote.set_latency(Some(Duration::from_millis(200)));
        h.queue
            .enqueue(OperationType::Create, "habits", "h1", "u1", Payload::new())
            .await
            .unwrap();

        let outcome = h.processor.drain().await;
        assert_eq!(outcome.report().unwrap().failed, 1);

        let item = &h.queue.list_pending()[0];
        assert_eq!(item.retry_count, 1);
        assert_eq!(
            item.last_error.as_deref(),
            Some(RemoteError::Timeout.to_string().as_str())
        );
    }

    #[tokio::test]
    async fn test_offline_drain_is_skipped() {
        let h = harness(EngineConfig::default()).await;
        h.source.set_online(false);
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.queue
            .enqueue(OperationType::Create, "habits", "h1", "u1", Payload::new())
            .await
            .unwrap();
        assert_eq!(h.processor.drain().await, DrainOutcome::Offline);
        assert_eq!(h.remote.attempts(), 0);
    }

    #[tokio::test]
    async fn test_other_identities_are_skipped_by_default() {
        let h = harness(EngineConfig::default()).await;
        h.queue
            .enqueue(OperationType::Create, "habits", "h1", "u0", Payload::new())
            .await
            .unwrap();

        let outcome = h.processor.drain().await;
        assert_eq!(outcome.report().unwrap().skipped, 1);
        assert_eq!(h.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_after_drain_populates_cache() {
        let h = harness(EngineConfig::default()).await;
        h.queue
            .enqueue(
                OperationType::Create,
                "habits",
                "tmp-1",
                "u1",
                payload(json!({"name": "Walk"})),
            )
            .await
            .unwrap();

        let outcome = h.processor.drain().await;
        assert_eq!(outcome.report().unwrap().refreshed, 1);

        let entry = h.cache.get("habits", "u1").await.unwrap().unwrap();
        assert!(entry.fetched_at.is_some());
        assert_eq!(entry.get("R1").unwrap()["name"], "Walk");
        assert!(!entry.contains("tmp-1"));
    }
}
