//! Sync engine
//!
//! The object the application talks to. It is built from explicit
//! collaborators (local storage, remote store, connectivity source and
//! identity resolver) and is cheap to clone; every clone drives the same
//! queue, cache and processor.
//!
//! Foreground calls (writes, cache reads) return errors to the caller.
//! Draining never does: its problems end up on the queued items and in the
//! returned [`DrainOutcome`].

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{self, CacheEntry, CacheStore};
use crate::config::EngineConfig;
use crate::connectivity::{ConnectivityMonitor, ConnectivitySource};
use crate::error::{SyncError, SyncResult};
use crate::identity::IdentityResolver;
use crate::notify::{ChangeNotifier, Subscription};
use crate::queue::{OperationType, QueueItem, QueueStore};
use crate::record::{self, Payload, Record};
use crate::remote::RemoteStore;
use crate::storage::KeyValueStore;
use crate::sync::{
    create_command_channel, DrainOutcome, SyncCommand, SyncHandle, SyncProcessor, SyncStats,
    SyncWorker,
};

struct EngineInner {
    config: EngineConfig,
    notifier: ChangeNotifier,
    queue: Arc<QueueStore>,
    cache: Arc<CacheStore>,
    remote: Arc<dyn RemoteStore>,
    identity: Arc<dyn IdentityResolver>,
    connectivity: Arc<ConnectivityMonitor>,
    processor: Arc<SyncProcessor>,
    worker: Mutex<Option<mpsc::Sender<SyncCommand>>>,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

/// Collects the engine's collaborators
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    storage: Option<Arc<dyn KeyValueStore>>,
    remote: Option<Arc<dyn RemoteStore>>,
    identity: Option<Arc<dyn IdentityResolver>>,
    connectivity: Option<Arc<dyn ConnectivitySource>>,
    notifier: Option<ChangeNotifier>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn KeyValueStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn identity(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn connectivity(mut self, connectivity: Arc<dyn ConnectivitySource>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    pub fn notifier(mut self, notifier: ChangeNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Load the persisted queue and wire everything up. Must run inside a
    /// Tokio runtime.
    pub async fn build(self) -> SyncResult<SyncEngine> {
        let storage = self
            .storage
            .ok_or_else(|| SyncError::Config("local storage is required".to_string()))?;
        let remote = self
            .remote
            .ok_or_else(|| SyncError::Config("remote store is required".to_string()))?;
        let identity = self
            .identity
            .ok_or_else(|| SyncError::Config("identity resolver is required".to_string()))?;
        let source = self
            .connectivity
            .ok_or_else(|| SyncError::Config("connectivity source is required".to_string()))?;
        let notifier = self.notifier.unwrap_or_default();
        let config = self.config;

        let queue = Arc::new(
            QueueStore::open(storage.clone(), notifier.clone(), config.queue.clone()).await?,
        );
        let cache = Arc::new(CacheStore::new(storage, notifier.clone()));
        let connectivity = Arc::new(ConnectivityMonitor::new(
            source.as_ref(),
            config.connectivity_debounce(),
        ));
        let processor = Arc::new(SyncProcessor::new(
            queue.clone(),
            cache.clone(),
            remote.clone(),
            identity.clone(),
            connectivity.clone(),
            config.clone(),
        ));

        Ok(SyncEngine {
            inner: Arc::new(EngineInner {
                config,
                notifier,
                queue,
                cache,
                remote,
                identity,
                connectivity,
                processor,
                worker: Mutex::new(None),
            }),
        })
    }
}

impl SyncEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.inner.connectivity
    }

    pub fn identity(&self) -> &dyn IdentityResolver {
        self.inner.identity.as_ref()
    }

    pub fn is_online(&self) -> bool {
        self.inner.connectivity.is_online()
    }

    pub fn has_retryable_items(&self) -> bool {
        self.inner.queue.retryable_count() > 0
    }

    fn require_identity(&self) -> SyncResult<String> {
        self.inner.identity.current().ok_or(SyncError::NoIdentity)
    }

    /// Foreground writes only go through for the current identity
    fn require_current(&self, identity: &str) -> SyncResult<()> {
        let current = self.require_identity()?;
        if current != identity {
            return Err(SyncError::IdentityMismatch {
                expected: current,
                found: identity.to_string(),
            });
        }
        Ok(())
    }

    fn nudge(&self) {
        if !self.inner.config.auto_sync || !self.is_online() {
            return;
        }
        if let Some(sender) = self.inner.worker.lock().as_ref() {
            // A full channel already has a drain on the way
            let _ = sender.try_send(SyncCommand::Drain);
        }
    }

    // ==================== Queue ====================

    /// Durably queue an operation. Never touches the network.
    pub async fn enqueue(
        &self,
        operation: OperationType,
        collection: &str,
        document_id: &str,
        owner_identity: &str,
        payload: Payload,
    ) -> SyncResult<String> {
        let id = self
            .queue_write(operation, collection, document_id, owner_identity, payload)
            .await?;
        self.nudge();
        Ok(id)
    }

    async fn queue_write(
        &self,
        operation: OperationType,
        collection: &str,
        document_id: &str,
        owner_identity: &str,
        payload: Payload,
    ) -> SyncResult<String> {
        self.require_current(owner_identity)?;
        self.inner
            .queue
            .enqueue(operation, collection, document_id, owner_identity, payload)
            .await
    }

    /// Create a record under a temporary id: queue it and show it in the
    /// cache right away. Returns the temporary id.
    pub async fn create(&self, collection: &str, data: Payload) -> SyncResult<String> {
        let identity = self.require_identity()?;
        let id = record::temporary_id();

        {
            let _local = self.inner.processor.lock_local().await;
            self.queue_write(OperationType::Create, collection, &id, &identity, data.clone())
                .await?;
            self.add_to_cache_item(collection, &identity, record::new_record(&id, &data))
                .await?;
        }
        self.nudge();
        Ok(id)
    }

    /// Queue a partial update and apply it to the cache
    pub async fn update(&self, collection: &str, id: &str, patch: Payload) -> SyncResult<()> {
        let identity = self.require_identity()?;
        {
            let _local = self.inner.processor.lock_local().await;
            self.queue_write(OperationType::Update, collection, id, &identity, patch.clone())
                .await?;
            self.update_cache_item(collection, &identity, id, patch)
                .await?;
        }
        self.nudge();
        Ok(())
    }

    /// Queue a delete and drop the record from the cache
    pub async fn delete(&self, collection: &str, id: &str) -> SyncResult<()> {
        let identity = self.require_identity()?;
        {
            let _local = self.inner.processor.lock_local().await;
            self.queue_write(OperationType::Delete, collection, id, &identity, Payload::new())
                .await?;
            self.remove_cache_item(collection, &identity, id).await?;
        }
        self.nudge();
        Ok(())
    }

    /// Queued items of the current identity, in enqueue order
    pub fn list_pending(&self) -> Vec<QueueItem> {
        match self.inner.identity.current() {
            Some(identity) => self.inner.queue.list_for(&identity),
            None => Vec::new(),
        }
    }

    pub fn get_pending_count(&self) -> usize {
        self.list_pending().len()
    }

    pub fn get_stats(&self) -> SyncStats {
        let counts = match self.inner.identity.current() {
            Some(identity) => self
                .inner
                .queue
                .counts_for(&identity, self.inner.config.failure_threshold),
            None => Default::default(),
        };
        let processor = &self.inner.processor;
        SyncStats {
            pending: counts.pending,
            failed: counts.failed,
            is_online: self.is_online(),
            is_processing: processor.is_processing(),
            last_sync_time: processor.last_sync_time(),
            state: processor.state(),
        }
    }

    /// Queue and cache change events. Dropping the subscription unsubscribes.
    pub fn subscribe_to_queue_changes(&self) -> Subscription {
        self.inner.notifier.subscribe()
    }

    /// Drop every queued operation. Cache entries those operations had
    /// edited are dropped too and come back with the next refresh.
    pub async fn clear_queue(&self) -> SyncResult<usize> {
        let _local = self.inner.processor.lock_local().await;
        let edited: BTreeSet<(String, String)> = self
            .inner
            .queue
            .list_pending()
            .into_iter()
            .map(|item| (item.owner_identity, item.collection))
            .collect();

        for (identity, collection) in &edited {
            self.inner.cache.remove(collection, identity).await?;
        }
        if !edited.is_empty() {
            debug!("Dropped {} cache entries with queued edits", edited.len());
        }
        self.inner.queue.clear().await
    }

    /// Give the current identity's failed operations a fresh retry budget
    pub async fn retry_failed(&self) -> SyncResult<usize> {
        let identity = self.require_identity()?;
        let reset = self.inner.queue.reset_failed(Some(&identity)).await?;
        if reset > 0 {
            info!("Retrying {} failed operations", reset);
            self.nudge();
        }
        Ok(reset)
    }

    // ==================== Sync ====================

    /// Drain the queue once. Returns `Coalesced` at once when a pass is
    /// already running; it does not wait for that pass.
    pub async fn process_queue(&self) -> DrainOutcome {
        self.inner.processor.drain().await
    }

    /// Drain, then refresh every collection cached for the current identity
    pub async fn sync_now(&self) -> DrainOutcome {
        let mut report = match self.process_queue().await {
            DrainOutcome::Completed(report) => report,
            other => return other,
        };

        let Some(identity) = self.inner.identity.current() else {
            return DrainOutcome::Completed(report);
        };
        let collections = match self.inner.cache.collections_for(&identity).await {
            Ok(collections) => collections,
            Err(e) => {
                error!("Failed to list cached collections: {}", e);
                report.errors.push(e.to_string());
                return DrainOutcome::Completed(report);
            }
        };

        for collection in collections {
            match self.inner.processor.refresh(&collection, &identity).await {
                Ok(Some(_)) => report.refreshed += 1,
                Ok(None) => {}
                Err(e) if e.is_storage() => {
                    error!("Failed to store refreshed {}: {}", collection, e);
                    report.errors.push(e.to_string());
                }
                Err(e) => warn!("Failed to refresh {}: {}", collection, e),
            }
        }
        DrainOutcome::Completed(report)
    }

    /// Fetch one collection for the current identity and cache it. Returns
    /// the number of records now cached (0 if the identity switched while
    /// fetching).
    pub async fn refresh_collection(&self, collection: &str) -> SyncResult<usize> {
        let identity = self.require_identity()?;
        let stored = self.inner.processor.refresh(collection, &identity).await?;
        Ok(stored.unwrap_or(0))
    }

    /// Keep a collection's cache following the remote's live snapshots until
    /// the identity changes or the stream ends. `None` when the remote cannot
    /// push snapshots.
    pub fn follow_collection(&self, collection: &str) -> SyncResult<Option<JoinHandle<()>>> {
        let identity = self.require_identity()?;
        let Some(mut stream) = self.inner.remote.watch(collection, &identity) else {
            return Ok(None);
        };

        let engine = self.clone();
        let collection = collection.to_string();
        let mut identity_rx = self.inner.identity.subscribe();

        Ok(Some(tokio::spawn(async move {
            debug!("Following {} for {}", collection, identity);
            loop {
                tokio::select! {
                    next = stream.next() => match next {
                        Some(Ok(records)) => {
                            if let Err(e) = engine
                                .inner
                                .processor
                                .store_snapshot(&collection, &identity, records)
                                .await
                            {
                                error!("Failed to store {} snapshot: {}", collection, e);
                            }
                        }
                        Some(Err(e)) => warn!("Live {} snapshot failed: {}", collection, e),
                        None => break,
                    },
                    changed = identity_rx.changed() => {
                        if changed.is_err() || !engine.inner.identity.is_current(&identity) {
                            break;
                        }
                    }
                }
            }
            debug!("Stopped following {}", collection);
        })))
    }

    // ==================== Cache ====================

    /// Cached records for `(collection, identity)` with every still-queued
    /// local write applied. `None` for a non-current identity, or when
    /// nothing is cached or queued.
    pub async fn get_from_cache(
        &self,
        collection: &str,
        identity: &str,
    ) -> SyncResult<Option<CacheEntry>> {
        if !self.inner.identity.is_current(identity) {
            return Ok(None);
        }

        let pending = self.inner.queue.list_for_collection(collection, identity);
        match self.inner.cache.get(collection, identity).await? {
            Some(mut entry) => {
                cache::overlay_pending(&mut entry, &pending);
                Ok(Some(entry))
            }
            None if pending.is_empty() => Ok(None),
            None => Ok(Some(cache::merge_snapshot(
                collection,
                identity,
                Vec::new(),
                &pending,
            ))),
        }
    }

    /// Replace the remote snapshot for `(collection, identity)`. Queued local
    /// writes are re-applied on top. Snapshots for a non-current identity are
    /// dropped.
    pub async fn save_to_cache(
        &self,
        collection: &str,
        identity: &str,
        records: Vec<Record>,
    ) -> SyncResult<()> {
        self.inner
            .processor
            .store_snapshot(collection, identity, records)
            .await?;
        Ok(())
    }

    /// Optimistically insert (or replace) one record
    pub async fn add_to_cache_item(
        &self,
        collection: &str,
        identity: &str,
        item: Record,
    ) -> SyncResult<()> {
        self.require_current(identity)?;
        let id = record::record_id(&item)
            .ok_or_else(|| SyncError::InvalidRecord("record has no id".to_string()))?
            .to_string();

        self.inner
            .cache
            .update(collection, identity, |entry| {
                entry.tombstones.remove(&id);
                match entry.get_mut(&id) {
                    Some(existing) => *existing = item,
                    None => entry.records.push(item),
                }
            })
            .await
    }

    /// Optimistically merge `patch` into one record. Returns false when the
    /// record was deleted locally and the patch was dropped.
    pub async fn update_cache_item(
        &self,
        collection: &str,
        identity: &str,
        id: &str,
        patch: Payload,
    ) -> SyncResult<bool> {
        self.require_current(identity)?;
        self.inner
            .cache
            .update(collection, identity, |entry| {
                if let Some(existing) = entry.get_mut(id) {
                    record::shallow_merge(existing, &patch);
                    true
                } else if entry.is_tombstoned(id) {
                    false
                } else {
                    entry.records.push(record::new_record(id, &patch));
                    true
                }
            })
            .await
    }

    /// Optimistically remove one record
    pub async fn remove_cache_item(
        &self,
        collection: &str,
        identity: &str,
        id: &str,
    ) -> SyncResult<()> {
        self.require_current(identity)?;
        self.inner
            .cache
            .update(collection, identity, |entry| {
                entry.records.retain(|r| record::record_id(r) != Some(id));
                entry.tombstones.insert(id.to_string());
            })
            .await
    }

    // ==================== Lifecycle ====================

    /// React to an identity switch: the previous identity's cache is
    /// dropped. Its queued items stay and are flushed once it is current
    /// again (or right away with `flush_other_identities`). Returns how many
    /// cache entries were dropped.
    ///
    /// The worker from [`SyncEngine::start`] calls this on every switch. An
    /// engine driven without a worker must call it itself; reads are scoped
    /// to the current identity either way.
    pub async fn handle_identity_change(&self, previous: Option<&str>) -> SyncResult<usize> {
        let current = self.inner.identity.current();
        match previous {
            Some(previous) if current.as_deref() != Some(previous) => {
                info!(
                    "Identity switched from {} to {}",
                    previous,
                    current.as_deref().unwrap_or("<signed out>")
                );
                self.inner.cache.invalidate_identity(previous).await
            }
            _ => Ok(0),
        }
    }

    /// Spawn the background worker. Besides draining, it invalidates the
    /// previous identity's cache on every identity switch. Calling it again
    /// replaces the command route to the newest worker; stop the old handle
    /// first.
    pub fn start(&self) -> SyncHandle {
        let (sender, receiver) = create_command_channel();
        *self.inner.worker.lock() = Some(sender.clone());
        SyncWorker::new(self.clone(), receiver).spawn(sender)
    }
}
