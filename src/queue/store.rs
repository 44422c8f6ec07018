//! Durable queue store
//!
//! The whole queue is one versioned blob. Mutations are serialized by a
//! writer lock, build the next state off to the side, persist it, and only
//! then swap it in and notify. Readers take a short read lock on the
//! in-memory copy and never wait on storage.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::types::{ItemStatus, OperationType, QueueConfig, QueueItem};
use crate::error::{SyncError, SyncResult};
use crate::notify::{ChangeEvent, ChangeNotifier};
use crate::record::Payload;
use crate::storage::{codec, KeyValueStore};

const NAMESPACE: &str = "caresync.queue";
const ITEMS_KEY: &str = "items";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueState {
    next_sequence: u64,
    items: Vec<QueueItem>,
}

/// Result of a failed processing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub retry_count: u32,
    pub status: ItemStatus,
}

/// Pending/failed tallies for one identity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub failed: usize,
}

pub struct QueueStore {
    storage: Arc<dyn KeyValueStore>,
    notifier: ChangeNotifier,
    config: QueueConfig,
    state: RwLock<QueueState>,
    write_lock: Mutex<()>,
}

impl QueueStore {
    /// Load the persisted queue, or start empty
    pub async fn open(
        storage: Arc<dyn KeyValueStore>,
        notifier: ChangeNotifier,
        config: QueueConfig,
    ) -> SyncResult<Self> {
        let state = match storage.get(NAMESPACE, ITEMS_KEY).await? {
            Some(blob) => codec::decode::<QueueState>(&blob)?,
            None => QueueState::default(),
        };

        if !state.items.is_empty() {
            info!("Restored {} queued operations", state.items.len());
        }

        Ok(Self {
            storage,
            notifier,
            config,
            state: RwLock::new(state),
            write_lock: Mutex::new(()),
        })
    }

    /// Apply `mutation` to a copy of the state, persist it, then publish it.
    /// Nothing becomes visible if the mutation or the write fails.
    async fn mutate<R>(
        &self,
        mutation: impl FnOnce(&mut QueueState) -> SyncResult<R>,
    ) -> SyncResult<R> {
        let _writer = self.write_lock.lock().await;

        let mut next = self.state.read().clone();
        let result = mutation(&mut next)?;

        let blob = codec::encode(&next)?;
        self.storage.set(NAMESPACE, ITEMS_KEY, &blob).await?;

        let pending = next.items.len();
        *self.state.write() = next;
        self.notifier.notify(ChangeEvent::QueueChanged { pending });

        Ok(result)
    }

    /// Append an operation. Never touches the network.
    pub async fn enqueue(
        &self,
        operation: OperationType,
        collection: &str,
        document_id: &str,
        owner_identity: &str,
        payload: Payload,
    ) -> SyncResult<String> {
        let config = self.config.clone();
        let id = uuid::Uuid::new_v4().to_string();

        let item_id = id.clone();
        self.mutate(move |state| {
            if state.items.len() >= config.max_count {
                return Err(SyncError::QueueFull(format!(
                    "count limit {} reached",
                    config.max_count
                )));
            }

            // Keep enqueue order and timestamp order identical even if the
            // wall clock steps backwards
            let now = Utc::now();
            let enqueued_at = match state.items.last() {
                Some(last) if last.enqueued_at > now => last.enqueued_at,
                _ => now,
            };

            let item = QueueItem {
                id: item_id,
                operation,
                collection: collection.to_string(),
                document_id: document_id.to_string(),
                owner_identity: owner_identity.to_string(),
                payload,
                enqueued_at,
                sequence: state.next_sequence,
                retry_count: 0,
                last_error: None,
                status: ItemStatus::Pending,
            };

            let used: usize = state.items.iter().map(QueueItem::payload_bytes).sum();
            if used + item.payload_bytes() > config.max_bytes {
                return Err(SyncError::QueueFull(format!(
                    "byte limit {} reached",
                    config.max_bytes
                )));
            }

            state.next_sequence += 1;
            state.items.push(item);
            Ok(())
        })
        .await?;

        debug!(
            "Enqueued {} {}/{} as {}",
            operation, collection, document_id, id
        );
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<QueueItem> {
        self.state.read().items.iter().find(|i| i.id == id).cloned()
    }

    /// Snapshot of every queued item in enqueue order
    pub fn list_pending(&self) -> Vec<QueueItem> {
        self.state.read().items.clone()
    }

    /// Snapshot of the items owned by `identity`, in enqueue order
    pub fn list_for(&self, identity: &str) -> Vec<QueueItem> {
        self.state
            .read()
            .items
            .iter()
            .filter(|i| i.owner_identity == identity)
            .cloned()
            .collect()
    }

    /// Items still awaiting sync for one (collection, identity) pair
    pub fn list_for_collection(&self, collection: &str, identity: &str) -> Vec<QueueItem> {
        self.state
            .read()
            .items
            .iter()
            .filter(|i| i.collection == collection && i.owner_identity == identity)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().items.is_empty()
    }

    /// Items not in the terminal failed state, across all identities
    pub fn retryable_count(&self) -> usize {
        self.state
            .read()
            .items
            .iter()
            .filter(|i| !i.is_permanently_failed())
            .count()
    }

    pub fn counts_for(&self, identity: &str, failure_threshold: u32) -> QueueCounts {
        let state = self.state.read();
        let mut counts = QueueCounts::default();
        for item in state.items.iter().filter(|i| i.owner_identity == identity) {
            counts.pending += 1;
            if item.is_failed(failure_threshold) {
                counts.failed += 1;
            }
        }
        counts
    }

    /// Remove an item after the remote confirmed it
    pub async fn mark_succeeded(&self, id: &str) -> SyncResult<()> {
        self.mutate(|state| {
            let pos = position(state, id)?;
            state.items.remove(pos);
            Ok(())
        })
        .await
    }

    /// Remove a succeeded `Create` and, in the same write, re-point every
    /// later item that still targets its temporary id at `remote_id`.
    /// Returns how many items were rewritten.
    pub async fn complete_create(&self, id: &str, remote_id: &str) -> SyncResult<usize> {
        let rewritten = self
            .mutate(|state| {
                let pos = position(state, id)?;
                let created = state.items.remove(pos);
                if created.document_id == remote_id {
                    return Ok(0);
                }

                let mut rewritten = 0;
                for item in state.items.iter_mut() {
                    if item.targets(&created.collection, &created.document_id) {
                        item.document_id = remote_id.to_string();
                        rewritten += 1;
                    }
                }
                Ok(rewritten)
            })
            .await?;

        if rewritten > 0 {
            debug!("Rewrote {} queued items to remote id {}", rewritten, remote_id);
        }
        Ok(rewritten)
    }

    /// Record a transient failure. The item stays queued; once it has
    /// failed `max_retries` times it becomes permanently failed.
    pub async fn mark_failed(
        &self,
        id: &str,
        reason: &str,
        max_retries: u32,
    ) -> SyncResult<FailureOutcome> {
        let outcome = self
            .mutate(|state| {
                let pos = position(state, id)?;
                let item = &mut state.items[pos];
                item.retry_count = item.retry_count.saturating_add(1);
                item.last_error = Some(reason.to_string());
                if item.retry_count >= max_retries {
                    item.status = ItemStatus::PermanentlyFailed;
                }
                Ok(FailureOutcome {
                    retry_count: item.retry_count,
                    status: item.status,
                })
            })
            .await?;

        if outcome.status == ItemStatus::PermanentlyFailed {
            warn!(
                "Queue item {} exhausted {} retries: {}",
                id, outcome.retry_count, reason
            );
        }
        Ok(outcome)
    }

    /// Record a failure that retrying cannot fix
    pub async fn mark_permanently_failed(&self, id: &str, reason: &str) -> SyncResult<()> {
        self.mutate(|state| {
            let pos = position(state, id)?;
            let item = &mut state.items[pos];
            item.retry_count = item.retry_count.saturating_add(1);
            item.last_error = Some(reason.to_string());
            item.status = ItemStatus::PermanentlyFailed;
            Ok(())
        })
        .await?;

        warn!("Queue item {} permanently failed: {}", id, reason);
        Ok(())
    }

    /// Put failed items (permanent or with retries recorded) back into the
    /// pending state with a fresh retry budget. `None` resets every identity.
    pub async fn reset_failed(&self, identity: Option<&str>) -> SyncResult<usize> {
        self.mutate(|state| {
            let mut reset = 0;
            for item in state.items.iter_mut() {
                if identity.is_some_and(|who| item.owner_identity != who) {
                    continue;
                }
                if item.retry_count > 0 || item.is_permanently_failed() {
                    item.retry_count = 0;
                    item.status = ItemStatus::Pending;
                    reset += 1;
                }
            }
            Ok(reset)
        })
        .await
    }

    /// Drop every queued item
    pub async fn clear(&self) -> SyncResult<usize> {
        let dropped = self
            .mutate(|state| {
                let dropped = state.items.len();
                state.items.clear();
                Ok(dropped)
            })
            .await?;

        info!("Cleared {} queued operations", dropped);
        Ok(dropped)
    }

    /// Timestamp of the oldest queued item
    pub fn oldest_enqueued_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().items.first().map(|i| i.enqueued_at)
    }
}

fn position(state: &QueueState, id: &str) -> SyncResult<usize> {
    state
        .items
        .iter()
        .position(|i| i.id == id)
        .ok_or_else(|| SyncError::ItemNotFound(id.to_string()))
}
