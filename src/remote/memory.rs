//! In-process remote store
//!
//! A scriptable stand-in for the authoritative backend: it can assign its
//! own ids, go unreachable, inject failures, add latency, and push live
//! snapshots. The CLI's `--simulate` mode and the test suite both run
//! against it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{RemoteError, RemoteResult, RemoteStore, SnapshotStream};
use crate::record::{self, Payload, Record};

/// A mutation the remote accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Create {
        collection: String,
        client_id: String,
        assigned_id: String,
    },
    Update {
        collection: String,
        id: String,
    },
    Delete {
        collection: String,
        id: String,
    },
}

#[derive(Default)]
struct RemoteState {
    records: HashMap<(String, String), Vec<Record>>,
    calls: Vec<RemoteCall>,
    attempts: usize,
    fetches: usize,
    next_id: u64,
    unreachable: bool,
    failures: VecDeque<RemoteError>,
    denied: HashSet<String>,
}

pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
    latency: Mutex<Option<Duration>>,
    assign_ids: bool,
    snapshots: broadcast::Sender<(String, String, Vec<Record>)>,
}

impl InMemoryRemote {
    /// A remote that stores records under the client's ids
    pub fn new() -> Self {
        Self::build(false)
    }

    /// A remote that assigns its own ids (`R1`, `R2`, ...) on create
    pub fn with_server_ids() -> Self {
        Self::build(true)
    }

    fn build(assign_ids: bool) -> Self {
        let (snapshots, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(RemoteState::default()),
            latency: Mutex::new(None),
            assign_ids,
            snapshots,
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unreachable = !reachable;
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Fail the next mutation with `error` (queued, one per call)
    pub fn fail_next(&self, error: RemoteError) {
        self.state.lock().failures.push_back(error);
    }

    /// Every mutation on `collection` is rejected as unauthorized
    pub fn deny_collection(&self, collection: &str) {
        self.state.lock().denied.insert(collection.to_string());
    }

    /// Replace the remote's records for a collection
    pub fn seed(&self, collection: &str, identity: &str, records: Vec<Record>) {
        self.state.lock().records.insert(
            (identity.to_string(), collection.to_string()),
            records.clone(),
        );
        self.publish(collection, identity, records);
    }

    pub fn records(&self, collection: &str, identity: &str) -> Vec<Record> {
        self.state
            .lock()
            .records
            .get(&(identity.to_string(), collection.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn get(&self, collection: &str, identity: &str, id: &str) -> Option<Record> {
        self.records(collection, identity)
            .into_iter()
            .find(|r| record::record_id(r) == Some(id))
    }

    /// Accepted mutations in the order they were applied
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    /// Mutation attempts, including failed ones
    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }

    pub fn fetch_count(&self) -> usize {
        self.state.lock().fetches
    }

    fn publish(&self, collection: &str, identity: &str, records: Vec<Record>) {
        let _ = self
            .snapshots
            .send((identity.to_string(), collection.to_string(), records));
    }

    async fn delay(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Common gatekeeping for every mutation
    fn admit(&self, collection: &str) -> RemoteResult<()> {
        let mut state = self.state.lock();
        state.attempts += 1;
        if state.unreachable {
            return Err(RemoteError::Network("remote unreachable".to_string()));
        }
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        if state.denied.contains(collection) {
            return Err(RemoteError::PermissionDenied(collection.to_string()));
        }
        Ok(())
    }

    fn apply<R>(
        &self,
        collection: &str,
        identity: &str,
        change: impl FnOnce(&mut RemoteState, (String, String)) -> RemoteResult<R>,
    ) -> RemoteResult<R> {
        let key = (identity.to_string(), collection.to_string());
        let (result, snapshot) = {
            let mut state = self.state.lock();
            let result = change(&mut *state, key.clone())?;
            let snapshot = state.records.get(&key).cloned().unwrap_or_default();
            (result, snapshot)
        };
        self.publish(collection, identity, snapshot);
        Ok(result)
    }
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn create_record(
        &self,
        collection: &str,
        identity: &str,
        client_id: &str,
        data: &Payload,
    ) -> RemoteResult<String> {
        self.delay().await;
        self.admit(collection)?;

        let assign_ids = self.assign_ids;
        self.apply(collection, identity, |state, key| {
            let id = if assign_ids {
                state.next_id += 1;
                format!("R{}", state.next_id)
            } else {
                client_id.to_string()
            };

            let records = state.records.entry(key).or_default();
            if records.iter().any(|r| record::record_id(r) == Some(id.as_str())) {
                return Err(RemoteError::Rejected(format!("{} already exists", id)));
            }
            records.push(record::new_record(&id, data));

            state.calls.push(RemoteCall::Create {
                collection: collection.to_string(),
                client_id: client_id.to_string(),
                assigned_id: id.clone(),
            });
            Ok(id)
        })
    }

    async fn update_record(
        &self,
        collection: &str,
        identity: &str,
        id: &str,
        partial: &Payload,
    ) -> RemoteResult<()> {
        self.delay().await;
        self.admit(collection)?;

        self.apply(collection, identity, |state, key| {
            let existing = state
                .records
                .get_mut(&key)
                .and_then(|records| {
                    records
                        .iter_mut()
                        .find(|r| record::record_id(r) == Some(id))
                })
                .ok_or_else(|| RemoteError::NotFound(format!("{}/{}", collection, id)))?;
            record::shallow_merge(existing, partial);

            state.calls.push(RemoteCall::Update {
                collection: collection.to_string(),
                id: id.to_string(),
            });
            Ok(())
        })
    }

    async fn delete_record(&self, collection: &str, identity: &str, id: &str) -> RemoteResult<()> {
        self.delay().await;
        self.admit(collection)?;

        // Deleting something already gone counts as done
        self.apply(collection, identity, |state, key| {
            if let Some(records) = state.records.get_mut(&key) {
                records.retain(|r| record::record_id(r) != Some(id));
            }
            state.calls.push(RemoteCall::Delete {
                collection: collection.to_string(),
                id: id.to_string(),
            });
            Ok(())
        })
    }

    async fn fetch_all(&self, collection: &str, identity: &str) -> RemoteResult<Vec<Record>> {
        self.delay().await;
        let mut state = self.state.lock();
        if state.unreachable {
            return Err(RemoteError::Network("remote unreachable".to_string()));
        }
        state.fetches += 1;
        Ok(state
            .records
            .get(&(identity.to_string(), collection.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn watch(&self, collection: &str, identity: &str) -> Option<SnapshotStream> {
        let rx = self.snapshots.subscribe();
        let initial = self.records(collection, identity);
        let key = (identity.to_string(), collection.to_string());

        let stream = futures::stream::unfold(
            (Some(initial), rx, key),
            |(initial, mut rx, key)| async move {
                if let Some(records) = initial {
                    return Some((Ok(records), (None, rx, key)));
                }
                loop {
                    match rx.recv().await {
                        Ok((who, collection, records)) => {
                            if who == key.0 && collection == key.1 {
                                return Some((Ok(records), (None, rx, key)));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        );
        Some(stream.boxed())
    }
}
