//! Common test utilities for sync engine tests
//!
//! Provides shared helpers for:
//! - Building engines over in-memory or SQLite storage
//! - Scripting connectivity and identity
//! - A storage backend that can be made to fail

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use caresync::{
    EngineConfig, IdentityHandle, InMemoryRemote, KeyValueStore, ManualConnectivity, MemoryStore,
    Payload, Record, SyncEngine, SyncError, SyncResult,
};
use serde_json::Value;

pub struct TestEngine {
    pub engine: SyncEngine,
    pub remote: Arc<InMemoryRemote>,
    pub network: Arc<ManualConnectivity>,
    pub identity: Arc<IdentityHandle>,
}

/// Fast timings, no automatic draining
pub fn test_config() -> EngineConfig {
    EngineConfig {
        item_timeout_ms: 1_000,
        connectivity_debounce_ms: 0,
        backoff_initial_ms: 20,
        backoff_max_ms: 200,
        auto_sync: false,
        ..EngineConfig::default()
    }
}

pub async fn create_test_engine() -> TestEngine {
    create_engine_with(
        Arc::new(MemoryStore::new()),
        Arc::new(InMemoryRemote::with_server_ids()),
        test_config(),
        true,
    )
    .await
}

pub async fn create_engine_with(
    storage: Arc<dyn KeyValueStore>,
    remote: Arc<InMemoryRemote>,
    config: EngineConfig,
    online: bool,
) -> TestEngine {
    let network = Arc::new(ManualConnectivity::new(online));
    let identity = Arc::new(IdentityHandle::signed_in("u1"));

    let engine = SyncEngine::builder()
        .config(config)
        .storage(storage)
        .remote(remote.clone())
        .identity(identity.clone())
        .connectivity(network.clone())
        .build()
        .await
        .expect("Failed to build engine");

    TestEngine {
        engine,
        remote,
        network,
        identity,
    }
}

impl TestEngine {
    pub async fn go_offline(&self) {
        self.network.set_online(false);
        wait_until(|| !self.engine.is_online()).await;
    }

    pub async fn go_online(&self) {
        self.network.set_online(true);
        wait_until(|| self.engine.is_online()).await;
    }
}

/// Poll `condition` for up to two seconds
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within 2s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn payload(value: Value) -> Payload {
    value.as_object().cloned().expect("payload must be an object")
}

pub fn record(value: Value) -> Record {
    payload(value)
}

/// Memory store whose reads or writes can be switched to fail
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self, flag: &AtomicBool) -> SyncResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("disk I/O error".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FailingStore {
    async fn get(&self, namespace: &str, key: &str) -> SyncResult<Option<String>> {
        self.check(&self.fail_reads)?;
        self.inner.get(namespace, key).await
    }

    async fn set(&self, namespace: &str, key: &str, value: &str) -> SyncResult<()> {
        self.check(&self.fail_writes)?;
        self.inner.set(namespace, key, value).await
    }

    async fn delete(&self, namespace: &str, key: &str) -> SyncResult<()> {
        self.check(&self.fail_writes)?;
        self.inner.delete(namespace, key).await
    }
}
