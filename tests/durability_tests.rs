//! Durability Tests
//!
//! Queue and cache state must survive a process restart, newer on-disk
//! formats must be refused, and local storage failures must reach the
//! caller instead of being swallowed.

mod common;

use std::sync::Arc;

use caresync::{
    DrainOutcome, IdentityHandle, InMemoryRemote, KeyValueStore, ManualConnectivity, MemoryStore,
    OperationType, RemoteError, SqliteStore, SyncEngine, SyncError,
};
use common::{create_engine_with, payload, record, test_config, FailingStore};
use serde_json::json;
use tempfile::TempDir;

// ============================================================================
// Restart
// ============================================================================

#[tokio::test]
async fn test_queue_survives_restart_in_order() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("caresync.db");
    let remote = Arc::new(InMemoryRemote::new());

    {
        let storage = Arc::new(SqliteStore::open(&path).unwrap());
        let t = create_engine_with(storage, remote.clone(), test_config(), true).await;

        t.engine
            .enqueue(OperationType::Create, "habits", "h1", "u1", payload(json!({"name": "Walk"})))
            .await
            .unwrap();
        t.engine
            .enqueue(OperationType::Create, "habits", "h2", "u1", payload(json!({"name": "Read"})))
            .await
            .unwrap();

        // h1 fails and stays queued, h2 goes through
        remote.fail_next(RemoteError::Network("connection reset".to_string()));
        let outcome = t.engine.process_queue().await;
        assert_eq!(outcome.report().unwrap().succeeded, 1);

        t.go_offline().await;
        t.engine
            .enqueue(OperationType::Update, "habits", "h2", "u1", payload(json!({"name": "Read more"})))
            .await
            .unwrap();
    }

    // Simulated restart: fresh engine over the same file
    let storage = Arc::new(SqliteStore::open(&path).unwrap());
    let t = create_engine_with(storage, remote, test_config(), false).await;

    let pending = t.engine.list_pending();
    let docs: Vec<_> = pending
        .iter()
        .map(|i| (i.operation, i.document_id.as_str()))
        .collect();
    assert_eq!(
        docs,
        vec![(OperationType::Create, "h1"), (OperationType::Update, "h2")]
    );
    assert_eq!(pending[0].retry_count, 1);
    assert!(pending[0].last_error.as_deref().unwrap().contains("connection reset"));
}

#[tokio::test]
async fn test_cache_survives_restart() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("caresync.db");

    {
        let storage = Arc::new(SqliteStore::open(&path).unwrap());
        let t = create_engine_with(storage, Arc::new(InMemoryRemote::new()), test_config(), false)
            .await;
        t.engine
            .save_to_cache(
                "appointments",
                "u1",
                vec![record(json!({"id": "A1", "title": "Dentist"}))],
            )
            .await
            .unwrap();
    }

    let storage = Arc::new(SqliteStore::open(&path).unwrap());
    let t = create_engine_with(storage, Arc::new(InMemoryRemote::new()), test_config(), false).await;

    let entry = t
        .engine
        .get_from_cache("appointments", "u1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.get("A1").unwrap()["title"], "Dentist");
    assert!(entry.fetched_at.is_some());
}

// ============================================================================
// Format versioning
// ============================================================================

#[tokio::test]
async fn test_newer_queue_format_is_refused() {
    let storage = Arc::new(MemoryStore::new());
    storage
        .set(
            "caresync.queue",
            "items",
            r#"{"version": 99, "data": {"next_sequence": 0, "items": []}}"#,
        )
        .await
        .unwrap();

    let result = SyncEngine::builder()
        .config(test_config())
        .storage(storage)
        .remote(Arc::new(InMemoryRemote::new()))
        .identity(Arc::new(IdentityHandle::signed_in("u1")))
        .connectivity(Arc::new(ManualConnectivity::new(true)))
        .build()
        .await;

    assert!(matches!(
        result,
        Err(SyncError::UnsupportedFormat { found: 99, supported: 1 })
    ));
}

#[tokio::test]
async fn test_builder_requires_collaborators() {
    let result = SyncEngine::builder()
        .storage(Arc::new(MemoryStore::new()))
        .build()
        .await;
    assert!(matches!(result, Err(SyncError::Config(_))));
}

// ============================================================================
// Local storage failures
// ============================================================================

#[tokio::test]
async fn test_enqueue_surfaces_write_failure() {
    let storage = Arc::new(FailingStore::new());
    let t = create_engine_with(storage.clone(), Arc::new(InMemoryRemote::new()), test_config(), false)
        .await;

    storage.fail_writes(true);
    let err = t
        .engine
        .enqueue(OperationType::Create, "habits", "h1", "u1", payload(json!({})))
        .await
        .unwrap_err();
    assert!(err.is_storage());
    // Nothing half-written became visible
    assert_eq!(t.engine.get_pending_count(), 0);

    storage.fail_writes(false);
    t.engine
        .enqueue(OperationType::Create, "habits", "h1", "u1", payload(json!({})))
        .await
        .unwrap();
    assert_eq!(t.engine.get_pending_count(), 1);
}

#[tokio::test]
async fn test_cache_read_surfaces_read_failure() {
    let storage = Arc::new(FailingStore::new());
    let t = create_engine_with(storage.clone(), Arc::new(InMemoryRemote::new()), test_config(), false)
        .await;

    storage.fail_reads(true);
    let err = t
        .engine
        .get_from_cache("appointments", "u1")
        .await
        .unwrap_err();
    assert!(err.is_storage());
}

#[tokio::test]
async fn test_drain_stops_on_local_write_failure() {
    let storage = Arc::new(FailingStore::new());
    let t = create_engine_with(storage.clone(), Arc::new(InMemoryRemote::new()), test_config(), true)
        .await;
    for doc in ["h1", "h2"] {
        t.engine
            .enqueue(OperationType::Create, "habits", doc, "u1", payload(json!({})))
            .await
            .unwrap();
    }

    storage.fail_writes(true);
    let outcome = t.engine.process_queue().await;
    match outcome {
        DrainOutcome::Interrupted(report) => {
            assert_eq!(report.errors.len(), 1);
            assert_eq!(report.remaining, 1);
        }
        other => panic!("expected an interrupted drain, got {:?}", other),
    }

    // The unconfirmed item is still queued
    assert_eq!(t.engine.get_pending_count(), 2);
}
