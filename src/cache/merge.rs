//! Cache merger
//!
//! The view handed to readers is the last remote snapshot with every
//! still-queued local operation for the same (collection, identity)
//! replayed on top, in enqueue order. Replaying is idempotent, so it is
//! safe to overlay the queue onto an entry that already reflects some of
//! those operations optimistically.

use tracing::warn;

use super::entry::CacheEntry;
use crate::queue::{OperationType, QueueItem};
use crate::record::{self, Record};

/// Apply one queued operation to an entry
pub fn apply_item(entry: &mut CacheEntry, item: &QueueItem) {
    let id = item.document_id.as_str();
    match item.operation {
        OperationType::Create => {
            entry.tombstones.remove(id);
            // insert, or ignore if the record is already there
            if !entry.contains(id) {
                entry.records.push(record::new_record(id, &item.payload));
            }
        }
        OperationType::Update => {
            if let Some(existing) = entry.get_mut(id) {
                record::shallow_merge(existing, &item.payload);
            } else if !entry.is_tombstoned(id) {
                // The remote has not produced this record yet (e.g. it still
                // lives under a temporary id): keep it as a pending-only record
                entry.records.push(record::new_record(id, &item.payload));
            }
        }
        OperationType::Delete => {
            entry.records.retain(|r| record::record_id(r) != Some(id));
            // Tombstone so a snapshot that still has it cannot bring it back
            entry.tombstones.insert(id.to_string());
        }
    }
}

/// Replay the queued operations that belong to this entry
pub fn overlay_pending(entry: &mut CacheEntry, pending: &[QueueItem]) {
    for item in pending {
        if item.collection == entry.collection && item.owner_identity == entry.owner_identity {
            apply_item(entry, item);
        }
    }
}

/// Build a fresh entry from a remote snapshot plus the still-queued
/// operations. Snapshot records without an id are dropped.
pub fn merge_snapshot(
    collection: &str,
    identity: &str,
    snapshot: Vec<Record>,
    pending: &[QueueItem],
) -> CacheEntry {
    let mut entry = CacheEntry::new(collection, identity);

    let total = snapshot.len();
    entry.records = snapshot
        .into_iter()
        .filter(|r| record::record_id(r).is_some())
        .collect();
    if entry.records.len() != total {
        warn!(
            "Dropped {} records without an id from {} snapshot",
            total - entry.records.len(),
            collection
        );
    }

    overlay_pending(&mut entry, pending);
    entry
}

/// Re-key a record from a temporary id to the one the remote assigned.
/// Returns false when no record had the old id.
pub fn rekey(entry: &mut CacheEntry, old_id: &str, new_id: &str) -> bool {
    if entry.tombstones.remove(old_id) {
        entry.tombstones.insert(new_id.to_string());
    }

    if entry.contains(new_id) {
        // The remote record already arrived; the temp copy is redundant
        entry.records.retain(|r| record::record_id(r) != Some(old_id));
        return true;
    }

    match entry.get_mut(old_id) {
        Some(existing) => {
            existing.insert(
                record::ID_FIELD.to_string(),
                serde_json::Value::String(new_id.to_string()),
            );
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ItemStatus;
    use crate::record::Payload;
    use chrono::Utc;
    use serde_json::{json, Value};

    fn rec(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn item(op: OperationType, doc: &str, payload: Value) -> QueueItem {
        QueueItem {
            id: uuid::Uuid::new_v4().to_string(),
            operation: op,
            collection: "appointments".to_string(),
            document_id: doc.to_string(),
            owner_identity: "u1".to_string(),
            payload: payload.as_object().cloned().unwrap_or_else(Payload::new),
            enqueued_at: Utc::now(),
            sequence: 0,
            retry_count: 0,
            last_error: None,
            status: ItemStatus::Pending,
        }
    }

    #[test]
    fn test_pending_update_wins_over_snapshot() {
        let snapshot = vec![rec(json!({"id": "A1", "title": "Old", "place": "Clinic"}))];
        let pending = vec![item(OperationType::Update, "A1", json!({"title": "New"}))];

        let entry = merge_snapshot("appointments", "u1", snapshot, &pending);
        let a1 = entry.get("A1").unwrap();
        assert_eq!(a1["title"], "New");
        assert_eq!(a1["place"], "Clinic");
    }

    #[test]
    fn test_create_is_ignored_when_present() {
        let snapshot = vec![rec(json!({"id": "A1", "title": "Remote"}))];
        let pending = vec![item(OperationType::Create, "A1", json!({"title": "Local"}))];

        let entry = merge_snapshot("appointments", "u1", snapshot, &pending);
        assert_eq!(entry.len(), 1);
        assert_eq!(entry.get("A1").unwrap()["title"], "Remote");
    }

    #[test]
    fn test_update_for_unknown_id_inserts_pending_record() {
        let pending = vec![item(OperationType::Update, "tmp-9", json!({"title": "Draft"}))];
        let entry = merge_snapshot("appointments", "u1", vec![], &pending);
        assert_eq!(entry.get("tmp-9").unwrap()["title"], "Draft");
    }

    #[test]
    fn test_delete_removes_and_tombstones() {
        let snapshot = vec![
            rec(json!({"id": "A1"})),
            rec(json!({"id": "A2"})),
        ];
        let pending = vec![
            item(OperationType::Delete, "A1", json!({})),
            item(OperationType::Delete, "A9", json!({})),
            item(OperationType::Update, "A9", json!({"title": "ghost"})),
        ];

        let entry = merge_snapshot("appointments", "u1", snapshot, &pending);
        assert!(!entry.contains("A1"));
        assert!(entry.contains("A2"));
        assert!(entry.is_tombstoned("A1"));
        assert!(entry.is_tombstoned("A9"));
        // An update after a delete does not resurrect the record
        assert!(!entry.contains("A9"));
    }

    #[test]
    fn test_overlay_is_idempotent() {
        let snapshot = vec![rec(json!({"id": "A1", "count": 1}))];
        let pending = vec![
            item(OperationType::Create, "T1", json!({"title": "New"})),
            item(OperationType::Update, "A1", json!({"count": 2})),
        ];

        let mut entry = merge_snapshot("appointments", "u1", snapshot, &pending);
        let once = entry.clone();
        overlay_pending(&mut entry, &pending);
        assert_eq!(entry, once);
    }

    #[test]
    fn test_overlay_ignores_other_identities() {
        let mut foreign = item(OperationType::Create, "X1", json!({}));
        foreign.owner_identity = "u2".to_string();

        let entry = merge_snapshot("appointments", "u1", vec![], &[foreign]);
        assert!(entry.is_empty());
    }

    #[test]
    fn test_snapshot_records_without_id_are_dropped() {
        let snapshot = vec![rec(json!({"title": "no id"})), rec(json!({"id": "A1"}))];
        let entry = merge_snapshot("appointments", "u1", snapshot, &[]);
        assert_eq!(entry.len(), 1);
    }

    #[test]
    fn test_rekey_moves_temp_record() {
        let pending = vec![item(OperationType::Create, "T1", json!({"title": "Dentist"}))];
        let mut entry = merge_snapshot("appointments", "u1", vec![], &pending);

        assert!(rekey(&mut entry, "T1", "R1"));
        assert!(!entry.contains("T1"));
        assert_eq!(entry.get("R1").unwrap()["title"], "Dentist");
    }

    #[test]
    fn test_rekey_drops_temp_when_remote_present() {
        let snapshot = vec![rec(json!({"id": "R1", "title": "Remote"}))];
        let pending = vec![item(OperationType::Create, "T1", json!({"title": "Local"}))];
        let mut entry = merge_snapshot("appointments", "u1", snapshot, &pending);
        assert_eq!(entry.len(), 2);

        assert!(rekey(&mut entry, "T1", "R1"));
        assert_eq!(entry.len(), 1);
        assert_eq!(entry.get("R1").unwrap()["title"], "Remote");
    }
}
