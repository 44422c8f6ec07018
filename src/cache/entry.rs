use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::record::{self, Record};

/// Materialized records of one collection for one identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub collection: String,
    pub owner_identity: String,
    pub records: Vec<Record>,
    /// Last remote refresh; `None` while only local writes populated it
    pub fetched_at: Option<DateTime<Utc>>,
    /// Ids deleted locally whose delete has not been confirmed yet
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tombstones: BTreeSet<String>,
}

impl CacheEntry {
    pub fn new(collection: &str, owner_identity: &str) -> Self {
        Self {
            collection: collection.to_string(),
            owner_identity: owner_identity.to_string(),
            records: Vec::new(),
            fetched_at: None,
            tombstones: BTreeSet::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.iter().find(|r| record::record_id(r) == Some(id))
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Record> {
        self.records
            .iter_mut()
            .find(|r| record::record_id(r) == Some(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones.contains(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Deserialize every record into a typed struct
    pub fn records_as<T: DeserializeOwned>(&self) -> SyncResult<Vec<T>> {
        self.records.iter().map(record::from_record).collect()
    }
}
