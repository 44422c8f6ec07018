use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::Payload;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::Create => write!(f, "create"),
            OperationType::Update => write!(f, "update"),
            OperationType::Delete => write!(f, "delete"),
        }
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" | "insert" => Ok(OperationType::Create),
            "update" => Ok(OperationType::Update),
            "delete" | "remove" => Ok(OperationType::Delete),
            other => Err(format!("unknown operation type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    /// Terminal until `retry_failed` resets it; never retried automatically
    PermanentlyFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
    pub id: String,
    pub operation: OperationType,
    pub collection: String,
    pub document_id: String,
    pub owner_identity: String,
    pub payload: Payload,
    pub enqueued_at: DateTime<Utc>,
    /// Monotonic tie-breaker for items enqueued within the same instant
    pub sequence: u64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub status: ItemStatus,
}

impl QueueItem {
    pub fn is_permanently_failed(&self) -> bool {
        self.status == ItemStatus::PermanentlyFailed
    }

    /// Counts toward `SyncStats::failed`
    pub fn is_failed(&self, threshold: u32) -> bool {
        self.is_permanently_failed() || self.retry_count > threshold
    }

    /// Serialized payload size, used for the queue byte bound
    pub fn payload_bytes(&self) -> usize {
        serde_json::to_string(&self.payload)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn targets(&self, collection: &str, document_id: &str) -> bool {
        self.collection == collection && self.document_id == document_id
    }
}

/// Bounds for the offline queue
///
/// When the queue is full (either by count or bytes), new changes are
/// rejected rather than dropping old ones, so acknowledged writes are
/// never lost.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Maximum number of queued items (default: 10,000)
    #[serde(default = "default_max_count")]
    pub max_count: usize,
    /// Maximum total payload size in bytes (default: 100MB)
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

fn default_max_count() -> usize {
    10_000
}

fn default_max_bytes() -> usize {
    100 * 1024 * 1024
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_count: default_max_count(),
            max_bytes: default_max_bytes(),
        }
    }
}

impl QueueConfig {
    pub fn new(max_count: usize, max_bytes: usize) -> Self {
        Self {
            max_count,
            max_bytes,
        }
    }

    /// Limits for constrained mobile devices
    pub fn mobile() -> Self {
        Self {
            max_count: 1_000,
            max_bytes: 10 * 1024 * 1024, // 10MB
        }
    }

    /// Limits for desktop applications
    pub fn desktop() -> Self {
        Self {
            max_count: 50_000,
            max_bytes: 500 * 1024 * 1024, // 500MB
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_type_parsing() {
        assert_eq!("create".parse::<OperationType>().unwrap(), OperationType::Create);
        assert_eq!("UPDATE".parse::<OperationType>().unwrap(), OperationType::Update);
        assert_eq!("remove".parse::<OperationType>().unwrap(), OperationType::Delete);
        assert!("upsert".parse::<OperationType>().is_err());
    }

    #[test]
    fn test_operation_type_serde() {
        let json = serde_json::to_string(&OperationType::Delete).unwrap();
        assert_eq!(json, "\"delete\"");
    }

    #[test]
    fn test_queue_config_presets() {
        let default = QueueConfig::default();
        assert_eq!(default.max_count, 10_000);
        assert_eq!(default.max_bytes, 100 * 1024 * 1024);

        let mobile = QueueConfig::mobile();
        assert_eq!(mobile.max_count, 1_000);
        assert_eq!(mobile.max_bytes, 10 * 1024 * 1024);

        let desktop = QueueConfig::desktop();
        assert_eq!(desktop.max_count, 50_000);
        assert_eq!(desktop.max_bytes, 500 * 1024 * 1024);
    }
}
