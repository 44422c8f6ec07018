use chrono::{DateTime, Utc};
use serde::Serialize;

use super::processor::ProcessorState;

/// Snapshot of sync health for the current identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Queued operations awaiting sync
    pub pending: usize,
    /// Of those, how many are permanently failed or past the failure threshold
    pub failed: usize,
    pub is_online: bool,
    pub is_processing: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub state: ProcessorState,
}
