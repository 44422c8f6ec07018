//! Untyped records and payloads
//!
//! The engine never interprets domain fields. Records are JSON objects that
//! carry at least an `id`; payloads are the key/value patches merged into
//! them. Typed domain structs convert at the boundary.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{SyncError, SyncResult};

/// A stored record: a JSON object with an `id` field
pub type Record = Map<String, Value>;

/// A key/value patch applied to a record
pub type Payload = Map<String, Value>;

/// Field every record is keyed by
pub const ID_FIELD: &str = "id";

/// Prefix of ids minted on the device before the remote has seen a record
pub const TEMP_ID_PREFIX: &str = "tmp-";

pub fn temporary_id() -> String {
    format!("{}{}", TEMP_ID_PREFIX, uuid::Uuid::new_v4())
}

pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// The record's id, if it has a string one
pub fn record_id(record: &Record) -> Option<&str> {
    record.get(ID_FIELD).and_then(|v| v.as_str())
}

/// Build a record from an id and a payload. The id always wins over any
/// `id` key inside the payload.
pub fn new_record(id: &str, payload: &Payload) -> Record {
    let mut record = payload.clone();
    record.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    record
}

/// Shallow merge: top-level keys of `patch` overwrite those in `target`.
/// The record's `id` is never changed by a patch.
pub fn shallow_merge(target: &mut Record, patch: &Payload) {
    for (key, value) in patch {
        if key == ID_FIELD {
            continue;
        }
        target.insert(key.clone(), value.clone());
    }
}

/// Convert any serializable struct into a payload
pub fn to_payload<T: Serialize>(value: &T) -> SyncResult<Payload> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(SyncError::InvalidRecord(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

/// Convert a record back into a typed struct
pub fn from_record<T: DeserializeOwned>(record: &Record) -> SyncResult<T> {
    Ok(serde_json::from_value(Value::Object(record.clone()))?)
}
