//! Versioned blob encoding for everything the engine persists.
//!
//! Blobs are JSON envelopes: `{"version": 1, "data": ...}`. A blob written
//! by a newer build is refused instead of being misread.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Current on-disk format version for queue and cache blobs
pub const FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    version: u32,
    data: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    version: u32,
    data: T,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

/// Encode a value into a versioned JSON blob
pub fn encode<T: Serialize>(value: &T) -> SyncResult<String> {
    let envelope = EnvelopeRef {
        version: FORMAT_VERSION,
        data: value,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Decode a versioned JSON blob
pub fn decode<T: DeserializeOwned>(blob: &str) -> SyncResult<T> {
    let probe: VersionProbe = serde_json::from_str(blob)?;
    if probe.version > FORMAT_VERSION {
        return Err(SyncError::UnsupportedFormat {
            found: probe.version,
            supported: FORMAT_VERSION,
        });
    }

    let envelope: Envelope<T> = serde_json::from_str(blob)?;
    Ok(envelope.data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_wraps_in_envelope() {
        let blob = encode(&vec!["a", "b"]).unwrap();
        let raw: serde_json::Value = serde_json::from_str(&blob).unwrap();
        assert_eq!(raw["version"], FORMAT_VERSION);
        assert_eq!(raw["data"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn test_decode_current_version() {
        let blob = r#"{"version": 1, "data": {"x": 5}}"#;
        let value: serde_json::Value = decode(blob).unwrap();
        assert_eq!(value["x"], 5);
    }

    #[test]
    fn test_decode_rejects_newer_version() {
        let blob = r#"{"version": 7, "data": []}"#;
        let result: SyncResult<Vec<String>> = decode(blob);
        assert!(matches!(
            result,
            Err(SyncError::UnsupportedFormat {
                found: 7,
                supported: FORMAT_VERSION
            })
        ));
    }

    #[test]
    fn test_decode_garbage_is_serialization_error() {
        let result: SyncResult<Vec<String>> = decode("not json");
        assert!(matches!(result, Err(SyncError::Serialization(_))));
    }
}
