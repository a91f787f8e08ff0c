//! Key layout of the shared state store and JSON record helpers.
//!
//! ```text
//! _replication/log/k<hex(sha256(object key))>/<record id>.json
//! _replication/failures/<record id>.json
//! _replication/settings.json
//! _replication/status.json
//! _replication/locks/<lock name>.json
//! ```
//!
//! Object keys are hashed so any key maps to one fixed-length path segment.
//! Records carry their full key, and readers filter on it.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use replicator_core::{RecordId, Result, StorageBackend};

pub const STATE_PREFIX: &str = "_replication";

pub fn log_prefix() -> String {
    format!("{STATE_PREFIX}/log/")
}

pub fn log_key_prefix(object_key: &str) -> String {
    let digest = Sha256::digest(object_key.as_bytes());
    format!("{STATE_PREFIX}/log/k{}/", hex::encode(digest))
}

pub fn log_record_key(object_key: &str, id: &RecordId) -> String {
    format!("{}{id}.json", log_key_prefix(object_key))
}

pub fn failures_prefix() -> String {
    format!("{STATE_PREFIX}/failures/")
}

pub fn failure_key(id: &RecordId) -> String {
    format!("{}{id}.json", failures_prefix())
}

pub fn settings_key() -> String {
    format!("{STATE_PREFIX}/settings.json")
}

pub fn status_key() -> String {
    format!("{STATE_PREFIX}/status.json")
}

pub fn lock_key(name: &str) -> String {
    format!("{STATE_PREFIX}/locks/{name}.json")
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec_pretty(value)?))
}

pub(crate) fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(data)?)
}

/// Read every `.json` record under `prefix`.
///
/// Records deleted between listing and reading are skipped, as are records
/// that fail to decode.
pub(crate) async fn read_records<T: DeserializeOwned>(
    storage: &dyn StorageBackend,
    prefix: &str,
) -> Result<Vec<T>> {
    let keys = storage.list(prefix).await?;
    let mut records = Vec::with_capacity(keys.len());
    for key in keys.iter().filter(|k| k.ends_with(".json")) {
        let data = match storage.get(key).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        };
        match decode(&data) {
            Ok(record) => records.push(record),
            Err(e) => warn!(key = %key, error = %e, "Skipping unreadable record"),
        }
    }
    Ok(records)
}
