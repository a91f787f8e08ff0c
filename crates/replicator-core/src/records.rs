//! Types for the operation log, the failure queue and replication settings.
//!
//! The operation log is the source of truth for where the latest copy of an
//! object lives: every operation a backend accepted is appended as an
//! [`OperationRecord`], every operation a backend rejected is queued as a
//! [`FailureRecord`] for the reconciliation loop. Records are never updated
//! in place.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{BackendName, RecordId};

/// Record property holding the object's content type.
pub const CONTENT_TYPE_PROPERTY: &str = "contentType";

/// Record property holding the object's length in bytes.
pub const CONTENT_LENGTH_PROPERTY: &str = "contentLength";

/// Content type used when a client does not send one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Free-form object properties carried by a record.
pub type Properties = BTreeMap<String, String>;

/// The kind of operation a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Method {
    Write,
    Delete,
}

/// An operation a backend accepted. Appended once per backend per success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: RecordId,
    pub method: Method,
    pub object_key: String,
    #[serde(default)]
    pub properties: Properties,
    pub backend: BackendName,
    pub timestamp: DateTime<Utc>,
}

impl OperationRecord {
    /// Create a record with a freshly generated id.
    pub fn new(
        method: Method,
        object_key: impl Into<String>,
        properties: Properties,
        backend: BackendName,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RecordId::generate(),
            method,
            object_key: object_key.into(),
            properties,
            backend,
            timestamp,
        }
    }

    /// The recorded content type, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.properties.get(CONTENT_TYPE_PROPERTY).map(String::as_str)
    }

    /// The recorded content length, if any and well-formed.
    pub fn content_length(&self) -> Option<u64> {
        self.properties
            .get(CONTENT_LENGTH_PROPERTY)
            .and_then(|v| v.parse().ok())
    }
}

/// A pending repair obligation: `method` on `object_key` failed on `backend`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: RecordId,
    pub method: Method,
    pub object_key: String,
    #[serde(default)]
    pub properties: Properties,
    pub backend: BackendName,
    pub timestamp: DateTime<Utc>,
}

impl FailureRecord {
    /// Create a record with a freshly generated id.
    pub fn new(
        method: Method,
        object_key: impl Into<String>,
        properties: Properties,
        backend: BackendName,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RecordId::generate(),
            method,
            object_key: object_key.into(),
            properties,
            backend,
            timestamp,
        }
    }
}

/// Build the properties recorded for a write.
pub fn write_properties(content_type: &str, length: Option<u64>) -> Properties {
    let mut properties = Properties::new();
    properties.insert(CONTENT_TYPE_PROPERTY.to_string(), content_type.to_string());
    if let Some(length) = length {
        properties.insert(CONTENT_LENGTH_PROPERTY.to_string(), length.to_string());
    }
    properties
}

/// Advisory replication state, for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationStatus {
    Disabled,
    Active,
    BackgroundWork,
}

/// The singleton replication settings record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationSettings {
    pub id: RecordId,
    /// When false, writes and deletes only go to the primary backend.
    pub enabled: bool,
    pub status: ReplicationStatus,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            id: RecordId::generate(),
            enabled: true,
            status: ReplicationStatus::Active,
        }
    }
}

/// Whether an object is present on a backend, according to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Existence {
    Exists,
    Removed,
}

impl From<Method> for Existence {
    fn from(method: Method) -> Self {
        match method {
            Method::Write => Existence::Exists,
            Method::Delete => Existence::Removed,
        }
    }
}

/// The last known state of one object on one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub backend: BackendName,
    pub existence: Existence,
    pub properties: Properties,
    pub timestamp: DateTime<Utc>,
}

/// The last known state of one object on every backend that has seen it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectStatus {
    pub object_key: String,
    pub backends: Vec<BackendStatus>,
}

/// How one backend fared in a fan-out call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Successful,
    Failed { reason: String },
}

/// The result of a fan-out call on one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendOutcome {
    pub backend: BackendName,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Aggregate of one fan-out write or delete.
///
/// The call as a whole succeeds when at least one backend succeeded; a
/// minority of unavailable backends never fails a write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub object_key: String,
    pub outcomes: Vec<BackendOutcome>,
}

impl OperationResult {
    pub fn is_successful(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.outcome == Outcome::Successful)
    }

    /// Backends that accepted the operation.
    pub fn succeeded(&self) -> Vec<&BackendName> {
        self.outcomes
            .iter()
            .filter(|o| o.outcome == Outcome::Successful)
            .map(|o| &o.backend)
            .collect()
    }

    /// Backends that rejected the operation.
    pub fn failed(&self) -> Vec<&BackendName> {
        self.outcomes
            .iter()
            .filter(|o| o.outcome != Outcome::Successful)
            .map(|o| &o.backend)
            .collect()
    }
}

/// The most recent record across all backends: the source of truth.
///
/// Backends tied on time hold the same operation; the tie goes to the
/// greatest backend name so repeated lookups agree.
pub fn source_of_truth(records: &[OperationRecord]) -> Option<&OperationRecord> {
    records.iter().max_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.backend.cmp(&b.backend))
    })
}

/// The most recent record per backend, ordered by backend name.
pub fn latest_per_backend(records: &[OperationRecord]) -> Vec<&OperationRecord> {
    let mut latest: BTreeMap<&BackendName, &OperationRecord> = BTreeMap::new();
    for record in records {
        match latest.get(&record.backend) {
            Some(current) if current.timestamp > record.timestamp => {}
            _ => {
                latest.insert(&record.backend, record);
            }
        }
    }
    latest.into_values().collect()
}

/// Per-backend status of one object, derived from its log records.
pub fn backend_statuses(records: &[OperationRecord]) -> Vec<BackendStatus> {
    latest_per_backend(records)
        .into_iter()
        .map(|r| BackendStatus {
            backend: r.backend.clone(),
            existence: r.method.into(),
            properties: r.properties.clone(),
            timestamp: r.timestamp,
        })
        .collect()
}

/// Group log records by object key and derive each object's status.
pub fn object_statuses(records: &[OperationRecord]) -> Vec<ObjectStatus> {
    let mut by_key: BTreeMap<&str, Vec<OperationRecord>> = BTreeMap::new();
    for record in records {
        by_key
            .entry(record.object_key.as_str())
            .or_default()
            .push(record.clone());
    }
    by_key
        .into_iter()
        .map(|(key, records)| ObjectStatus {
            object_key: key.to_string(),
            backends: backend_statuses(&records),
        })
        .collect()
}

/// Collapse failures to one per `(object_key, method, backend)`, keeping the
/// earliest, and order them oldest first.
pub fn dedup_failures(failures: Vec<FailureRecord>) -> Vec<FailureRecord> {
    let mut earliest: HashMap<(String, Method, BackendName), FailureRecord> = HashMap::new();
    for failure in failures {
        let key = (
            failure.object_key.clone(),
            failure.method,
            failure.backend.clone(),
        );
        match earliest.get(&key) {
            Some(current) if current.timestamp <= failure.timestamp => {}
            _ => {
                earliest.insert(key, failure);
            }
        }
    }
    let mut result: Vec<FailureRecord> = earliest.into_values().collect();
    result.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    result
}
