//! Node configuration: replica backends, the shared state store and tuning.
//!
//! [`NodeConfig`] is loaded from a JSON file by the binary. Durations are
//! written as integer milliseconds. [`NodeConfig::validate`] rejects
//! configurations the node cannot start with.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ReplicatorError;
use crate::types::{BackendName, NodeId};
use crate::Result;

/// Default delay between reconciliation passes: 30 seconds.
pub const DEFAULT_REPLICATION_INTERVAL: Duration = Duration::from_secs(30);

/// Default lease of the reconciliation lock: 1 minute.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

/// Default multipart part threshold: 5 MiB.
pub const DEFAULT_PART_SIZE: usize = 5 * 1024 * 1024;

/// Default number of part uploads one streaming upload keeps in flight.
pub const DEFAULT_MAX_PARTS_IN_FLIGHT: usize = 4;

/// Default bound on a single remote call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bound on acquiring a connection to an S3 endpoint.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Default idle connections kept per S3 host.
pub const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 64;

/// Access credentials for an S3-compatible endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// One configured storage target. Read-only to the replicator.
///
/// The endpoint scheme selects the implementation: `local://<dir>` for a
/// filesystem directory, `memory://` for an in-process store, anything
/// else is an S3-compatible HTTP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendIdentity {
    pub name: BackendName,
    pub endpoint: String,
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

impl BackendIdentity {
    /// Identity of an in-process backend, for tests and local trials.
    pub fn memory(name: impl Into<String>) -> Self {
        Self {
            name: BackendName::new(name),
            endpoint: "memory://".to_string(),
            bucket: String::new(),
            region: None,
            credentials: None,
        }
    }
}

/// Configuration for a replicator node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique identifier for this node; owner of the locks it takes.
    #[serde(default = "NodeId::generate")]
    pub node_id: NodeId,

    /// Shared durable store for records, settings and locks:
    /// `"local://<dir>"`, `"memory://"` or `"s3://bucket/prefix?endpoint=..."`.
    pub state_uri: String,

    /// Replica targets. At least one is required.
    pub backends: Vec<BackendIdentity>,

    /// Backend that receives writes while replication is disabled.
    /// Defaults to the first configured backend.
    #[serde(default)]
    pub primary: Option<BackendName>,

    /// Delay between reconciliation passes.
    #[serde(default = "default_replication_interval", with = "millis")]
    pub replication_interval: Duration,

    /// Lease of the cross-instance reconciliation lock.
    #[serde(default = "default_lock_ttl", with = "millis")]
    pub lock_ttl: Duration,

    /// Buffered bytes that trigger a multipart part flush.
    #[serde(default = "default_part_size")]
    pub part_size: usize,

    /// Bound on concurrent part uploads of one streaming upload.
    #[serde(default = "default_max_parts_in_flight")]
    pub max_parts_in_flight: usize,

    /// Bound on every single remote call; exceeding it is a backend failure.
    #[serde(default = "default_request_timeout", with = "millis")]
    pub request_timeout: Duration,

    /// Bound on connection acquisition for S3 endpoints.
    #[serde(default = "default_connect_timeout", with = "millis")]
    pub connect_timeout: Duration,

    /// Idle connections kept per S3 host.
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
}

fn default_replication_interval() -> Duration {
    DEFAULT_REPLICATION_INTERVAL
}

fn default_lock_ttl() -> Duration {
    DEFAULT_LOCK_TTL
}

fn default_part_size() -> usize {
    DEFAULT_PART_SIZE
}

fn default_max_parts_in_flight() -> usize {
    DEFAULT_MAX_PARTS_IN_FLIGHT
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_pool_max_idle_per_host() -> usize {
    DEFAULT_POOL_MAX_IDLE_PER_HOST
}

impl NodeConfig {
    /// Create a config with default tuning and a generated node id.
    ///
    /// # Example
    ///
    /// ```
    /// use replicator_core::config::{BackendIdentity, NodeConfig};
    ///
    /// let config = NodeConfig::new(
    ///     "memory://",
    ///     vec![BackendIdentity::memory("one"), BackendIdentity::memory("two")],
    /// );
    /// assert_eq!(config.primary_backend().unwrap().as_str(), "one");
    /// ```
    pub fn new(state_uri: impl Into<String>, backends: Vec<BackendIdentity>) -> Self {
        Self {
            node_id: NodeId::generate(),
            state_uri: state_uri.into(),
            backends,
            primary: None,
            replication_interval: DEFAULT_REPLICATION_INTERVAL,
            lock_ttl: DEFAULT_LOCK_TTL,
            part_size: DEFAULT_PART_SIZE,
            max_parts_in_flight: DEFAULT_MAX_PARTS_IN_FLIGHT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
        }
    }

    /// Load and validate a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ReplicatorError::config(format!("Cannot read {}: {e}", path.display()))
        })?;
        let config: NodeConfig = serde_json::from_str(&raw).map_err(|e| {
            ReplicatorError::config(format!("Invalid config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// The backend that receives writes while replication is disabled.
    pub fn primary_backend(&self) -> Result<&BackendName> {
        match &self.primary {
            Some(name) => self
                .backends
                .iter()
                .map(|b| &b.name)
                .find(|n| *n == name)
                .ok_or_else(|| {
                    ReplicatorError::config(format!("Primary backend {name} is not configured"))
                }),
            None => self
                .backends
                .first()
                .map(|b| &b.name)
                .ok_or_else(|| ReplicatorError::config("Require at least one backend")),
        }
    }

    /// Check the invariants a node needs to start.
    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(ReplicatorError::config("Require at least one backend"));
        }
        let mut seen = HashSet::new();
        for backend in &self.backends {
            if !seen.insert(&backend.name) {
                return Err(ReplicatorError::config(format!(
                    "Duplicate backend name: {}",
                    backend.name
                )));
            }
        }
        self.primary_backend()?;
        if self.part_size == 0 {
            return Err(ReplicatorError::config("part_size must be positive"));
        }
        if self.max_parts_in_flight == 0 {
            return Err(ReplicatorError::config("max_parts_in_flight must be positive"));
        }
        Ok(())
    }
}

/// Serde helper: `Duration` as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
