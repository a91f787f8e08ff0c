//! Unified error types for the replicator.
//!
//! All errors are represented by [`ReplicatorError`], using `thiserror`
//! for ergonomic error definitions. Library code never uses `unwrap()`;
//! all fallible operations return `Result<T, ReplicatorError>`.

use std::time::Duration;

use thiserror::Error;

use crate::types::BackendName;

/// The unified error type for all replicator operations.
#[derive(Error, Debug)]
pub enum ReplicatorError {
    /// A storage operation failed (transport error or backend rejection).
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable description of the failure.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The requested key was not found.
    #[error("Not found: {key}")]
    NotFound {
        /// The object or storage key that was not found.
        key: String,
    },

    /// A remote call did not complete within its time bound.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Description of the call that timed out.
        operation: String,
        /// The bound that was exceeded.
        after: Duration,
    },

    /// Invalid configuration was provided.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },

    /// A record referenced a backend that is not configured.
    #[error("Unknown backend: {name}")]
    UnknownBackend {
        /// The backend name that could not be resolved.
        name: BackendName,
    },

    /// A record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The body stream of an upload or download failed.
    #[error("Stream error: {message}")]
    Stream {
        /// Description of the stream failure.
        message: String,
    },

    /// A single-shot upload received a different number of bytes than declared.
    #[error("Length mismatch for {key}: declared {declared} bytes, received {received}")]
    LengthMismatch {
        key: String,
        declared: u64,
        received: u64,
    },

    /// An internal error (bug).
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl ReplicatorError {
    /// Create a storage error from a message and source error.
    pub fn storage(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error from a message only.
    pub fn storage_msg(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether this error means the key does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for ReplicatorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
