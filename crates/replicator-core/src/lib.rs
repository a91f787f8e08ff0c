//! Replicator core types, traits, configuration, and errors.
//!
//! This crate provides the foundational building blocks for replicating
//! objects across independently administered object stores: typed
//! identifiers, the operation-log and failure-queue record types, the
//! [`StorageBackend`] trait, node configuration, and the unified error type.

pub mod config;
pub mod error;
pub mod records;
pub mod storage;
pub mod types;

pub use config::{BackendIdentity, Credentials, NodeConfig};
pub use error::ReplicatorError;
pub use records::*;
pub use storage::{ByteStream, CompletedPart, StorageBackend};
pub use types::*;

/// Convenience Result type using [`ReplicatorError`].
pub type Result<T> = std::result::Result<T, ReplicatorError>;
