//! Storage backends and durable record stores for the replicator.
//!
//! This crate provides concrete implementations of the
//! [`StorageBackend`](replicator_core::StorageBackend) trait:
//!
//! - [`S3Backend`]: any S3-compatible object storage (replica targets and
//!   multi-instance state)
//! - [`LocalBackend`]: filesystem-backed storage for solo mode and development
//! - [`MemoryBackend`]: in-process storage for tests and trials
//!
//! and the record stores the replicator keeps in its shared state store:
//! [`OperationLog`], [`FailureQueue`], [`SettingsStore`] and [`LeaseLock`].

pub mod failures;
pub mod layout;
pub mod local;
pub mod lock;
pub mod memory;
pub mod open;
pub mod oplog;
pub mod s3;
pub mod settings;

pub use failures::FailureQueue;
pub use local::LocalBackend;
pub use lock::{Lease, LeaseLock};
pub use memory::MemoryBackend;
pub use open::{open_backend, open_state_store};
pub use oplog::OperationLog;
pub use s3::{S3Backend, S3Options};
pub use settings::SettingsStore;
