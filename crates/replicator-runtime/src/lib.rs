//! Replicator runtime: fan-out coordination, reconciliation and node lifecycle.
//!
//! This crate contains the [`ReplicatorNode`] which is the main entry point
//! for running a replicator instance, the [`ReplicationCoordinator`] which
//! fans writes and deletes out to every backend and answers reads from the
//! operation log, and the [`Reconciler`] which repairs backends that missed
//! an operation.

pub mod backends;
pub mod client;
pub mod coordinator;
pub mod fanout;
pub mod node;
pub mod reconciler;

pub use backends::BackendSet;
pub use client::{BackendClient, ClientTuning};
pub use coordinator::{ObjectRead, ReplicationCoordinator};
pub use fanout::tee;
pub use node::ReplicatorNode;
pub use reconciler::{PassReport, Reconciler, RECONCILE_LOCK};
