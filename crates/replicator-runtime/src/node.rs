//! Replicator node lifecycle.
//!
//! The [`ReplicatorNode`] is the main entry point for running a replicator
//! instance. It opens every configured backend and the shared state store,
//! and owns the coordinator and the reconciliation loop.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use replicator_core::config::NodeConfig;
use replicator_core::{Result, StorageBackend};
use replicator_storage::open_state_store;

use crate::backends::BackendSet;
use crate::coordinator::ReplicationCoordinator;
use crate::reconciler::Reconciler;

/// A running replicator instance.
pub struct ReplicatorNode {
    /// The node's configuration.
    pub config: NodeConfig,

    /// Shared store holding records, settings and locks.
    pub state: Arc<dyn StorageBackend>,

    pub coordinator: ReplicationCoordinator,

    pub reconciler: Arc<Reconciler>,

    cancel: watch::Sender<bool>,
}

impl ReplicatorNode {
    /// Start a node with the given configuration.
    ///
    /// Fails if the configuration is invalid or a backend cannot be opened.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let state = open_state_store(&config.state_uri).await?;
        Self::with_state(config, state).await
    }

    /// Start a node on an already opened state store.
    pub async fn with_state(config: NodeConfig, state: Arc<dyn StorageBackend>) -> Result<Self> {
        let backends = Arc::new(BackendSet::open(&config).await?);
        Ok(Self::assemble(config, state, backends))
    }

    /// Build a node from already opened parts.
    pub fn assemble(
        config: NodeConfig,
        state: Arc<dyn StorageBackend>,
        backends: Arc<BackendSet>,
    ) -> Self {
        let coordinator = ReplicationCoordinator::new(Arc::clone(&backends), Arc::clone(&state));
        let reconciler = Arc::new(Reconciler::new(
            backends,
            Arc::clone(&state),
            config.node_id.clone(),
            config.lock_ttl,
        ));
        let (cancel, _) = watch::channel(false);

        info!(
            node_id = %config.node_id,
            backends = config.backends.len(),
            state_uri = %config.state_uri,
            "Replicator node started"
        );

        Self {
            config,
            state,
            coordinator,
            reconciler,
            cancel,
        }
    }

    /// Start the scheduled reconciliation loop in the background.
    pub fn spawn_reconciler(&self) -> JoinHandle<()> {
        let reconciler = Arc::clone(&self.reconciler);
        let interval = self.config.replication_interval;
        let cancel = self.cancel.subscribe();
        tokio::spawn(async move { reconciler.run(interval, cancel).await })
    }

    /// Stop background loops. In-flight repairs run to completion.
    pub async fn shutdown(&self) {
        info!(node_id = %self.config.node_id, "Replicator node shutting down");
        let _ = self.cancel.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replicator_core::BackendIdentity;
    use std::time::Duration;

    #[tokio::test]
    async fn test_start_local_node() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = NodeConfig::new(
            format!("local://{}", tmp.path().join("state").display()),
            vec![BackendIdentity::memory("one"), BackendIdentity::memory("two")],
        );
        let node = ReplicatorNode::start(config).await.unwrap();
        assert_eq!(node.coordinator.backends().len(), 2);
        assert!(node.coordinator.settings().await.unwrap().enabled);
        assert!(tmp.path().join("state/_replication/settings.json").exists());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_rejects_empty_backends() {
        let config = NodeConfig::new("memory://", vec![]);
        assert!(ReplicatorNode::start(config).await.is_err());
    }

    #[tokio::test]
    async fn test_reconciler_stops_on_shutdown() {
        let mut config = NodeConfig::new("memory://", vec![BackendIdentity::memory("one")]);
        config.replication_interval = Duration::from_millis(10);
        let node = ReplicatorNode::start(config).await.unwrap();
        let handle = node.spawn_reconciler();
        tokio::time::sleep(Duration::from_millis(30)).await;
        node.shutdown().await;
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("reconciler should stop")
            .unwrap();
    }
}
