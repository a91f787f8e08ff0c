//! The configured backend clients of a node, resolvable by name.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use replicator_core::{BackendName, NodeConfig, ReplicatorError, Result};
use replicator_storage::{open_backend, S3Options};

use crate::client::{BackendClient, ClientTuning};

/// Every configured backend client with one designated primary. Lookup is
/// by name; iteration keeps configuration order.
#[derive(Debug)]
pub struct BackendSet {
    by_name: HashMap<BackendName, Arc<BackendClient>>,
    clients: Vec<Arc<BackendClient>>,
    primary: Arc<BackendClient>,
}

impl BackendSet {
    /// Build a set from ready clients. Fails on an empty set, duplicate
    /// names or a primary that is not in the set.
    pub fn new(clients: Vec<Arc<BackendClient>>, primary: &BackendName) -> Result<Self> {
        if clients.is_empty() {
            return Err(ReplicatorError::config("Require at least one backend"));
        }
        let mut by_name = HashMap::with_capacity(clients.len());
        for client in &clients {
            if by_name
                .insert(client.name().clone(), Arc::clone(client))
                .is_some()
            {
                return Err(ReplicatorError::config(format!(
                    "Duplicate backend name: {}",
                    client.name()
                )));
            }
        }
        let primary = by_name
            .get(primary)
            .cloned()
            .ok_or_else(|| ReplicatorError::UnknownBackend {
                name: primary.clone(),
            })?;
        Ok(Self {
            by_name,
            clients,
            primary,
        })
    }

    /// Open a client for every backend in the configuration.
    pub async fn open(config: &NodeConfig) -> Result<Self> {
        config.validate()?;
        let options = S3Options::from_config(config);
        let tuning = ClientTuning::from_config(config);

        let mut clients = Vec::with_capacity(config.backends.len());
        for identity in &config.backends {
            let storage = open_backend(identity, &options).await?;
            info!(backend = %identity.name, endpoint = %identity.endpoint, "Opened backend");
            clients.push(Arc::new(BackendClient::new(
                identity.name.clone(),
                storage,
                tuning,
            )));
        }
        Self::new(clients, config.primary_backend()?)
    }

    pub fn get(&self, name: &BackendName) -> Option<&Arc<BackendClient>> {
        self.by_name.get(name)
    }

    pub fn primary(&self) -> &Arc<BackendClient> {
        &self.primary
    }

    pub fn all(&self) -> &[Arc<BackendClient>] {
        &self.clients
    }

    pub fn names(&self) -> Vec<&BackendName> {
        self.clients.iter().map(|c| c.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
