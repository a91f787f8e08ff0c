//! Persistence of the singleton [`ReplicationSettings`] record.
//!
//! The operator-owned part (`enabled`) lives in `settings.json`. The
//! advisory status the reconciler reports lives in `status.json`, so a
//! status update never rewrites the enabled flag. While replication is
//! disabled the reported status is always `DISABLED`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use replicator_core::{ReplicationSettings, ReplicationStatus, Result, StorageBackend};

use crate::layout;

#[derive(Debug, Serialize, Deserialize)]
struct StatusRecord {
    status: ReplicationStatus,
    updated_at: DateTime<Utc>,
}

/// Reads and writes the replication settings record.
#[derive(Clone)]
pub struct SettingsStore {
    storage: Arc<dyn StorageBackend>,
}

impl SettingsStore {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Load the settings, persisting the defaults (enabled, ACTIVE) if none
    /// exist yet.
    pub async fn load_or_default(&self) -> Result<ReplicationSettings> {
        let mut settings = self.load_flag().await?;
        if !settings.enabled {
            settings.status = ReplicationStatus::Disabled;
        } else if let Some(record) = self.load_status().await? {
            settings.status = record.status;
        }
        Ok(settings)
    }

    async fn load_flag(&self) -> Result<ReplicationSettings> {
        let key = layout::settings_key();
        match self.storage.get(&key).await {
            Ok(data) => layout::decode(&data),
            Err(e) if e.is_not_found() => {
                let defaults = ReplicationSettings::default();
                if !self
                    .storage
                    .put_if_not_exists(&key, layout::encode(&defaults)?)
                    .await?
                {
                    // Another instance initialised it first
                    return layout::decode(&self.storage.get(&key).await?);
                }
                info!("Initialised replication settings");
                Ok(defaults)
            }
            Err(e) => Err(e),
        }
    }

    async fn load_status(&self) -> Result<Option<StatusRecord>> {
        match self.storage.get(&layout::status_key()).await {
            Ok(data) => Ok(Some(layout::decode(&data)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn save(&self, settings: &ReplicationSettings) -> Result<()> {
        self.storage
            .put(&layout::settings_key(), layout::encode(settings)?)
            .await
    }

    /// Turn fan-out on: `{enabled: true, status: ACTIVE}`.
    pub async fn enable(&self) -> Result<ReplicationSettings> {
        let settings = self.update(true, ReplicationStatus::Active).await?;
        self.set_status(ReplicationStatus::Active).await?;
        Ok(settings)
    }

    /// Restrict writes to the primary: `{enabled: false, status: DISABLED}`.
    pub async fn disable(&self) -> Result<ReplicationSettings> {
        self.update(false, ReplicationStatus::Disabled).await
    }

    /// Record the advisory status. Leaves the enabled flag untouched.
    pub async fn set_status(&self, status: ReplicationStatus) -> Result<()> {
        let record = StatusRecord {
            status,
            updated_at: Utc::now(),
        };
        self.storage
            .put(&layout::status_key(), layout::encode(&record)?)
            .await?;
        debug!(status = ?status, "Updated replication status");
        Ok(())
    }

    async fn update(
        &self,
        enabled: bool,
        status: ReplicationStatus,
    ) -> Result<ReplicationSettings> {
        let mut settings = self.load_flag().await?;
        settings.enabled = enabled;
        settings.status = status;
        self.save(&settings).await?;
        info!(enabled, status = ?status, "Updated replication settings");
        Ok(settings)
    }
}
