//! Time-bounded named lock shared across replicator instances.
//!
//! A lock is a JSON object created with `put_if_not_exists`. Whoever
//! creates it holds it until `expires_at`; after that any instance may
//! break it. The lease is advisory: work started under a lease is never
//! interrupted when the lease runs out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use replicator_core::{NodeId, ReplicatorError, Result, StorageBackend};

use crate::layout;

/// The persisted lock object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub owner: NodeId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Acquires and releases named leases in a shared store.
#[derive(Clone)]
pub struct LeaseLock {
    storage: Arc<dyn StorageBackend>,
}

impl LeaseLock {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Try to take the lock without waiting.
    ///
    /// Returns `None` if another owner holds an unexpired lease. An expired
    /// or unreadable lock object is broken and acquisition retried once.
    pub async fn try_acquire(
        &self,
        name: &str,
        owner: &NodeId,
        ttl: Duration,
    ) -> Result<Option<Lease>> {
        let key = layout::lock_key(name);
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| {
            ReplicatorError::config(format!("Lock ttl out of range: {e}"))
        })?;

        for attempt in 0..2 {
            let now = Utc::now();
            let lease = Lease {
                name: name.to_string(),
                owner: owner.clone(),
                acquired_at: now,
                expires_at: now + ttl,
            };
            if self
                .storage
                .put_if_not_exists(&key, layout::encode(&lease)?)
                .await?
            {
                debug!(lock = name, owner = %owner, "Acquired lease");
                return Ok(Some(lease));
            }

            if attempt == 1 {
                break;
            }

            let current = match self.storage.get(&key).await {
                Ok(data) => layout::decode::<Lease>(&data).ok(),
                // Released between our write and read
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            match current {
                Some(held) if !held.is_expired(now) => {
                    debug!(lock = name, holder = %held.owner, "Lease held elsewhere");
                    return Ok(None);
                }
                Some(held) => {
                    info!(lock = name, holder = %held.owner, "Breaking expired lease");
                }
                None => {
                    warn!(lock = name, "Breaking unreadable lease");
                }
            }
            self.storage.delete(&key).await?;
        }
        Ok(None)
    }

    /// Release a lease. A lock that has since been taken over by another
    /// owner is left alone.
    pub async fn release(&self, lease: &Lease) -> Result<()> {
        let key = layout::lock_key(&lease.name);
        let current = match self.storage.get(&key).await {
            Ok(data) => layout::decode::<Lease>(&data)?,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if current.owner == lease.owner && current.acquired_at == lease.acquired_at {
            self.storage.delete(&key).await?;
            debug!(lock = %lease.name, "Released lease");
        } else {
            warn!(lock = %lease.name, holder = %current.owner, "Lease was taken over; not releasing");
        }
        Ok(())
    }

    /// The current lease, if any.
    pub async fn holder(&self, name: &str) -> Result<Option<Lease>> {
        match self.storage.get(&layout::lock_key(name)).await {
            Ok(data) => Ok(Some(layout::decode(&data)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
