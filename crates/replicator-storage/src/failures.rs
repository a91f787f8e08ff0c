//! The failure queue: pending repair obligations.
//!
//! Each [`FailureRecord`] is its own JSON object keyed by record id, so the
//! coordinator can push and the reconciler can remove without ever
//! rewriting a shared document.

use std::sync::Arc;

use tracing::debug;

use replicator_core::{FailureRecord, RecordId, ReplicatorError, Result, StorageBackend};

use crate::layout;

/// Durable queue of operations that failed on one backend.
#[derive(Clone)]
pub struct FailureQueue {
    storage: Arc<dyn StorageBackend>,
}

impl FailureQueue {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    pub async fn push(&self, failure: &FailureRecord) -> Result<()> {
        let key = layout::failure_key(&failure.id);
        let created = self
            .storage
            .put_if_not_exists(&key, layout::encode(failure)?)
            .await?;
        if !created {
            return Err(ReplicatorError::Internal {
                message: format!("Failure record {} already exists", failure.id),
            });
        }
        debug!(
            object_key = %failure.object_key,
            backend = %failure.backend,
            method = ?failure.method,
            "Queued failure record"
        );
        Ok(())
    }

    /// A snapshot of every queued failure, oldest first.
    pub async fn all(&self) -> Result<Vec<FailureRecord>> {
        let mut failures: Vec<FailureRecord> =
            layout::read_records(self.storage.as_ref(), &layout::failures_prefix()).await?;
        failures.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(failures)
    }

    /// Remove a failure. Removing an absent record is not an error.
    pub async fn remove(&self, id: &RecordId) -> Result<()> {
        self.storage.delete(&layout::failure_key(id)).await
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self
            .storage
            .list(&layout::failures_prefix())
            .await?
            .iter()
            .filter(|k| k.ends_with(".json"))
            .count())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use replicator_core::{BackendName, Method, Properties};

    use crate::MemoryBackend;

    fn failure(key: &str, age_secs: i64) -> FailureRecord {
        FailureRecord::new(
            Method::Write,
            key,
            Properties::new(),
            BackendName::new("two"),
            Utc::now() - Duration::seconds(age_secs),
        )
    }

    #[tokio::test]
    async fn test_push_all_remove() {
        let queue = FailureQueue::new(Arc::new(MemoryBackend::new()));
        assert!(queue.is_empty().await.unwrap());

        let newer = failure("a", 1);
        let older = failure("b", 10);
        queue.push(&newer).await.unwrap();
        queue.push(&older).await.unwrap();

        let all = queue.all().await.unwrap();
        assert_eq!(all, vec![older.clone(), newer.clone()]);

        queue.remove(&older.id).await.unwrap();
        queue.remove(&older.id).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_survives_reopen_on_disk() {
        let tmp = tempfile::TempDir::new().unwrap();
        let storage = Arc::new(crate::LocalBackend::new(tmp.path()).await.unwrap());
        let f = failure("docs/a.txt", 0);
        FailureQueue::new(storage.clone()).push(&f).await.unwrap();

        let reopened = FailureQueue::new(storage);
        assert_eq!(reopened.all().await.unwrap(), vec![f]);
    }
}
