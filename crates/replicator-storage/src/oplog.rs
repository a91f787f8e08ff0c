//! The append-only operation log.
//!
//! One JSON object per [`OperationRecord`], grouped by object key. Records
//! are written with `put_if_not_exists` and never rewritten; the log is the
//! only authority on which backend holds the latest copy of an object.

use std::sync::Arc;

use tracing::debug;

use replicator_core::{
    source_of_truth, BackendName, OperationRecord, ReplicatorError, Result, StorageBackend,
};

use crate::layout;

/// Durable log of operations backends accepted.
#[derive(Clone)]
pub struct OperationLog {
    storage: Arc<dyn StorageBackend>,
}

impl OperationLog {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Append a record. Fails if a record with the same id already exists.
    pub async fn append(&self, record: &OperationRecord) -> Result<()> {
        let key = layout::log_record_key(&record.object_key, &record.id);
        let created = self
            .storage
            .put_if_not_exists(&key, layout::encode(record)?)
            .await?;
        if !created {
            return Err(ReplicatorError::Internal {
                message: format!("Operation record {} already exists", record.id),
            });
        }
        debug!(
            object_key = %record.object_key,
            backend = %record.backend,
            method = ?record.method,
            "Appended operation record"
        );
        Ok(())
    }

    /// All records for one object key, oldest first.
    pub async fn records_for(&self, object_key: &str) -> Result<Vec<OperationRecord>> {
        let mut records: Vec<OperationRecord> =
            layout::read_records(self.storage.as_ref(), &layout::log_key_prefix(object_key))
                .await?;
        records.retain(|r| r.object_key == object_key);
        sort_by_time(&mut records);
        Ok(records)
    }

    /// All records one backend accepted, oldest first.
    pub async fn records_for_backend(&self, backend: &BackendName) -> Result<Vec<OperationRecord>> {
        let mut records = self.all().await?;
        records.retain(|r| &r.backend == backend);
        Ok(records)
    }

    /// Every record in the log, oldest first.
    pub async fn all(&self) -> Result<Vec<OperationRecord>> {
        let mut records: Vec<OperationRecord> =
            layout::read_records(self.storage.as_ref(), &layout::log_prefix()).await?;
        sort_by_time(&mut records);
        Ok(records)
    }

    /// The most recent record for `object_key` across all backends.
    pub async fn source_of_truth(&self, object_key: &str) -> Result<Option<OperationRecord>> {
        let records = self.records_for(object_key).await?;
        Ok(source_of_truth(&records).cloned())
    }

    /// The most recent record for `object_key` on one backend.
    pub async fn latest_for(
        &self,
        object_key: &str,
        backend: &BackendName,
    ) -> Result<Option<OperationRecord>> {
        let records = self.records_for(object_key).await?;
        Ok(records
            .into_iter()
            .filter(|r| &r.backend == backend)
            .max_by(|a, b| a.timestamp.cmp(&b.timestamp)))
    }
}

fn sort_by_time(records: &mut [OperationRecord]) {
    records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use replicator_core::{Method, Properties};

    use crate::MemoryBackend;

    fn record(key: &str, backend: &str, method: Method, secs: i64) -> OperationRecord {
        OperationRecord::new(
            method,
            key,
            Properties::new(),
            BackendName::new(backend),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs),
        )
    }

    fn log() -> OperationLog {
        OperationLog::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn test_records_for_key_only() {
        let log = log();
        log.append(&record("a", "one", Method::Write, 2)).await.unwrap();
        log.append(&record("a", "two", Method::Write, 1)).await.unwrap();
        log.append(&record("ab", "one", Method::Write, 3)).await.unwrap();

        let records = log.records_for("a").await.unwrap();
        let backends: Vec<&str> = records.iter().map(|r| r.backend.as_str()).collect();
        assert_eq!(backends, vec!["two", "one"]);
        assert_eq!(log.all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_append_rejects_duplicate_id() {
        let log = log();
        let r = record("a", "one", Method::Write, 1);
        log.append(&r).await.unwrap();
        assert!(log.append(&r).await.is_err());
    }

    #[tokio::test]
    async fn test_source_of_truth_and_latest_for() {
        let log = log();
        log.append(&record("a", "one", Method::Write, 1)).await.unwrap();
        log.append(&record("a", "two", Method::Write, 3)).await.unwrap();
        log.append(&record("a", "one", Method::Delete, 2)).await.unwrap();

        let sot = log.source_of_truth("a").await.unwrap().unwrap();
        assert_eq!(sot.backend.as_str(), "two");

        let latest_one = log
            .latest_for("a", &BackendName::new("one"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest_one.method, Method::Delete);

        assert!(log.source_of_truth("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_records_for_backend() {
        let log = log();
        log.append(&record("a", "one", Method::Write, 1)).await.unwrap();
        log.append(&record("b", "two", Method::Write, 2)).await.unwrap();
        log.append(&record("c", "one", Method::Delete, 3)).await.unwrap();

        let records = log
            .records_for_backend(&BackendName::new("one"))
            .await
            .unwrap();
        let keys: Vec<&str> = records.iter().map(|r| r.object_key.as_str()).collect();
        assert_eq!(keys, vec!["a", "c"]);
    }
}
