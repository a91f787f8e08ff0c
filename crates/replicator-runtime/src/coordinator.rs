//! Fan-out of writes and deletes, and log-driven reads and status queries.
//!
//! Every write or delete goes to all backends (or only the primary while
//! replication is disabled) concurrently. Each backend that accepts the
//! operation gets an [`OperationRecord`]; each one that rejects it gets a
//! [`FailureRecord`] for the reconciler. The call as a whole succeeds when
//! any backend succeeded.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{error, info, instrument, warn};

use replicator_core::{
    backend_statuses, object_statuses, write_properties, BackendName, BackendOutcome,
    BackendStatus, ByteStream, FailureRecord, Method, ObjectStatus, OperationRecord,
    OperationResult, Outcome, Properties, ReplicationSettings, ReplicatorError, Result,
    StorageBackend,
};
use replicator_storage::{FailureQueue, OperationLog, SettingsStore};

use crate::backends::BackendSet;
use crate::client::BackendClient;
use crate::fanout::tee;

/// An object opened for reading from its source of truth.
pub struct ObjectRead {
    /// Backend serving the bytes.
    pub backend: BackendName,
    /// Properties recorded with the latest write.
    pub properties: Properties,
    pub stream: ByteStream,
}

impl ObjectRead {
    pub fn content_type(&self) -> Option<&str> {
        self.properties
            .get(replicator_core::CONTENT_TYPE_PROPERTY)
            .map(String::as_str)
    }
}

impl std::fmt::Debug for ObjectRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRead")
            .field("backend", &self.backend)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

/// Replicates writes and deletes across the configured backends.
#[derive(Clone)]
pub struct ReplicationCoordinator {
    backends: Arc<BackendSet>,
    log: OperationLog,
    failures: FailureQueue,
    settings: SettingsStore,
}

impl ReplicationCoordinator {
    /// Create a coordinator keeping its records in `state`.
    pub fn new(backends: Arc<BackendSet>, state: Arc<dyn StorageBackend>) -> Self {
        Self {
            backends,
            log: OperationLog::new(Arc::clone(&state)),
            failures: FailureQueue::new(Arc::clone(&state)),
            settings: SettingsStore::new(state),
        }
    }

    pub fn backends(&self) -> &Arc<BackendSet> {
        &self.backends
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn failures(&self) -> &FailureQueue {
        &self.failures
    }

    /// Backends a new operation goes to under the current settings.
    async fn targets(&self) -> Result<Vec<Arc<BackendClient>>> {
        let settings = self.settings.load_or_default().await?;
        if settings.enabled {
            Ok(self.backends.all().to_vec())
        } else {
            Ok(vec![Arc::clone(self.backends.primary())])
        }
    }

    /// Write `body` to every target backend.
    ///
    /// Bodies with a known length up to the part size go up in a single
    /// request, everything else as a multipart upload. Returns once every
    /// target has settled.
    #[instrument(skip(self, body), fields(key = %object_key))]
    pub async fn write(
        &self,
        object_key: &str,
        body: ByteStream,
        content_type: &str,
        length: Option<u64>,
        timestamp: DateTime<Utc>,
    ) -> Result<OperationResult> {
        let targets = self.targets().await?;
        let properties = write_properties(content_type, length);
        let (bodies, pump) = tee(body, targets.len());

        let uploads = targets.into_iter().zip(bodies).map(|(client, body)| {
            let properties = properties.clone();
            async move {
                let result = if client.fits_single_put(length) {
                    client
                        .put(object_key, body, content_type, length.unwrap_or_default())
                        .await
                } else {
                    client.put_streaming(object_key, body, content_type).await
                };
                self.settle(&client, Method::Write, object_key, properties, timestamp, result)
                    .await
            }
        });

        let (outcomes, ()) = futures::join!(join_all(uploads), pump);
        let result = OperationResult {
            object_key: object_key.to_string(),
            outcomes,
        };
        log_result("write", &result);
        Ok(result)
    }

    /// Delete `object_key` from every target backend.
    #[instrument(skip(self), fields(key = %object_key))]
    pub async fn delete(
        &self,
        object_key: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<OperationResult> {
        let targets = self.targets().await?;
        let deletes = targets.into_iter().map(|client| async move {
            let result = client.delete(object_key).await;
            self.settle(
                &client,
                Method::Delete,
                object_key,
                Properties::new(),
                timestamp,
                result,
            )
            .await
        });

        let result = OperationResult {
            object_key: object_key.to_string(),
            outcomes: join_all(deletes).await,
        };
        log_result("delete", &result);
        Ok(result)
    }

    /// Record the outcome of one backend's part of a fan-out call.
    ///
    /// A backend only counts as successful once its record is in the log.
    async fn settle(
        &self,
        client: &BackendClient,
        method: Method,
        object_key: &str,
        properties: Properties,
        timestamp: DateTime<Utc>,
        result: Result<()>,
    ) -> BackendOutcome {
        let backend = client.name().clone();
        let result = match result {
            Ok(()) => {
                let record = OperationRecord::new(
                    method,
                    object_key,
                    properties.clone(),
                    backend.clone(),
                    timestamp,
                );
                self.log.append(&record).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => BackendOutcome {
                backend,
                outcome: Outcome::Successful,
            },
            Err(e) => {
                warn!(backend = %backend, key = %object_key, method = ?method, error = %e, "Backend operation failed");
                let failure =
                    FailureRecord::new(method, object_key, properties, backend.clone(), timestamp);
                if let Err(queue_err) = self.failures.push(&failure).await {
                    error!(backend = %backend, key = %object_key, error = %queue_err, "Failed to queue failure record");
                }
                BackendOutcome {
                    backend,
                    outcome: Outcome::Failed {
                        reason: e.to_string(),
                    },
                }
            }
        }
    }

    /// Open `object_key` on the backend holding its most recent operation.
    ///
    /// Fails with `NotFound` when the log has no record of the key or the
    /// latest operation deleted it. There is no fallback to other backends.
    pub async fn read(&self, object_key: &str) -> Result<ObjectRead> {
        let latest = self
            .log
            .source_of_truth(object_key)
            .await?
            .filter(|r| r.method == Method::Write)
            .ok_or_else(|| ReplicatorError::NotFound {
                key: object_key.to_string(),
            })?;
        let client = self
            .backends
            .get(&latest.backend)
            .ok_or_else(|| ReplicatorError::UnknownBackend {
                name: latest.backend.clone(),
            })?;
        let stream = client.get(object_key).await?;
        Ok(ObjectRead {
            backend: latest.backend,
            properties: latest.properties,
            stream,
        })
    }

    /// Last known state of `object_key` on every backend that has seen it.
    pub async fn status_of(&self, object_key: &str) -> Result<Vec<BackendStatus>> {
        let records = self.log.records_for(object_key).await?;
        if records.is_empty() {
            return Err(ReplicatorError::NotFound {
                key: object_key.to_string(),
            });
        }
        Ok(backend_statuses(&records))
    }

    /// Status of every object in the log, grouped by key.
    pub async fn status_all(&self) -> Result<Vec<ObjectStatus>> {
        let records = self.log.all().await?;
        Ok(object_statuses(&records))
    }

    pub async fn settings(&self) -> Result<ReplicationSettings> {
        self.settings.load_or_default().await
    }

    pub async fn enable(&self) -> Result<ReplicationSettings> {
        self.settings.enable().await
    }

    pub async fn disable(&self) -> Result<ReplicationSettings> {
        self.settings.disable().await
    }
}

fn log_result(operation: &str, result: &OperationResult) {
    let failed = result.failed();
    if failed.is_empty() {
        info!(key = %result.object_key, backends = result.outcomes.len(), "{operation} replicated");
    } else if result.is_successful() {
        warn!(key = %result.object_key, failed = ?failed, "{operation} partially replicated");
    } else {
        error!(key = %result.object_key, "{operation} failed on every backend");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::TryStreamExt;
    use replicator_core::storage::bytes_to_stream;
    use replicator_core::Existence;
    use replicator_storage::MemoryBackend;

    use crate::client::ClientTuning;

    struct Fixture {
        coordinator: ReplicationCoordinator,
        stores: Vec<Arc<MemoryBackend>>,
    }

    fn fixture(names: &[&str]) -> Fixture {
        let stores: Vec<Arc<MemoryBackend>> =
            names.iter().map(|_| Arc::new(MemoryBackend::new())).collect();
        let clients = names
            .iter()
            .zip(&stores)
            .map(|(name, store)| {
                Arc::new(BackendClient::new(
                    BackendName::new(*name),
                    Arc::clone(store) as Arc<dyn StorageBackend>,
                    ClientTuning::default(),
                ))
            })
            .collect();
        let backends = BackendSet::new(clients, &BackendName::new(names[0])).unwrap();
        Fixture {
            coordinator: ReplicationCoordinator::new(
                Arc::new(backends),
                Arc::new(MemoryBackend::new()),
            ),
            stores,
        }
    }

    async fn write(c: &ReplicationCoordinator, key: &str, body: &'static str) -> OperationResult {
        c.write(
            key,
            bytes_to_stream(Bytes::from(body), 2),
            "text/plain",
            Some(body.len() as u64),
            Utc::now(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_write_reaches_every_backend() {
        let f = fixture(&["one", "two"]);
        let result = write(&f.coordinator, "a.txt", "hello").await;
        assert!(result.is_successful());
        assert!(result.failed().is_empty());
        for store in &f.stores {
            assert_eq!(store.get("a.txt").await.unwrap(), Bytes::from("hello"));
            assert_eq!(store.content_type("a.txt").await.as_deref(), Some("text/plain"));
        }
        assert_eq!(f.coordinator.log().records_for("a.txt").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_read_returns_latest_copy() {
        let f = fixture(&["one", "two"]);
        write(&f.coordinator, "a.txt", "hello").await;
        let read = f.coordinator.read("a.txt").await.unwrap();
        assert_eq!(read.content_type(), Some("text/plain"));
        let chunks: Vec<Bytes> = read.stream.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_read_unknown_or_deleted_is_not_found() {
        let f = fixture(&["one"]);
        assert!(f.coordinator.read("nope").await.unwrap_err().is_not_found());
        assert!(f.coordinator.status_of("nope").await.unwrap_err().is_not_found());

        write(&f.coordinator, "a.txt", "hello").await;
        f.coordinator.delete("a.txt", Utc::now()).await.unwrap();
        assert!(f.coordinator.read("a.txt").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_status_after_delete() {
        let f = fixture(&["one", "two"]);
        write(&f.coordinator, "a.txt", "hello").await;
        let result = f.coordinator.delete("a.txt", Utc::now()).await.unwrap();
        assert!(result.is_successful());

        let statuses = f.coordinator.status_of("a.txt").await.unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.existence == Existence::Removed));
        assert!(!f.stores[1].exists("a.txt").await.unwrap());

        let all = f.coordinator.status_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].object_key, "a.txt");
    }

    #[tokio::test]
    async fn test_disabled_writes_primary_only() {
        let f = fixture(&["one", "two"]);
        f.coordinator.disable().await.unwrap();
        let result = write(&f.coordinator, "a.txt", "hello").await;
        assert_eq!(result.outcomes.len(), 1);
        assert_eq!(result.outcomes[0].backend.as_str(), "one");
        assert!(f.stores[0].exists("a.txt").await.unwrap());
        assert!(!f.stores[1].exists("a.txt").await.unwrap());
        assert!(f.coordinator.failures().is_empty().await.unwrap());

        f.coordinator.enable().await.unwrap();
        let result = write(&f.coordinator, "b.txt", "again").await;
        assert_eq!(result.outcomes.len(), 2);
    }

    #[tokio::test]
    async fn test_length_mismatch_fails_backend() {
        let f = fixture(&["one"]);
        let result = f
            .coordinator
            .write(
                "a.txt",
                bytes_to_stream(Bytes::from("hello"), 2),
                "text/plain",
                Some(3),
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(!result.is_successful());
        assert_eq!(f.coordinator.failures().len().await.unwrap(), 1);
    }
}
