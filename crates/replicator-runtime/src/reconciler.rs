//! The reconciliation loop: draining the failure queue.
//!
//! Each pass takes a cluster-wide lease, snapshots the failure queue and,
//! for every failure that is still relevant, copies the object's latest
//! state from its source-of-truth backend to the backend that missed it.
//! Repairs run as independent tasks; a failed repair leaves its failure
//! record in place for the next pass.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use replicator_core::{
    dedup_failures, latest_per_backend, source_of_truth, FailureRecord, Method, NodeId,
    OperationRecord, Properties, ReplicationStatus, ReplicatorError, Result, StorageBackend,
};
use replicator_storage::{FailureQueue, LeaseLock, OperationLog, SettingsStore};

use crate::backends::BackendSet;
use crate::client::BackendClient;

/// Name of the lease guarding reconciliation passes.
pub const RECONCILE_LOCK: &str = "reconciliation";

/// What one pass did.
#[derive(Debug, Default)]
pub struct PassReport {
    /// The lease was held by another instance; nothing was done.
    pub skipped: bool,
    /// Distinct failures considered after deduplication.
    pub considered: usize,
    /// Failures removed without a repair: the object is gone from the log
    /// or the failed backend already holds the latest copy.
    pub dropped: usize,
    /// Failures left for a later pass (unknown backend, unreadable log).
    pub deferred: usize,
    /// Repair tasks started by this pass.
    pub repairs: Vec<JoinHandle<Result<()>>>,
}

impl PassReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn dispatched(&self) -> usize {
        self.repairs.len()
    }

    /// Wait for every repair started by the pass.
    pub async fn wait(self) -> Vec<Result<()>> {
        let mut results = Vec::with_capacity(self.repairs.len());
        for handle in self.repairs {
            results.push(handle.await.unwrap_or_else(|e| {
                Err(ReplicatorError::Internal {
                    message: format!("Repair task failed: {e}"),
                })
            }));
        }
        results
    }
}

/// Runs reconciliation passes.
pub struct Reconciler {
    backends: Arc<BackendSet>,
    log: OperationLog,
    failures: FailureQueue,
    settings: SettingsStore,
    lock: LeaseLock,
    node_id: NodeId,
    lock_ttl: Duration,
}

impl Reconciler {
    pub fn new(
        backends: Arc<BackendSet>,
        state: Arc<dyn StorageBackend>,
        node_id: NodeId,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            backends,
            log: OperationLog::new(Arc::clone(&state)),
            failures: FailureQueue::new(Arc::clone(&state)),
            settings: SettingsStore::new(Arc::clone(&state)),
            lock: LeaseLock::new(state),
            node_id,
            lock_ttl,
        }
    }

    /// Run one pass. Returns once every repair is dispatched, not finished.
    pub async fn run_once(&self) -> Result<PassReport> {
        let Some(lease) = self
            .lock
            .try_acquire(RECONCILE_LOCK, &self.node_id, self.lock_ttl)
            .await?
        else {
            debug!("Reconciliation lease held elsewhere; skipping pass");
            return Ok(PassReport::skipped());
        };

        let mut report = PassReport::default();
        let result = self.process(&mut report).await;

        if let Err(e) = self.lock.release(&lease).await {
            warn!(error = %e, "Failed to release reconciliation lease");
        }
        result.map(|()| report)
    }

    async fn process(&self, report: &mut PassReport) -> Result<()> {
        let failures = dedup_failures(self.failures.all().await?);
        report.considered = failures.len();
        if failures.is_empty() {
            return Ok(());
        }

        let settings = self.settings.load_or_default().await?;
        let track_status = settings.status != ReplicationStatus::Disabled;
        if track_status {
            self.settings
                .set_status(ReplicationStatus::BackgroundWork)
                .await?;
        }

        info!(failures = failures.len(), "Reconciliation pass started");
        for failure in failures {
            self.handle(failure, report).await;
        }

        if track_status {
            self.settings.set_status(ReplicationStatus::Active).await?;
        }
        info!(
            dispatched = report.dispatched(),
            dropped = report.dropped,
            deferred = report.deferred,
            "Reconciliation pass dispatched"
        );
        Ok(())
    }

    async fn handle(&self, failure: FailureRecord, report: &mut PassReport) {
        let records = match self.log.records_for(&failure.object_key).await {
            Ok(records) => records,
            Err(e) => {
                warn!(key = %failure.object_key, error = %e, "Cannot read log; deferring repair");
                report.deferred += 1;
                return;
            }
        };

        // The failed backend is current once its latest record is as recent
        // as the source of truth
        let current = latest_per_backend(&records)
            .into_iter()
            .find(|r| r.backend == failure.backend)
            .map(|r| r.timestamp);
        let source = match source_of_truth(&records) {
            Some(source) if current.map_or(true, |at| at < source.timestamp) => source.clone(),
            moot => {
                debug!(
                    key = %failure.object_key,
                    backend = %failure.backend,
                    in_log = moot.is_some(),
                    "Dropping moot failure"
                );
                match self.failures.remove(&failure.id).await {
                    Ok(()) => report.dropped += 1,
                    Err(e) => {
                        warn!(id = %failure.id, error = %e, "Failed to remove failure record");
                        report.deferred += 1;
                    }
                }
                return;
            }
        };

        let (Some(producer), Some(consumer)) = (
            self.backends.get(&source.backend),
            self.backends.get(&failure.backend),
        ) else {
            warn!(
                key = %failure.object_key,
                producer = %source.backend,
                consumer = %failure.backend,
                "Backend not configured; leaving failure for a later pass"
            );
            report.deferred += 1;
            return;
        };

        let repair = Repair {
            producer: Arc::clone(producer),
            consumer: Arc::clone(consumer),
            source,
            failure,
            log: self.log.clone(),
            failures: self.failures.clone(),
        };
        report.repairs.push(tokio::spawn(repair.run()));
    }

    /// Run passes every `interval` until `cancel` turns true.
    pub async fn run(&self, interval: Duration, cancel: watch::Receiver<bool>) {
        info!(node_id = %self.node_id, interval_ms = interval.as_millis() as u64, "Reconciler started");
        loop {
            // Repairs outlive the pass; their handles are not awaited here
            if let Err(e) = self.run_once().await {
                warn!(error = %e, "Reconciliation pass failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wait_for_cancel(&cancel) => {
                    debug!(node_id = %self.node_id, "Reconciler stopping");
                    break;
                }
            }
        }
    }
}

/// Copies one object's latest state onto the backend that missed it.
struct Repair {
    producer: Arc<BackendClient>,
    consumer: Arc<BackendClient>,
    source: OperationRecord,
    failure: FailureRecord,
    log: OperationLog,
    failures: FailureQueue,
}

impl Repair {
    async fn run(self) -> Result<()> {
        let key = self.failure.object_key.clone();
        let consumer = self.consumer.name().clone();
        let result = self.apply().await;
        match &result {
            Ok(()) => info!(key = %key, backend = %consumer, "Repaired"),
            Err(e) => warn!(key = %key, backend = %consumer, error = %e, "Repair failed; will retry"),
        }
        result
    }

    async fn apply(&self) -> Result<()> {
        let key = &self.failure.object_key;
        let properties = match self.source.method {
            Method::Write => {
                let body = self.producer.get(key).await?;
                let content_type = self
                    .source
                    .content_type()
                    .unwrap_or(replicator_core::DEFAULT_CONTENT_TYPE);
                let length = self.source.content_length();
                if self.consumer.fits_single_put(length) {
                    self.consumer
                        .put(key, body, content_type, length.unwrap_or_default())
                        .await?;
                } else {
                    self.consumer.put_streaming(key, body, content_type).await?;
                }
                self.source.properties.clone()
            }
            Method::Delete => {
                self.consumer.delete(key).await?;
                Properties::new()
            }
        };

        // Stamped with the copied operation's time: an operation acknowledged
        // while the repair ran stays newer than the repair
        let record = OperationRecord::new(
            self.source.method,
            key.as_str(),
            properties,
            self.consumer.name().clone(),
            self.source.timestamp,
        );
        self.log.append(&record).await?;
        self.failures.remove(&self.failure.id).await
    }
}

/// Wait until the watch channel signals `true` (cancellation).
async fn wait_for_cancel(rx: &watch::Receiver<bool>) {
    let mut rx = rx.clone();
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender dropped, treat as cancel
            return;
        }
    }
}
