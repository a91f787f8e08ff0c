//! Common test utilities for replicator-runtime integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;

use replicator_core::storage::bytes_to_stream;
use replicator_core::{
    BackendIdentity, BackendName, ByteStream, CompletedPart, NodeConfig, ReplicatorError, Result,
    StorageBackend,
};
use replicator_runtime::{BackendClient, BackendSet, ClientTuning, ReplicatorNode};
use replicator_storage::MemoryBackend;

/// A [`MemoryBackend`] with switchable faults, latency and a record of the
/// multipart calls it served.
#[derive(Default)]
pub struct TestBackend {
    inner: MemoryBackend,
    down: AtomicBool,
    parts_fail: AtomicBool,
    delay_ms: AtomicU64,
    parts: Mutex<Vec<(u32, usize)>>,
    completions: Mutex<Vec<Vec<u32>>>,
    writes: Mutex<Vec<(String, Bytes)>>,
}

impl TestBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail until `set_down(false)`.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Make part uploads fail while other calls succeed.
    pub fn set_parts_fail(&self, fail: bool) {
        self.parts_fail.store(fail, Ordering::SeqCst);
    }

    /// Delay every call by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// `(part_number, size)` of every uploaded part, in arrival order.
    pub fn uploaded_parts(&self) -> Vec<(u32, usize)> {
        self.parts.lock().unwrap().clone()
    }

    /// Part numbers passed to each `complete_multipart` call.
    pub fn completions(&self) -> Vec<Vec<u32>> {
        self.completions.lock().unwrap().clone()
    }

    /// `(key, data)` of every `put` and successful `put_if_not_exists`, in
    /// order.
    pub fn writes(&self) -> Vec<(String, Bytes)> {
        self.writes.lock().unwrap().clone()
    }

    fn record_write(&self, key: &str, data: &Bytes) {
        self.writes
            .lock()
            .unwrap()
            .push((key.to_string(), data.clone()));
    }

    pub fn memory(&self) -> &MemoryBackend {
        &self.inner
    }

    async fn gate(&self, operation: &str) -> Result<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(ReplicatorError::storage_msg(format!(
                "injected failure: {operation}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for TestBackend {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.gate("put").await?;
        self.record_write(key, &data);
        self.inner.put(key, data).await
    }

    async fn put_with_content_type(&self, key: &str, data: Bytes, content_type: &str) -> Result<()> {
        self.gate("put").await?;
        self.record_write(key, &data);
        self.inner.put_with_content_type(key, data, content_type).await
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.gate("get").await?;
        self.inner.get(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.gate("list").await?;
        self.inner.list(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.gate("delete").await?;
        self.inner.delete(key).await
    }

    async fn put_if_not_exists(&self, key: &str, data: Bytes) -> Result<bool> {
        self.gate("put_if_not_exists").await?;
        let created = self.inner.put_if_not_exists(key, data.clone()).await?;
        if created {
            self.record_write(key, &data);
        }
        Ok(created)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.gate("exists").await?;
        self.inner.exists(key).await
    }

    async fn create_multipart(&self, key: &str, content_type: &str) -> Result<String> {
        self.gate("create_multipart").await?;
        self.inner.create_multipart(key, content_type).await
    }

    async fn put_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        self.gate("put_part").await?;
        if self.parts_fail.load(Ordering::SeqCst) {
            return Err(ReplicatorError::storage_msg("injected part failure"));
        }
        self.parts.lock().unwrap().push((part_number, data.len()));
        self.inner.put_part(key, upload_id, part_number, data).await
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()> {
        self.gate("complete_multipart").await?;
        self.completions
            .lock()
            .unwrap()
            .push(parts.iter().map(|p| p.part_number).collect());
        self.inner.complete_multipart(key, upload_id, parts).await
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        // Aborts always go through so cleanup can be observed
        self.inner.abort_multipart(key, upload_id).await
    }
}

/// A node over in-memory test backends and a recording state store.
pub struct Cluster {
    pub node: ReplicatorNode,
    pub backends: Vec<Arc<TestBackend>>,
    pub state: Arc<TestBackend>,
    pub set: Arc<BackendSet>,
}

impl Cluster {
    pub fn backend(&self, name: &str) -> &Arc<TestBackend> {
        let idx = self
            .node
            .config
            .backends
            .iter()
            .position(|b| b.name.as_str() == name)
            .expect("backend is configured");
        &self.backends[idx]
    }
}

pub fn tuning() -> ClientTuning {
    ClientTuning {
        request_timeout: Duration::from_secs(5),
        ..ClientTuning::default()
    }
}

/// A node with one test backend per name; the first is the primary.
pub fn cluster(names: &[&str]) -> Cluster {
    cluster_with(names, tuning())
}

/// One test backend per name behind a backend set; the first is the primary.
pub fn backend_set(names: &[&str], tuning: ClientTuning) -> (Vec<Arc<TestBackend>>, Arc<BackendSet>) {
    let backends: Vec<Arc<TestBackend>> = names.iter().map(|_| Arc::new(TestBackend::new())).collect();
    let clients = names
        .iter()
        .zip(&backends)
        .map(|(name, backend)| {
            Arc::new(BackendClient::new(
                BackendName::new(*name),
                Arc::clone(backend) as Arc<dyn StorageBackend>,
                tuning,
            ))
        })
        .collect();
    let set = Arc::new(
        BackendSet::new(clients, &BackendName::new(names[0])).expect("valid backend set"),
    );
    (backends, set)
}

pub fn cluster_with(names: &[&str], tuning: ClientTuning) -> Cluster {
    let (backends, set) = backend_set(names, tuning);

    let mut config = NodeConfig::new(
        "memory://",
        names.iter().map(|n| BackendIdentity::memory(*n)).collect(),
    );
    config.part_size = tuning.part_size;
    config.request_timeout = tuning.request_timeout;

    let state = Arc::new(TestBackend::new());
    let node = ReplicatorNode::assemble(config, state.clone(), Arc::clone(&set));
    Cluster {
        node,
        backends,
        state,
        set,
    }
}

pub fn body(data: impl Into<Bytes>, chunk_size: usize) -> ByteStream {
    bytes_to_stream(data.into(), chunk_size)
}

pub async fn read_all(stream: ByteStream) -> Bytes {
    let chunks: Vec<Bytes> = stream.try_collect().await.expect("stream reads fully");
    Bytes::from(chunks.concat())
}
