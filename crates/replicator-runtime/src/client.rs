//! One configured storage target and the upload paths used against it.
//!
//! [`BackendClient`] wraps a [`StorageBackend`] with the replicator's
//! per-call time bound and the streaming multipart upload: the body is
//! buffered until a part threshold is reached, each full buffer is uploaded
//! as a numbered part while reading continues, and the session is finalised
//! with the parts in ascending order.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use replicator_core::{
    BackendName, ByteStream, CompletedPart, NodeConfig, ReplicatorError, Result, StorageBackend,
};

/// Upload tuning shared by every client of a node.
#[derive(Debug, Clone, Copy)]
pub struct ClientTuning {
    /// Buffered bytes that trigger a part flush.
    pub part_size: usize,
    /// Part uploads one streaming upload keeps in flight before it stops
    /// reading the body.
    pub max_parts_in_flight: usize,
    /// Bound on every remote call.
    pub request_timeout: Duration,
}

impl ClientTuning {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            part_size: config.part_size,
            max_parts_in_flight: config.max_parts_in_flight,
            request_timeout: config.request_timeout,
        }
    }
}

impl Default for ClientTuning {
    fn default() -> Self {
        Self {
            part_size: replicator_core::config::DEFAULT_PART_SIZE,
            max_parts_in_flight: replicator_core::config::DEFAULT_MAX_PARTS_IN_FLIGHT,
            request_timeout: replicator_core::config::DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Client for one named backend.
pub struct BackendClient {
    name: BackendName,
    storage: Arc<dyn StorageBackend>,
    tuning: ClientTuning,
}

impl std::fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendClient")
            .field("name", &self.name)
            .field("tuning", &self.tuning)
            .finish()
    }
}

impl BackendClient {
    pub fn new(name: BackendName, storage: Arc<dyn StorageBackend>, tuning: ClientTuning) -> Self {
        Self {
            name,
            storage,
            tuning,
        }
    }

    pub fn name(&self) -> &BackendName {
        &self.name
    }

    pub fn part_size(&self) -> usize {
        self.tuning.part_size
    }

    /// Whether a body of `length` bytes goes up in one request.
    pub fn fits_single_put(&self, length: Option<u64>) -> bool {
        matches!(length, Some(len) if len <= self.tuning.part_size as u64)
    }

    /// Single-shot upload of a body whose length is known up front.
    ///
    /// The body is read fully before the request is sent; a body that does
    /// not match `length` is rejected without writing.
    #[instrument(skip(self, body), fields(backend = %self.name, key = %key))]
    pub async fn put(
        &self,
        key: &str,
        body: ByteStream,
        content_type: &str,
        length: u64,
    ) -> Result<()> {
        let data = collect_body(body).await?;
        if data.len() as u64 != length {
            return Err(ReplicatorError::LengthMismatch {
                key: key.to_string(),
                declared: length,
                received: data.len() as u64,
            });
        }
        self.bounded(
            "put",
            key,
            self.storage.put_with_content_type(key, data, content_type),
        )
        .await?;
        debug!("Uploaded in a single request");
        Ok(())
    }

    /// Multipart upload of a body of unknown or large size.
    ///
    /// On any failure the session is aborted best-effort and the error
    /// returned; no partial object is left behind.
    #[instrument(skip(self, body), fields(backend = %self.name, key = %key))]
    pub async fn put_streaming(
        &self,
        key: &str,
        body: ByteStream,
        content_type: &str,
    ) -> Result<()> {
        let upload_id = self
            .bounded(
                "create multipart upload",
                key,
                self.storage.create_multipart(key, content_type),
            )
            .await?;
        let mut session = UploadSession::new(key, content_type, upload_id);

        let result = match self.upload_parts(&mut session, body).await {
            Ok(()) => {
                self.bounded(
                    "complete multipart upload",
                    key,
                    self.storage.complete_multipart(
                        key,
                        &session.upload_id,
                        session.parts_in_order(),
                    ),
                )
                .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                debug!(
                    parts = session.completed_parts.len(),
                    content_type = %session.content_type,
                    "Completed multipart upload"
                );
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self
                    .bounded(
                        "abort multipart upload",
                        key,
                        self.storage.abort_multipart(key, &session.upload_id),
                    )
                    .await
                {
                    warn!(error = %abort_err, upload_id = %session.upload_id, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    /// Read the body, flushing a part every time the buffer reaches the
    /// part threshold. At most `max_parts_in_flight` parts upload at once;
    /// reading stops while the pipeline is full.
    async fn upload_parts(&self, session: &mut UploadSession, mut body: ByteStream) -> Result<()> {
        let mut in_flight: JoinSet<Result<(u32, String)>> = JoinSet::new();

        while let Some(chunk) = body.next().await {
            session.buffer(chunk?);
            if session.buffered_bytes() >= self.tuning.part_size {
                while in_flight.len() >= self.tuning.max_parts_in_flight.max(1) {
                    self.settle_one(session, &mut in_flight).await?;
                }
                let (part_number, data) = session.take_part();
                self.spawn_part(&mut in_flight, session, part_number, data);
            }
        }

        // Remainder, or the single empty part of an empty body
        if session.buffered_bytes() > 0 || session.part_counter == 0 {
            let (part_number, data) = session.take_part();
            self.spawn_part(&mut in_flight, session, part_number, data);
        }

        while !in_flight.is_empty() {
            self.settle_one(session, &mut in_flight).await?;
        }
        Ok(())
    }

    fn spawn_part(
        &self,
        in_flight: &mut JoinSet<Result<(u32, String)>>,
        session: &UploadSession,
        part_number: u32,
        data: Bytes,
    ) {
        let storage = Arc::clone(&self.storage);
        let key = session.object_key.clone();
        let upload_id = session.upload_id.clone();
        let after = self.tuning.request_timeout;
        let operation = format!("upload part {part_number} of {key} on {}", self.name);
        debug!(part_number, size = data.len(), "Uploading part");
        in_flight.spawn(async move {
            let etag = bounded(
                after,
                operation,
                storage.put_part(&key, &upload_id, part_number, data),
            )
            .await?;
            Ok((part_number, etag))
        });
    }

    async fn settle_one(
        &self,
        session: &mut UploadSession,
        in_flight: &mut JoinSet<Result<(u32, String)>>,
    ) -> Result<()> {
        match in_flight.join_next().await {
            Some(Ok(Ok((part_number, etag)))) => {
                session.complete_part(part_number, etag);
                Ok(())
            }
            Some(Ok(Err(e))) => Err(e),
            Some(Err(e)) => Err(ReplicatorError::Internal {
                message: format!("Part upload task failed: {e}"),
            }),
            None => Ok(()),
        }
    }

    /// Stream an object's bytes. Each chunk is subject to the call bound.
    #[instrument(skip(self), fields(backend = %self.name, key = %key))]
    pub async fn get(&self, key: &str) -> Result<ByteStream> {
        let stream = self.bounded("get", key, self.storage.get_stream(key)).await?;
        Ok(bounded_stream(
            stream,
            self.tuning.request_timeout,
            format!("read {key} from {}", self.name),
        ))
    }

    #[instrument(skip(self), fields(backend = %self.name, key = %key))]
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.bounded("delete", key, self.storage.delete(key)).await
    }

    /// Every object key in the backend.
    pub async fn list(&self) -> Result<Vec<String>> {
        self.bounded("list", "", self.storage.list("")).await
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        key: &str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        bounded(
            self.tuning.request_timeout,
            format!("{operation} {key} on {}", self.name),
            fut,
        )
        .await
    }
}

/// Per-upload state of a streaming upload. Lives only for one call.
#[derive(Debug)]
struct UploadSession {
    content_type: String,
    object_key: String,
    upload_id: String,
    part_counter: u32,
    pending: BytesMut,
    completed_parts: BTreeMap<u32, String>,
}

impl UploadSession {
    fn new(object_key: &str, content_type: &str, upload_id: String) -> Self {
        Self {
            content_type: content_type.to_string(),
            object_key: object_key.to_string(),
            upload_id,
            part_counter: 0,
            pending: BytesMut::new(),
            completed_parts: BTreeMap::new(),
        }
    }

    fn buffered_bytes(&self) -> usize {
        self.pending.len()
    }

    fn buffer(&mut self, chunk: Bytes) {
        self.pending.extend_from_slice(&chunk);
    }

    /// Take the buffer as the next part, numbered from 1.
    fn take_part(&mut self) -> (u32, Bytes) {
        self.part_counter += 1;
        (self.part_counter, self.pending.split().freeze())
    }

    fn complete_part(&mut self, part_number: u32, etag: String) {
        self.completed_parts.insert(part_number, etag);
    }

    fn parts_in_order(&self) -> Vec<CompletedPart> {
        self.completed_parts
            .iter()
            .map(|(&part_number, etag)| CompletedPart {
                part_number,
                etag: etag.clone(),
            })
            .collect()
    }
}

async fn collect_body(mut body: ByteStream) -> Result<Bytes> {
    let mut data = BytesMut::new();
    while let Some(chunk) = body.next().await {
        data.extend_from_slice(&chunk?);
    }
    Ok(data.freeze())
}

/// Run `fut`, failing with [`ReplicatorError::Timeout`] after `after`.
pub(crate) async fn bounded<T>(
    after: Duration,
    operation: String,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(ReplicatorError::Timeout { operation, after }),
    }
}

/// Apply the call bound to every chunk of a stream. The stream ends after
/// the first timeout.
fn bounded_stream(stream: ByteStream, after: Duration, operation: String) -> ByteStream {
    stream::unfold(Some(stream), move |state| {
        let operation = operation.clone();
        async move {
            let mut stream = state?;
            match tokio::time::timeout(after, stream.next()).await {
                Ok(Some(item)) => Some((item, Some(stream))),
                Ok(None) => None,
                Err(_) => Some((Err(ReplicatorError::Timeout { operation, after }), None)),
            }
        }
    })
    .boxed()
}
