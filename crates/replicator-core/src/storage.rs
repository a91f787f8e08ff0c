//! The StorageBackend trait: the single interface to a storage target.
//!
//! Every replica bucket and the shared state store are reached through this
//! trait. Implementations include `S3Backend` (any S3-compatible endpoint),
//! `LocalBackend` (filesystem) and `MemoryBackend` (in process). Replication
//! code never talks to an object store SDK directly.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};

use crate::Result;

/// A stream of object bytes, chunk by chunk.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Turn an in-memory body into a [`ByteStream`] of `chunk_size` pieces.
pub fn bytes_to_stream(data: Bytes, chunk_size: usize) -> ByteStream {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(data.len() / chunk_size + 1);
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + chunk_size).min(data.len());
        chunks.push(Ok(data.slice(offset..end)));
        offset = end;
    }
    stream::iter(chunks).boxed()
}

/// A part that finished uploading as part of a multipart session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based part number.
    pub part_number: u32,
    /// Opaque tag returned by the backend for this part.
    pub etag: String,
}

/// The unified storage interface.
///
/// Implementations must be `Send + Sync` for use across async tasks.
///
/// # Multipart uploads
///
/// [`create_multipart`](StorageBackend::create_multipart),
/// [`put_part`](StorageBackend::put_part) and
/// [`complete_multipart`](StorageBackend::complete_multipart) are the raw
/// chunked-upload primitives. Parts may be uploaded concurrently and in any
/// order; `complete_multipart` receives them sorted by part number.
///
/// # Conditional Writes
///
/// [`put_if_not_exists`](StorageBackend::put_if_not_exists) is the only
/// serialisation primitive the replicator needs; the reconciliation lease
/// lock is built on it.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Write an object. Overwrites if it already exists.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Write an object with a content type. Backends without object
    /// metadata ignore the content type.
    async fn put_with_content_type(&self, key: &str, data: Bytes, content_type: &str) -> Result<()> {
        let _ = content_type;
        self.put(key, data).await
    }

    /// Read an object. Returns [`ReplicatorError::NotFound`](crate::ReplicatorError::NotFound)
    /// if the key does not exist.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Read an object as a stream of chunks.
    async fn get_stream(&self, key: &str) -> Result<ByteStream> {
        let data = self.get(key).await?;
        Ok(stream::once(async move { Ok(data) }).boxed())
    }

    /// List all object keys matching the given prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete an object. Does not error if the key does not exist.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Conditional write: succeeds only if the key does not already exist.
    ///
    /// Returns `Ok(true)` if the key was created, `Ok(false)` if it already
    /// existed (no write performed).
    async fn put_if_not_exists(&self, key: &str, data: Bytes) -> Result<bool>;

    /// Check if an object exists at the given key.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Open a multipart upload session and return its upload id.
    async fn create_multipart(&self, key: &str, content_type: &str) -> Result<String>;

    /// Upload one part of an open session. Returns the part's tag.
    async fn put_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String>;

    /// Finalise a session from its parts, given in ascending part order.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()>;

    /// Discard an open session and any parts it holds.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()>;
}
