//! S3-compatible object storage backend.
//!
//! [`S3Backend`] implements the [`StorageBackend`] trait using the `object_store`
//! crate, supporting any S3-compatible endpoint: AWS S3, MinIO, Ceph, etc.
//! Multipart sessions go through `object_store`'s [`MultipartStore`] so part
//! numbers and tags stay under the caller's control.
//!
//! Conditional writes use `put_opts` with `Create` mode, which maps to the
//! `If-None-Match: *` HTTP header.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::multipart::{MultipartStore, PartId};
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, Attributes, ClientOptions, ObjectStore, PutMode, PutOptions, PutPayload,
};
use tracing::{debug, instrument};

use replicator_core::config::BackendIdentity;
use replicator_core::error::ReplicatorError;
use replicator_core::storage::{ByteStream, CompletedPart, StorageBackend};
use replicator_core::Result;

/// Connection tuning shared by every S3 client a node opens.
#[derive(Debug, Clone)]
pub struct S3Options {
    /// Bound on establishing a connection.
    pub connect_timeout: Duration,
    /// Bound on a whole HTTP request.
    pub request_timeout: Duration,
    /// Idle connections kept per host.
    pub pool_max_idle_per_host: usize,
}

impl S3Options {
    fn client_options(&self) -> ClientOptions {
        ClientOptions::new()
            .with_connect_timeout(self.connect_timeout)
            .with_timeout(self.request_timeout)
            .with_pool_max_idle_per_host(self.pool_max_idle_per_host)
    }
}

/// A [`StorageBackend`] backed by any S3-compatible object storage.
///
/// Uses the `object_store` crate for S3 operations with built-in retry
/// logic and connection pooling. The connection pool is private to this
/// backend.
pub struct S3Backend {
    store: Arc<AmazonS3>,
    prefix: String,
}

impl S3Backend {
    /// Create a new `S3Backend` from an S3 URI.
    ///
    /// # URI Format
    ///
    /// `s3://bucket/prefix?region=us-east-1&endpoint=http://minio:9000`
    ///
    /// Environment variables `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
    /// and `AWS_REGION` are used as fallbacks for credentials and region.
    pub fn new(uri: &str) -> Result<Self> {
        let (bucket, prefix) = parse_s3_uri(uri)?;

        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&bucket);

        if let Some(region) = extract_query_param(uri, "region") {
            builder = builder.with_region(&region);
        }

        // Custom endpoint for MinIO / other S3-compatible services
        if let Some(endpoint) = extract_query_param(uri, "endpoint") {
            builder = builder.with_endpoint(&endpoint).with_allow_http(true);
        }

        let store = builder.build().map_err(|e| {
            ReplicatorError::storage(format!("Failed to create S3 client for {uri}"), e)
        })?;

        debug!(bucket = %bucket, prefix = %prefix, "S3Backend initialised");

        Ok(Self {
            store: Arc::new(store),
            prefix,
        })
    }

    /// Create a new `S3Backend` for a configured replica target.
    pub fn from_identity(identity: &BackendIdentity, options: &S3Options) -> Result<Self> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&identity.bucket)
            .with_endpoint(&identity.endpoint)
            .with_allow_http(identity.endpoint.starts_with("http://"))
            .with_region(identity.region.as_deref().unwrap_or("us-east-1"))
            .with_client_options(options.client_options());

        if let Some(credentials) = &identity.credentials {
            builder = builder
                .with_access_key_id(&credentials.access_key_id)
                .with_secret_access_key(&credentials.secret_access_key);
        }

        let store = builder.build().map_err(|e| {
            ReplicatorError::storage(
                format!("Failed to create S3 client for backend {}", identity.name),
                e,
            )
        })?;

        debug!(
            backend = %identity.name,
            endpoint = %identity.endpoint,
            bucket = %identity.bucket,
            "S3Backend initialised"
        );

        Ok(Self {
            store: Arc::new(store),
            prefix: String::new(),
        })
    }

    /// Build the full object path from a key.
    fn full_path(&self, key: &str) -> ObjectPath {
        if self.prefix.is_empty() {
            ObjectPath::from(key)
        } else {
            ObjectPath::from(format!("{}/{}", self.prefix, key))
        }
    }
}

fn map_not_found(key: &str, op: &str, e: object_store::Error) -> ReplicatorError {
    match e {
        object_store::Error::NotFound { .. } => ReplicatorError::NotFound {
            key: key.to_string(),
        },
        other => ReplicatorError::storage(format!("S3 {op} failed for {key}"), other),
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    #[instrument(skip(self, data), fields(key = %key, size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.full_path(key);
        self.store
            .put(&path, PutPayload::from(data))
            .await
            .map_err(|e| ReplicatorError::storage(format!("S3 put failed for {key}"), e))?;
        Ok(())
    }

    #[instrument(skip(self, data), fields(key = %key, size = data.len()))]
    async fn put_with_content_type(&self, key: &str, data: Bytes, content_type: &str) -> Result<()> {
        let path = self.full_path(key);
        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, content_type.to_string().into());
        let opts = PutOptions {
            attributes,
            ..Default::default()
        };
        self.store
            .put_opts(&path, PutPayload::from(data), opts)
            .await
            .map_err(|e| ReplicatorError::storage(format!("S3 put failed for {key}"), e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.full_path(key);
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| map_not_found(key, "get", e))?;
        let bytes = result
            .bytes()
            .await
            .map_err(|e| ReplicatorError::storage(format!("S3 get bytes failed for {key}"), e))?;
        Ok(bytes)
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get_stream(&self, key: &str) -> Result<ByteStream> {
        let path = self.full_path(key);
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| map_not_found(key, "get", e))?;
        let key = key.to_string();
        Ok(result
            .into_stream()
            .map_err(move |e| {
                ReplicatorError::storage(format!("S3 get stream failed for {key}"), e)
            })
            .boxed())
    }

    #[instrument(skip(self), fields(prefix = %prefix))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = if self.prefix.is_empty() {
            ObjectPath::from(prefix)
        } else {
            ObjectPath::from(format!("{}/{}", self.prefix, prefix))
        };

        let mut results = Vec::new();
        let mut stream = self.store.list(Some(&full_prefix));

        while let Some(meta) = stream.try_next().await.map_err(|e| {
            ReplicatorError::storage(format!("S3 list failed for prefix {prefix}"), e)
        })? {
            let full_key = meta.location.to_string();
            // Keys are reported relative to the backend prefix
            let key = if self.prefix.is_empty() {
                full_key
            } else {
                full_key
                    .strip_prefix(&format!("{}/", self.prefix))
                    .unwrap_or(&full_key)
                    .to_string()
            };
            results.push(key);
        }

        results.sort();
        Ok(results)
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.full_path(key);
        // S3 delete is idempotent, a missing key is not an error
        self.store
            .delete(&path)
            .await
            .map_err(|e| ReplicatorError::storage(format!("S3 delete failed for {key}"), e))?;
        Ok(())
    }

    #[instrument(skip(self, data), fields(key = %key, size = data.len()))]
    async fn put_if_not_exists(&self, key: &str, data: Bytes) -> Result<bool> {
        let path = self.full_path(key);
        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        match self
            .store
            .put_opts(&path, PutPayload::from(data), opts)
            .await
        {
            Ok(_) => Ok(true),
            Err(object_store::Error::AlreadyExists { .. }) => Ok(false),
            // Some S3-compatible stores return Precondition instead of AlreadyExists
            Err(object_store::Error::Precondition { .. }) => Ok(false),
            Err(e) => Err(ReplicatorError::storage(
                format!("S3 conditional put failed for {key}"),
                e,
            )),
        }
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.full_path(key);
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(ReplicatorError::storage(
                format!("S3 head failed for {key}"),
                e,
            )),
        }
    }

    // The content type of multipart objects is kept in the operation log;
    // `MultipartStore` sessions carry no object attributes.
    #[instrument(skip(self), fields(key = %key))]
    async fn create_multipart(&self, key: &str, _content_type: &str) -> Result<String> {
        let path = self.full_path(key);
        let upload_id = self.store.create_multipart(&path).await.map_err(|e| {
            ReplicatorError::storage(format!("S3 create multipart failed for {key}"), e)
        })?;
        Ok(upload_id)
    }

    #[instrument(skip(self, data), fields(key = %key, part = part_number, size = data.len()))]
    async fn put_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        let path = self.full_path(key);
        // object_store numbers parts from zero
        let part_idx = part_number.checked_sub(1).ok_or_else(|| ReplicatorError::Internal {
            message: format!("Part numbers start at 1, got {part_number}"),
        })? as usize;
        let part = self
            .store
            .put_part(
                &path,
                &upload_id.to_string(),
                part_idx,
                PutPayload::from(data),
            )
            .await
            .map_err(|e| {
                ReplicatorError::storage(
                    format!("S3 upload part {part_number} failed for {key}"),
                    e,
                )
            })?;
        Ok(part.content_id)
    }

    #[instrument(skip(self, parts), fields(key = %key, parts = parts.len()))]
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()> {
        let path = self.full_path(key);
        let parts = parts
            .into_iter()
            .map(|p| PartId { content_id: p.etag })
            .collect();
        self.store
            .complete_multipart(&path, &upload_id.to_string(), parts)
            .await
            .map_err(|e| {
                ReplicatorError::storage(format!("S3 complete multipart failed for {key}"), e)
            })?;
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        let path = self.full_path(key);
        self.store
            .abort_multipart(&path, &upload_id.to_string())
            .await
            .map_err(|e| {
                ReplicatorError::storage(format!("S3 abort multipart failed for {key}"), e)
            })
    }
}

/// Parse an S3 URI into (bucket, prefix).
///
/// `s3://bucket/prefix/path` → `("bucket", "prefix/path")`
/// `s3://bucket` → `("bucket", "")`
fn parse_s3_uri(uri: &str) -> Result<(String, String)> {
    let stripped = uri
        .strip_prefix("s3://")
        .ok_or_else(|| ReplicatorError::config(format!("S3 URI must start with 's3://': {uri}")))?;

    // Remove query string before parsing path
    let path_part = stripped.split('?').next().unwrap_or(stripped);

    let mut parts = path_part.splitn(2, '/');
    let bucket = parts.next().unwrap_or("").to_string();
    let prefix = parts.next().unwrap_or("").trim_end_matches('/').to_string();

    if bucket.is_empty() {
        return Err(ReplicatorError::config(format!(
            "S3 URI must include a bucket name: {uri}"
        )));
    }

    Ok((bucket, prefix))
}

/// Extract a query parameter value from a URI.
fn extract_query_param(uri: &str, param: &str) -> Option<String> {
    let query = uri.split('?').nth(1)?;
    for pair in query.split('&') {
        let mut kv = pair.splitn(2, '=');
        if kv.next()? == param {
            return kv.next().map(|v| v.to_string());
        }
    }
    None
}
