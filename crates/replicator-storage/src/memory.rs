//! In-process storage backend.
//!
//! [`MemoryBackend`] keeps objects in a map behind a tokio `RwLock`. It is
//! used for the `memory://` endpoint scheme and throughout the test suites.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

use replicator_core::error::ReplicatorError;
use replicator_core::storage::{CompletedPart, StorageBackend};
use replicator_core::Result;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: Option<String>,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    content_type: String,
    parts: HashMap<u32, (String, Bytes)>,
}

/// A [`StorageBackend`] holding everything in memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    uploads: RwLock<HashMap<String, PendingUpload>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The content type an object was stored with, if any.
    pub async fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .read()
            .await
            .get(key)
            .and_then(|o| o.content_type.clone())
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Number of multipart sessions neither completed nor aborted.
    pub async fn open_uploads(&self) -> usize {
        self.uploads.read().await.len()
    }

    async fn store(&self, key: &str, data: Bytes, content_type: Option<String>) {
        self.objects
            .write()
            .await
            .insert(key.to_string(), StoredObject { data, content_type });
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    #[instrument(skip(self, data), fields(key = %key, size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.store(key, data, None).await;
        Ok(())
    }

    async fn put_with_content_type(&self, key: &str, data: Bytes, content_type: &str) -> Result<()> {
        self.store(key, data, Some(content_type.to_string())).await;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| ReplicatorError::NotFound {
                key: key.to_string(),
            })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn put_if_not_exists(&self, key: &str, data: Bytes) -> Result<bool> {
        let mut objects = self.objects.write().await;
        if objects.contains_key(key) {
            return Ok(false);
        }
        objects.insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: None,
            },
        );
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn create_multipart(&self, key: &str, content_type: &str) -> Result<String> {
        let upload_id = Uuid::new_v4().to_string();
        self.uploads.write().await.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                content_type: content_type.to_string(),
                parts: HashMap::new(),
            },
        );
        debug!(key, upload_id = %upload_id, "Opened multipart upload");
        Ok(upload_id)
    }

    async fn put_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        let mut uploads = self.uploads.write().await;
        let upload = uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| ReplicatorError::NotFound {
                key: format!("multipart upload {upload_id} for {key}"),
            })?;
        let etag = Uuid::new_v4().simple().to_string();
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()> {
        let upload = {
            let mut uploads = self.uploads.write().await;
            let owned_by_key = uploads.get(upload_id).is_some_and(|u| u.key == key);
            if owned_by_key {
                uploads.remove(upload_id)
            } else {
                None
            }
        }
        .ok_or_else(|| ReplicatorError::NotFound {
            key: format!("multipart upload {upload_id} for {key}"),
        })?;

        let mut body = BytesMut::new();
        for part in &parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, data)) if *etag == part.etag => body.extend_from_slice(data),
                _ => {
                    return Err(ReplicatorError::storage_msg(format!(
                        "Invalid part {} for upload {upload_id}",
                        part.part_number
                    )))
                }
            }
        }
        self.store(key, body.freeze(), Some(upload.content_type)).await;
        Ok(())
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<()> {
        self.uploads.write().await.remove(upload_id);
        Ok(())
    }
}
