//! Filesystem-backed storage backend for solo mode and local development.
//!
//! [`LocalBackend`] implements the [`StorageBackend`] trait using the local
//! filesystem. Files are written to a staging file next to their target and
//! only then moved into place, so readers never see a partial object.
//! Conditional writes hard-link the staged file, which fails if the target
//! already exists. Multipart parts are staged under a hidden `.multipart`
//! directory and concatenated on completion.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use replicator_core::error::ReplicatorError;
use replicator_core::storage::{bytes_to_stream, ByteStream, CompletedPart, StorageBackend};
use replicator_core::Result;

/// Directory (relative to the base) holding in-progress multipart sessions.
const MULTIPART_DIR: &str = ".multipart";

/// Suffix of files still being written; never listed.
const STAGING_SUFFIX: &str = ".staging";

/// Chunk size of streamed reads.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// A [`StorageBackend`] backed by the local filesystem.
///
/// All keys are mapped to paths under the configured `base_dir`.
/// Parent directories are created automatically on `put`.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    base_dir: PathBuf,
}

impl LocalBackend {
    /// Create a new `LocalBackend` rooted at the given directory.
    ///
    /// The directory is created if it does not exist.
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).await.map_err(|e| {
            ReplicatorError::storage(
                format!("Failed to create base directory: {}", base_dir.display()),
                e,
            )
        })?;
        debug!(base_dir = %base_dir.display(), "LocalBackend initialised");
        Ok(Self { base_dir })
    }

    /// Return the full filesystem path for a storage key.
    ///
    /// Keys may not escape the base directory.
    fn key_to_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(ReplicatorError::storage_msg(format!(
                "Invalid key for local storage: {key:?}"
            )));
        }
        Ok(self.base_dir.join(relative))
    }

    fn upload_dir(&self, upload_id: &str) -> Result<PathBuf> {
        if Uuid::parse_str(upload_id).is_err() {
            return Err(ReplicatorError::NotFound {
                key: format!("multipart upload {upload_id}"),
            });
        }
        Ok(self.base_dir.join(MULTIPART_DIR).join(upload_id))
    }

    /// Return the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

/// A unique sibling of `path` to write before moving into place.
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}{STAGING_SUFFIX}", Uuid::new_v4()))
}

async fn write_staged(path: &Path, data: &[u8]) -> Result<PathBuf> {
    let staged = staging_path(path);
    fs::write(&staged, data).await.map_err(|e| {
        ReplicatorError::storage(format!("Failed to write {}", staged.display()), e)
    })?;
    Ok(staged)
}

async fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            ReplicatorError::storage(
                format!(
                    "Failed to create parent directories for {}",
                    path.display()
                ),
                e,
            )
        })?;
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for LocalBackend {
    #[instrument(skip(self, data), fields(key = %key, size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.key_to_path(key)?;
        create_parent(&path).await?;
        let staged = write_staged(&path, &data).await?;
        if let Err(e) = fs::rename(&staged, &path).await {
            let _ = fs::remove_file(&staged).await;
            return Err(ReplicatorError::storage(
                format!("Failed to write {}", path.display()),
                e,
            ));
        }
        debug!("Put {} bytes to {}", data.len(), key);
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.key_to_path(key)?;
        let data = fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ReplicatorError::NotFound {
                    key: key.to_string(),
                }
            } else {
                ReplicatorError::storage(format!("Failed to read {}", path.display()), e)
            }
        })?;
        debug!("Get {} bytes from {}", data.len(), key);
        Ok(Bytes::from(data))
    }

    async fn get_stream(&self, key: &str) -> Result<ByteStream> {
        let data = self.get(key).await?;
        Ok(bytes_to_stream(data, READ_CHUNK_SIZE))
    }

    #[instrument(skip(self), fields(prefix = %prefix))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let base = &self.base_dir;
        let mut results = Vec::new();
        list_recursive(base, base, prefix, &mut results).await?;
        results.sort();
        debug!("Listed {} keys with prefix '{}'", results.len(), prefix);
        Ok(results)
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_to_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted {}", key);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Delete {}: already absent", key);
                Ok(())
            }
            Err(e) => Err(ReplicatorError::storage(
                format!("Failed to delete {}", path.display()),
                e,
            )),
        }
    }

    #[instrument(skip(self, data), fields(key = %key, size = data.len()))]
    async fn put_if_not_exists(&self, key: &str, data: Bytes) -> Result<bool> {
        let path = self.key_to_path(key)?;
        create_parent(&path).await?;

        // link(2) refuses to replace an existing target
        let staged = write_staged(&path, &data).await?;
        let linked = fs::hard_link(&staged, &path).await;
        let _ = fs::remove_file(&staged).await;
        let result = match linked {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => false,
            Err(e) => {
                return Err(ReplicatorError::storage(
                    format!("Failed to create {}", path.display()),
                    e,
                ))
            }
        };

        debug!(
            "put_if_not_exists {} → {}",
            key,
            if result { "created" } else { "already exists" }
        );
        Ok(result)
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.key_to_path(key)?;
        fs::try_exists(&path).await.map_err(|e| {
            ReplicatorError::storage(format!("Failed to check {}", path.display()), e)
        })
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn create_multipart(&self, key: &str, _content_type: &str) -> Result<String> {
        self.key_to_path(key)?;
        let upload_id = Uuid::new_v4().to_string();
        let dir = self.upload_dir(&upload_id)?;
        fs::create_dir_all(&dir).await.map_err(|e| {
            ReplicatorError::storage(format!("Failed to create {}", dir.display()), e)
        })?;
        debug!(upload_id = %upload_id, "Opened multipart upload");
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
        let dir = self.upload_dir(upload_id)?;
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(ReplicatorError::NotFound {
                key: format!("multipart upload {upload_id} for {key}"),
            });
        }
        let etag = Uuid::new_v4().simple().to_string();
        let part_path = dir.join(format!("{part_number:05}.{etag}"));
        fs::write(&part_path, &data).await.map_err(|e| {
            ReplicatorError::storage(format!("Failed to write {}", part_path.display()), e)
        })?;
        Ok(etag)
    }

    #[instrument(skip(self, parts), fields(key = %key, parts = parts.len()))]
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()> {
        let dir = self.upload_dir(upload_id)?;
        let path = self.key_to_path(key)?;
        create_parent(&path).await?;

        let staging = dir.join("assembled");
        let mut out = fs::File::create(&staging).await.map_err(|e| {
            ReplicatorError::storage(format!("Failed to create {}", staging.display()), e)
        })?;
        for part in &parts {
            let part_path = dir.join(format!("{:05}.{}", part.part_number, part.etag));
            let data = fs::read(&part_path).await.map_err(|e| {
                ReplicatorError::storage(
                    format!("Missing part {} of upload {upload_id}", part.part_number),
                    e,
                )
            })?;
            out.write_all(&data).await.map_err(|e| {
                ReplicatorError::storage(format!("Failed to write {}", staging.display()), e)
            })?;
        }
        out.flush().await.map_err(|e| {
            ReplicatorError::storage(format!("Failed to flush {}", staging.display()), e)
        })?;
        drop(out);

        fs::rename(&staging, &path).await.map_err(|e| {
            ReplicatorError::storage(format!("Failed to move upload into {}", path.display()), e)
        })?;
        let _ = fs::remove_dir_all(&dir).await;
        debug!(upload_id = %upload_id, parts = parts.len(), "Completed multipart upload");
        Ok(())
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<()> {
        let dir = self.upload_dir(upload_id)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ReplicatorError::storage(
                format!("Failed to remove {}", dir.display()),
                e,
            )),
        }
    }
}

/// Recursively list all files under `dir`, producing keys relative to `base`.
async fn list_recursive(
    base: &Path,
    dir: &Path,
    prefix: &str,
    results: &mut Vec<String>,
) -> Result<()> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(ReplicatorError::storage(
                format!("Failed to read directory {}", dir.display()),
                e,
            ))
        }
    };

    while let Some(entry) = entries.next_entry().await.map_err(|e| {
        ReplicatorError::storage(
            format!("Failed to read directory entry in {}", dir.display()),
            e,
        )
    })? {
        let path = entry.path();
        if path.is_dir() {
            if dir == base && entry.file_name() == MULTIPART_DIR {
                continue;
            }
            Box::pin(list_recursive(base, &path, prefix, results)).await?;
        } else {
            let relative = path
                .strip_prefix(base)
                .map_err(|e| ReplicatorError::Internal {
                    message: format!("Path prefix strip failed: {e}"),
                })?;
            // Normalise to forward slashes for cross-platform key consistency
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) && !key.ends_with(STAGING_SUFFIX) {
                results.push(key);
            }
        }
    }

    Ok(())
}
