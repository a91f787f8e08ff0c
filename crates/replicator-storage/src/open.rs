//! Selecting a storage backend from a URI or a configured identity.

use std::path::PathBuf;
use std::sync::Arc;

use replicator_core::{BackendIdentity, NodeConfig, ReplicatorError, Result, StorageBackend};

use crate::{LocalBackend, MemoryBackend, S3Backend, S3Options};

impl S3Options {
    /// Connection tuning from a node's configuration.
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
            pool_max_idle_per_host: config.pool_max_idle_per_host,
        }
    }
}

/// Open the storage behind one replica target.
///
/// `local://<dir>` stores the bucket as a subdirectory of `<dir>`,
/// `memory://` creates a fresh in-process store, and any other endpoint is
/// treated as an S3-compatible HTTP endpoint.
pub async fn open_backend(
    identity: &BackendIdentity,
    options: &S3Options,
) -> Result<Arc<dyn StorageBackend>> {
    if identity.endpoint.starts_with("memory://") {
        return Ok(Arc::new(MemoryBackend::new()));
    }
    if let Some(path) = identity.endpoint.strip_prefix("local://") {
        let mut dir = expand_home(path)?;
        if !identity.bucket.is_empty() {
            dir = dir.join(&identity.bucket);
        }
        return Ok(Arc::new(LocalBackend::new(dir).await?));
    }
    Ok(Arc::new(S3Backend::from_identity(identity, options)?))
}

/// Open the shared store holding records, settings and locks.
///
/// Accepts `s3://bucket/prefix?...`, `memory://`, `local://<dir>` or a bare
/// path. A leading `~/` is expanded to the home directory.
pub async fn open_state_store(uri: &str) -> Result<Arc<dyn StorageBackend>> {
    if uri.starts_with("s3://") {
        return Ok(Arc::new(S3Backend::new(uri)?));
    }
    if uri.starts_with("memory://") {
        return Ok(Arc::new(MemoryBackend::new()));
    }
    let path = uri.strip_prefix("local://").unwrap_or(uri);
    Ok(Arc::new(LocalBackend::new(expand_home(path)?).await?))
}

fn expand_home(path: &str) -> Result<PathBuf> {
    if path.starts_with("~/") || path.starts_with("~\\") {
        let home = home_dir()
            .ok_or_else(|| ReplicatorError::config("Cannot determine home directory"))?;
        Ok(home.join(&path[2..]))
    } else {
        Ok(PathBuf::from(path))
    }
}

/// Best-effort home directory detection.
fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE").ok().map(PathBuf::from)
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME").ok().map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn options() -> S3Options {
        S3Options::from_config(&NodeConfig::new("memory://", vec![]))
    }

    #[tokio::test]
    async fn test_open_local_backend_uses_bucket_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let identity = BackendIdentity {
            name: "disk".into(),
            endpoint: format!("local://{}", tmp.path().display()),
            bucket: "objects".into(),
            region: None,
            credentials: None,
        };
        let backend = open_backend(&identity, &options()).await.unwrap();
        backend.put("a.txt", Bytes::from("x")).await.unwrap();
        assert!(tmp.path().join("objects").join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_open_memory_backends_are_independent() {
        let a = open_backend(&BackendIdentity::memory("a"), &options())
            .await
            .unwrap();
        let b = open_backend(&BackendIdentity::memory("b"), &options())
            .await
            .unwrap();
        a.put("k", Bytes::from("1")).await.unwrap();
        assert!(!b.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_open_state_store_bare_path() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = open_state_store(&tmp.path().display().to_string())
            .await
            .unwrap();
        store.put("_replication/settings.json", Bytes::from("{}")).await.unwrap();
        assert!(tmp.path().join("_replication/settings.json").exists());
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/data").unwrap(), PathBuf::from("/data"));
        if let Some(home) = home_dir() {
            assert_eq!(expand_home("~/state").unwrap(), home.join("state"));
        }
    }
}
