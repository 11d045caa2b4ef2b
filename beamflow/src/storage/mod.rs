//! Object store client.
//!
//! The pipeline only needs three operations: upload a local file, download a
//! blob to a local file, and list keys by prefix. [`BlobStore`] provides them
//! over any `object_store` backend (GCS, local filesystem, in-memory).

mod blob_ref;

pub use blob_ref::BlobRef;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as StorePath;
use object_store::{ObjectStore, PutPayload};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::errors::StorageError;

/// The contracted object store operations.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// Uploads a local file to `remote_key`.
    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<(), StorageError>;

    /// Downloads `remote` into `local_path`, creating parent directories.
    async fn download(&self, remote: &BlobRef, local_path: &Path) -> Result<(), StorageError>;

    /// Lists keys that start with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Object store client over an `object_store` backend.
#[derive(Clone)]
pub struct BlobStore {
    store: Arc<dyn ObjectStore>,
    bucket: Option<String>,
    canonical_url: String,
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlobStore<{}>", self.canonical_url)
    }
}

impl BlobStore {
    /// Creates a store for `gs://bucket`, `file:///dir` or `memory://`.
    pub fn for_url(url: &str) -> Result<Self, StorageError> {
        match url.split_once("://") {
            Some(("gs", bucket)) => {
                let bucket = bucket.trim_end_matches('/');
                if bucket.is_empty() || bucket.contains('/') {
                    return Err(StorageError::UnsupportedUrl {
                        url: url.to_string(),
                    });
                }
                let mut builder = object_store::gcp::GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(bucket);
                if let Ok(key) = std::env::var("GOOGLE_SERVICE_ACCOUNT_KEY") {
                    debug!("Constructing GCS client with service account key");
                    builder = builder.with_service_account_key(key);
                }
                Ok(Self {
                    store: Arc::new(builder.build()?),
                    bucket: Some(bucket.to_string()),
                    canonical_url: format!("gs://{bucket}"),
                })
            }
            Some(("file", dir)) => {
                std::fs::create_dir_all(dir).map_err(|source| StorageError::Io {
                    path: dir.into(),
                    source,
                })?;
                Ok(Self {
                    store: Arc::new(LocalFileSystem::new_with_prefix(dir)?),
                    bucket: None,
                    canonical_url: url.to_string(),
                })
            }
            Some(("memory", _)) => Ok(Self::in_memory()),
            _ => Err(StorageError::UnsupportedUrl {
                url: url.to_string(),
            }),
        }
    }

    /// Creates a process-local in-memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_store(Arc::new(InMemory::new()), None, "memory://")
    }

    /// Wraps an existing backend.
    #[must_use]
    pub fn with_store(
        store: Arc<dyn ObjectStore>,
        bucket: Option<String>,
        canonical_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            bucket,
            canonical_url: canonical_url.into(),
        }
    }

    /// Writes raw bytes to a key.
    pub async fn put_bytes(&self, remote_key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let payload = PutPayload::from(Bytes::from(bytes));
        self.store.put(&StorePath::from(remote_key), payload).await?;
        Ok(())
    }

    /// Reads a key into memory.
    pub async fn get_bytes(&self, remote_key: &str) -> Result<Bytes, StorageError> {
        let result = self.store.get(&StorePath::from(remote_key)).await;
        match result {
            Ok(get) => Ok(get.bytes().await?),
            Err(object_store::Error::NotFound { .. }) => Err(StorageError::NotFound {
                key: remote_key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn check_bucket(&self, remote: &BlobRef) -> Result<(), StorageError> {
        match (&self.bucket, &remote.bucket) {
            (Some(ours), Some(theirs)) if ours != theirs => Err(StorageError::invalid_ref(
                remote.to_string(),
                format!("bucket does not match configured store {}", self.canonical_url),
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectStoreClient for BlobStore {
    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<(), StorageError> {
        let start = Instant::now();
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|source| StorageError::Io {
                path: local_path.to_path_buf(),
                source,
            })?;
        let size = bytes.len();
        self.put_bytes(remote_key, bytes).await?;
        debug!(
            remote_key,
            size,
            duration_ms = start.elapsed().as_millis() as u64,
            "Uploaded {}",
            local_path.display()
        );
        Ok(())
    }

    async fn download(&self, remote: &BlobRef, local_path: &Path) -> Result<(), StorageError> {
        self.check_bucket(remote)?;
        let start = Instant::now();
        let bytes = self.get_bytes(&remote.key).await?;

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(local_path, &bytes)
            .await
            .map_err(|source| StorageError::Io {
                path: local_path.to_path_buf(),
                source,
            })?;
        debug!(
            blob = %remote,
            size = bytes.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Downloaded to {}",
            local_path.display()
        );
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        // object_store lists by directory, so list the parent and filter.
        let dir = prefix.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        let dir_path = (!dir.is_empty()).then(|| StorePath::from(dir));

        let mut keys: Vec<String> = self
            .store
            .list(dir_path.as_ref())
            .map_ok(|meta| meta.location.to_string())
            .try_filter(|key| futures::future::ready(key.starts_with(prefix)))
            .try_collect()
            .await?;
        keys.sort();
        Ok(keys)
    }
}
