//! Content-addressable artifact store.
//!
//! Blobs are written once and never modified. The handle is the SHA256 of
//! the payload, so concurrent `put`s of different payloads can never alias
//! the same handle, and a repeated `put` of the same payload is a no-op.
//!
//! `FsArtifactStore` writes each blob to a private temp file first and then
//! hard-links it into place, which fails atomically if another writer got
//! there first.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::domain::ArtifactHandle;

/// Store-level errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact store I/O error while {action}: {source}")]
    Io {
        action: String,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact not found: {0}")]
    NotFound(ArtifactHandle),
}

impl StoreError {
    fn io(action: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            action: action.into(),
            source,
        }
    }
}

/// Write-once, read-many blob storage keyed by [`ArtifactHandle`]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist a payload and return its handle
    async fn put(&self, bytes: Vec<u8>) -> Result<ArtifactHandle, StoreError>;

    /// Read a payload back
    async fn get(&self, handle: &ArtifactHandle) -> Result<Vec<u8>, StoreError>;

    /// Whether a handle is known
    async fn contains(&self, handle: &ArtifactHandle) -> Result<bool, StoreError>;

    /// Number of stored blobs
    async fn len(&self) -> Result<usize, StoreError>;

    /// Persist the contents of a local file
    async fn put_file(&self, path: &Path) -> Result<ArtifactHandle, StoreError> {
        let bytes = fs::read(path)
            .await
            .map_err(|e| StoreError::io(format!("reading {}", path.display()), e))?;
        self.put(bytes).await
    }

    /// Copy a stored blob out to a local path
    async fn export(&self, handle: &ArtifactHandle, dest: &Path) -> Result<(), StoreError> {
        let bytes = self.get(handle).await?;
        fs::write(dest, bytes)
            .await
            .map_err(|e| StoreError::io(format!("writing {}", dest.display()), e))
    }
}

/// Artifact store backed by a directory tree
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join(".tmp"))
            .await
            .map_err(|e| StoreError::io(format!("creating {}", root.display()), e))?;
        Ok(Self { root })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of a blob (`<root>/<2 hex>/<digest>`)
    pub fn blob_path(&self, handle: &ArtifactHandle) -> PathBuf {
        let digest = handle.digest();
        self.root.join(&digest[..2]).join(digest)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<ArtifactHandle, StoreError> {
        let handle = ArtifactHandle::for_bytes(&bytes);
        let dest = self.blob_path(&handle);

        if fs::try_exists(&dest).await.unwrap_or(false) {
            debug!(handle = %handle.short(), "artifact already stored");
            return Ok(handle);
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(format!("creating {}", parent.display()), e))?;
        }

        let tmp = self.root.join(".tmp").join(Uuid::new_v4().to_string());
        fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StoreError::io(format!("writing {}", tmp.display()), e))?;

        let linked = fs::hard_link(&tmp, &dest).await;
        let _ = fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => {
                debug!(handle = %handle.short(), size = bytes.len(), "artifact stored");
                Ok(handle)
            }
            // Another writer stored the same content first
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(handle),
            Err(e) => Err(StoreError::io(format!("linking {}", dest.display()), e)),
        }
    }

    async fn get(&self, handle: &ArtifactHandle) -> Result<Vec<u8>, StoreError> {
        let path = self.blob_path(handle);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(handle.clone())),
            Err(e) => Err(StoreError::io(format!("reading {}", path.display()), e)),
        }
    }

    async fn contains(&self, handle: &ArtifactHandle) -> Result<bool, StoreError> {
        let path = self.blob_path(handle);
        fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::io(format!("checking {}", path.display()), e))
    }

    async fn len(&self) -> Result<usize, StoreError> {
        let mut count = 0;
        let mut shards = fs::read_dir(&self.root)
            .await
            .map_err(|e| StoreError::io("listing store", e))?;

        while let Some(shard) = shards
            .next_entry()
            .await
            .map_err(|e| StoreError::io("listing store", e))?
        {
            if shard.file_name() == ".tmp" || !shard.path().is_dir() {
                continue;
            }
            let mut blobs = fs::read_dir(shard.path())
                .await
                .map_err(|e| StoreError::io("listing store shard", e))?;
            while blobs
                .next_entry()
                .await
                .map_err(|e| StoreError::io("listing store shard", e))?
                .is_some()
            {
                count += 1;
            }
        }

        Ok(count)
    }
}

/// In-memory artifact store, for tests and dry runs
#[derive(Default)]
pub struct MemoryArtifactStore {
    blobs: RwLock<HashMap<ArtifactHandle, Arc<Vec<u8>>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<ArtifactHandle, StoreError> {
        let handle = ArtifactHandle::for_bytes(&bytes);
        self.blobs
            .write()
            .await
            .entry(handle.clone())
            .or_insert_with(|| Arc::new(bytes));
        Ok(handle)
    }

    async fn get(&self, handle: &ArtifactHandle) -> Result<Vec<u8>, StoreError> {
        self.blobs
            .read()
            .await
            .get(handle)
            .map(|b| b.as_ref().clone())
            .ok_or_else(|| StoreError::NotFound(handle.clone()))
    }

    async fn contains(&self, handle: &ArtifactHandle) -> Result<bool, StoreError> {
        Ok(self.blobs.read().await.contains_key(handle))
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.blobs.read().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fs_put_and_get() {
        let temp = TempDir::new().unwrap();
        let store = FsArtifactStore::open(temp.path()).await.unwrap();

        let handle = store.put(b"ACGT".to_vec()).await.unwrap();
        assert_eq!(store.get(&handle).await.unwrap(), b"ACGT");
        assert!(store.blob_path(&handle).exists());
        assert!(store.contains(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn test_fs_put_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = FsArtifactStore::open(temp.path()).await.unwrap();

        let first = store.put(b"same".to_vec()).await.unwrap();
        let second = store.put(b"same".to_vec()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fs_concurrent_puts_never_alias() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(FsArtifactStore::open(temp.path()).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..32 {
            let store = Arc::clone(&store);
            // Every payload is written by two writers at once
            let payload = format!("payload-{}", i % 16).into_bytes();
            handles.push(tokio::spawn(async move {
                let h = store.put(payload.clone()).await.unwrap();
                (h, payload)
            }));
        }

        for task in handles {
            let (handle, payload) = task.await.unwrap();
            assert_eq!(store.get(&handle).await.unwrap(), payload);
        }
        assert_eq!(store.len().await.unwrap(), 16);
    }

    #[tokio::test]
    async fn test_fs_get_unknown_handle() {
        let temp = TempDir::new().unwrap();
        let store = FsArtifactStore::open(temp.path()).await.unwrap();

        let missing = ArtifactHandle::for_bytes(b"never stored");
        let err = store.get(&missing).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(h) if h == missing));
    }

    #[tokio::test]
    async fn test_memory_store_export() {
        let temp = TempDir::new().unwrap();
        let store = MemoryArtifactStore::new();
        let handle = store.put(b"exported".to_vec()).await.unwrap();

        let dest = temp.path().join("out.txt");
        store.export(&handle, &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"exported");
    }
}
