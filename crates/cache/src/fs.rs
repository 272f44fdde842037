//! Filesystem-backed byte store.
//!
//! Each entry is one file under the store's root directory, named by the
//! SHA-256 of its key so arbitrary URLs map to safe, fixed-length file
//! names. No index is kept; the directory is the source of truth.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use pixelmill_core::hashing::sha256_hex;

use crate::store::{ensure_not_empty, ByteStore, StoreError};

/// Directory-of-files store for persistent caching across sessions.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        tracing::debug!(root = %root.display(), "Opened filesystem store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(sha256_hex(key.as_bytes()))
    }
}

impl ByteStore for FsStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        ensure_not_empty(key, &bytes)?;
        tokio::fs::write(self.path_for(key), &bytes).await?;
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        match tokio::fs::metadata(self.path_for(key)).await {
            Ok(_) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }

    async fn total_size(&self) -> Result<u64, StoreError> {
        let mut total = 0;
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_file() {
                total += metadata.len();
            }
        }
        Ok(total)
    }
}
