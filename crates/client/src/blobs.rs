//! Directory-backed local blob store.
//!
//! Attachments captured offline live here until the mutation that references
//! them is confirmed synced. A blob is addressed by a flat name (the
//! `attachment_ref` stored on the queue item).

use std::io::ErrorKind;
use std::path::PathBuf;

use tokio::fs;
use tracing::debug;

const MAX_NAME_LEN: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    #[error("invalid blob reference '{0}'")]
    InvalidRef(String),

    #[error("blob '{0}' not found")]
    NotFound(String),

    #[error("blob store i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Open (creating if needed) a blob directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, BlobStoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Store `bytes` under `name`, replacing any previous blob.
    ///
    /// Written to a sibling temp file and renamed into place, so readers never
    /// observe a partially written blob.
    pub async fn put(&self, name: &str, bytes: &[u8]) -> Result<(), BlobStoreError> {
        let target = self.path_for(name)?;
        let tmp = self.root.join(format!(".{name}.{}.tmp", uuid::Uuid::now_v7()));

        fs::write(&tmp, bytes).await?;
        if let Err(e) = fs::rename(&tmp, &target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(blob = name, len = bytes.len(), "stored blob");
        Ok(())
    }

    pub async fn read(&self, name: &str) -> Result<Vec<u8>, BlobStoreError> {
        let path = self.path_for(name)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(BlobStoreError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a blob. Returns `false` if it was already gone.
    pub async fn delete(&self, name: &str) -> Result<bool, BlobStoreError> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(blob = name, "deleted blob");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, name: &str) -> Result<bool, BlobStoreError> {
        let path = self.path_for(name)?;
        Ok(fs::try_exists(&path).await?)
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, BlobStoreError> {
        if !is_valid_name(name) {
            return Err(BlobStoreError::InvalidRef(name.to_string()));
        }
        Ok(self.root.join(name))
    }
}

/// Flat names only: `[A-Za-z0-9._-]`, no leading dot.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}
