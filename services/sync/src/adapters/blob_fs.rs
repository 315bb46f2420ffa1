//! services/sync/src/adapters/blob_fs.rs
//!
//! Filesystem-backed implementation of the `BlobStore` port. Blob paths map
//! directly onto files under a configured root; reads stream so multi-hour
//! audiobooks never have to sit in memory.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio_util::io::ReaderStream;

use audiosync_core::ports::{BlobStat, BlobStore, ByteStream, PortError, PortResult};

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A blob store rooted at a local directory.
#[derive(Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Creates a new `FsBlobStore`.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Maps an opaque blob path to a file under the root, refusing paths
    /// that would escape it.
    fn resolve(&self, path: &str) -> PortResult<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes || path.is_empty() {
            return Err(PortError::Unexpected(format!(
                "invalid blob path '{path}'"
            )));
        }
        Ok(self.root.join(relative))
    }

    async fn open(&self, path: &str) -> PortResult<tokio::fs::File> {
        let full = self.resolve(path)?;
        tokio::fs::File::open(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PortError::NotFound(path.to_string())
            } else {
                PortError::Unexpected(e.to_string())
            }
        })
    }
}

//=========================================================================================
// `BlobStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, path: &str, bytes: Bytes) -> PortResult<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PortError::Unexpected(e.to_string()))?;
        }
        tokio::fs::write(&full, &bytes)
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))
    }

    async fn get(&self, path: &str) -> PortResult<ByteStream> {
        let file = self.open(path).await?;
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn get_range(&self, path: &str, start: u64, len: Option<u64>) -> PortResult<ByteStream> {
        let mut file = self.open(path).await?;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        match len {
            Some(len) => Ok(Box::pin(ReaderStream::new(file.take(len)))),
            None => Ok(Box::pin(ReaderStream::new(file))),
        }
    }

    async fn stat(&self, path: &str) -> PortResult<BlobStat> {
        let full = self.resolve(path)?;
        let meta = tokio::fs::metadata(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PortError::NotFound(path.to_string())
            } else {
                PortError::Unexpected(e.to_string())
            }
        })?;
        Ok(BlobStat { size: meta.len() })
    }

    async fn delete(&self, path: &str) -> PortResult<()> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            // Deleting an absent blob is a no-op so cleanup stays idempotent.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PortError::Unexpected(e.to_string())),
        }
    }

    async fn download_to(&self, path: &str, dest: &Path) -> PortResult<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PortError::Unexpected(e.to_string()))?;
        }
        tokio::fs::copy(&full, dest).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PortError::NotFound(path.to_string())
            } else {
                PortError::Unexpected(e.to_string())
            }
        })?;
        Ok(())
    }
}
