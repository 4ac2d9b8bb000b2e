//! File System Access Implementation using Tokio

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::{CacheFileSystem, FileMetadata, SpaceInfo},
};
use bytes::Bytes;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Tokio-based file system implementation
///
/// Provides async file operations using:
/// - `tokio::fs` for file, link and directory operations
/// - `std::os::unix` metadata for link counts
/// - `fs2` for filesystem capacity
#[derive(Debug, Default, Clone)]
pub struct TokioFileSystem;

impl TokioFileSystem {
    pub fn new() -> Self {
        Self
    }

    /// Convert std::io::Error to BridgeError
    fn map_io_error(e: std::io::Error) -> BridgeError {
        BridgeError::Io(e)
    }

    fn describe(metadata: &std::fs::Metadata) -> FileMetadata {
        FileMetadata {
            size: metadata.len(),
            modified_at: metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64),
            is_directory: metadata.is_dir(),
            is_symlink: metadata.file_type().is_symlink(),
            link_count: metadata.nlink(),
        }
    }
}

#[async_trait]
impl CacheFileSystem for TokioFileSystem {
    async fn exists(&self, path: &Path) -> Result<bool> {
        match fs::symlink_metadata(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::map_io_error(e)),
        }
    }

    async fn metadata(&self, path: &Path) -> Result<FileMetadata> {
        let metadata = fs::metadata(path).await.map_err(Self::map_io_error)?;
        Ok(Self::describe(&metadata))
    }

    async fn symlink_metadata(&self, path: &Path) -> Result<FileMetadata> {
        let metadata = fs::symlink_metadata(path)
            .await
            .map_err(Self::map_io_error)?;
        Ok(Self::describe(&metadata))
    }

    async fn read_link(&self, path: &Path) -> Result<Option<PathBuf>> {
        let metadata = fs::symlink_metadata(path)
            .await
            .map_err(Self::map_io_error)?;
        if !metadata.file_type().is_symlink() {
            return Ok(None);
        }
        let target = fs::read_link(path).await.map_err(Self::map_io_error)?;
        Ok(Some(target))
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .await
            .map_err(Self::map_io_error)?;
        debug!(path = ?path, "Created directory");
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> Result<Bytes> {
        let data = fs::read(path).await.map_err(Self::map_io_error)?;
        debug!(path = ?path, size = data.len(), "Read file");
        Ok(Bytes::from(data))
    }

    async fn write_file(&self, path: &Path, data: Bytes) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent).await?;
        }

        fs::write(path, data.as_ref())
            .await
            .map_err(Self::map_io_error)?;
        debug!(path = ?path, size = data.len(), "Wrote file");
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).await.map_err(Self::map_io_error)?;
        debug!(path = ?path, "Removed file");
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).await.map_err(Self::map_io_error)?;
        debug!(from = ?from, to = ?to, "Renamed");
        Ok(())
    }

    async fn hard_link(&self, original: &Path, link: &Path) -> Result<()> {
        fs::hard_link(original, link)
            .await
            .map_err(Self::map_io_error)?;
        debug!(original = ?original, link = ?link, "Created hard link");
        Ok(())
    }

    async fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        fs::symlink(target, link)
            .await
            .map_err(Self::map_io_error)?;
        debug!(target = ?target, link = ?link, "Created symlink");
        Ok(())
    }

    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(path).await.map_err(Self::map_io_error)?;

        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(Self::map_io_error)?
        {
            entries.push(entry.path());
        }

        debug!(path = ?path, count = entries.len(), "Listed directory");
        Ok(entries)
    }

    async fn space(&self, path: &Path) -> Result<SpaceInfo> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let total_bytes = fs2::total_space(&path)?;
            let available_bytes = fs2::available_space(&path)?;
            Ok::<_, std::io::Error>(SpaceInfo {
                total_bytes,
                available_bytes,
            })
        })
        .await
        .map_err(|e| BridgeError::OperationFailed(format!("space query panicked: {}", e)))?
        .map_err(Self::map_io_error)
    }
}
