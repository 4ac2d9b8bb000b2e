//! Storage Adapter Abstractions
//!
//! The cache engine never touches the filesystem directly. Every file, link and
//! capacity operation on the two storage pools goes through [`CacheFileSystem`],
//! so the engine can run against a real POSIX tree or an in-memory fake.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// File metadata information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub size: u64,
    pub modified_at: Option<i64>,
    pub is_directory: bool,
    pub is_symlink: bool,
    /// Number of hard links to the inode
    pub link_count: u64,
}

impl FileMetadata {
    pub fn is_regular_file(&self) -> bool {
        !self.is_directory && !self.is_symlink
    }
}

/// Capacity of the filesystem holding a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceInfo {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl SpaceInfo {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.available_bytes)
    }

    /// Used space as a percentage of total, 0.0 for an empty filesystem
    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes() as f64 / self.total_bytes as f64 * 100.0
    }
}

/// Filesystem operations needed to cache media files
///
/// Link-aware: `symlink_metadata` and `read_link` never follow links while
/// `metadata` resolves them. `rename` must replace the destination atomically,
/// which is what makes the link swap and the restore of an original safe.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::CacheFileSystem;
///
/// async fn points_at(fs: &dyn CacheFileSystem, link: &Path, target: &Path) -> Result<bool> {
///     Ok(fs.read_link(link).await?.as_deref() == Some(target))
/// }
/// ```
#[async_trait]
pub trait CacheFileSystem: Send + Sync {
    /// Check whether a directory entry exists at the path, without following links
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Metadata of the file a path resolves to
    async fn metadata(&self, path: &Path) -> Result<FileMetadata>;

    /// Metadata of the entry itself, links are not followed
    async fn symlink_metadata(&self, path: &Path) -> Result<FileMetadata>;

    /// Target of a symbolic link, or `None` when the entry is not a link
    async fn read_link(&self, path: &Path) -> Result<Option<PathBuf>>;

    /// Create a directory and all parent directories if they don't exist
    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Read entire file contents into memory
    async fn read_file(&self, path: &Path) -> Result<Bytes>;

    /// Write data to a file, creating it if it doesn't exist
    async fn write_file(&self, path: &Path, data: Bytes) -> Result<()>;

    /// Remove a file or a symbolic link
    async fn remove_file(&self, path: &Path) -> Result<()>;

    /// Atomically rename `from` to `to`, replacing `to` if it exists
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Create a hard link `link` to the inode at `original`
    async fn hard_link(&self, original: &Path, link: &Path) -> Result<()>;

    /// Create a symbolic link at `link` pointing to `target`
    async fn symlink(&self, target: &Path, link: &Path) -> Result<()>;

    /// List all entries in a directory
    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Capacity of the filesystem holding `path`
    async fn space(&self, path: &Path) -> Result<SpaceInfo>;

    /// Remove a file, treating a missing file as success
    async fn remove_if_exists(&self, path: &Path) -> Result<bool> {
        match self.remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
