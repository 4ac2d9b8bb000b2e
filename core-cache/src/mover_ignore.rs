//! Mover ignore list
//!
//! One absolute path per line. Each cached item's slow-pool path is listed so
//! the array mover leaves its fast-pool copy alone; the line is removed again
//! on eviction.

use crate::error::Result;
use bridge_traits::storage::CacheFileSystem;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub struct MoverIgnoreList {
    path: Option<PathBuf>,
    fs: Arc<dyn CacheFileSystem>,
    write_lock: Mutex<()>,
}

impl MoverIgnoreList {
    pub fn new(path: Option<PathBuf>, fs: Arc<dyn CacheFileSystem>) -> Self {
        Self {
            path,
            fs,
            write_lock: Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    /// Add `entry`; returns whether the file changed
    pub async fn add(&self, entry: &Path) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let _guard = self.write_lock.lock().await;
        let mut lines = self.read_lines(path).await?;
        let line = entry.to_string_lossy().into_owned();
        if lines.contains(&line) {
            return Ok(false);
        }
        lines.push(line);
        self.write_lines(path, &lines).await?;
        debug!(entry = ?entry, "Added mover ignore entry");
        Ok(true)
    }

    /// Remove `entry`; returns whether the file changed
    pub async fn remove(&self, entry: &Path) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let _guard = self.write_lock.lock().await;
        let mut lines = self.read_lines(path).await?;
        let line = entry.to_string_lossy();
        let before = lines.len();
        lines.retain(|l| l.as_str() != line.as_ref());
        if lines.len() == before {
            return Ok(false);
        }
        self.write_lines(path, &lines).await?;
        debug!(entry = ?entry, "Removed mover ignore entry");
        Ok(true)
    }

    pub async fn entries(&self) -> Result<Vec<PathBuf>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        Ok(self
            .read_lines(path)
            .await?
            .into_iter()
            .map(PathBuf::from)
            .collect())
    }

    async fn read_lines(&self, path: &Path) -> Result<Vec<String>> {
        match self.fs.read_file(path).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes)
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_lines(&self, path: &Path, lines: &[String]) -> Result<()> {
        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        if let Some(parent) = path.parent() {
            self.fs.create_dir_all(parent).await?;
        }
        self.fs.write_file(path, Bytes::from(content)).await?;
        Ok(())
    }
}
