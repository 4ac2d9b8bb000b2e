//! # Copy Engine
//!
//! Moves one media file onto the fast pool and swaps the slow pool path for a
//! symlink to it.
//!
//! ## Pipeline
//!
//! 1. Idempotence check: the source already links to a complete cache file
//! 2. Per attempt: space check, transfer into `<cache>.partial` under a
//!    timeout, size verification; the partial is removed after a failure and
//!    the next attempt waits `min(base * 2^attempt, max)`
//! 3. Swap: partial renamed to the cache file, original hard-linked to
//!    `<source>.moved_to_cache`, symlink created at `<source>.cachelink` and
//!    renamed over the source
//!
//! A failed swap is rolled back and the original is left untouched.

use crate::error::{CacheError, Result};
use bridge_traits::storage::CacheFileSystem;
use bridge_traits::transfer::{FileTransfer, TransferOptions};
use core_runtime::logging::strip_path;
use core_runtime::EngineConfig;
use core_store::models::{with_suffix, PARTIAL_SUFFIX, PRESERVED_SUFFIX, TEMP_LINK_SUFFIX};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

/// Retry, timeout and space settings of a copy run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
    pub min_free_space: u64,
    pub bandwidth_limit_kbps: u64,
}

impl CopyPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
            attempt_timeout: config.attempt_timeout(),
            min_free_space: config.min_free_space_bytes(),
            bandwidth_limit_kbps: config.bandwidth_limit_kbps,
        }
    }

    /// Wait after failed attempt `attempt` (zero based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOutcome {
    pub bytes: u64,
    /// Failed attempts before the one that succeeded
    pub retries: u32,
    /// Nothing was copied; the source already linked to a complete cache file
    pub already_cached: bool,
}

#[derive(Debug)]
pub struct CopyFailure {
    pub error: CacheError,
    pub retries: u32,
}

impl CopyFailure {
    fn new(error: impl Into<CacheError>, retries: u32) -> Self {
        Self {
            error: error.into(),
            retries,
        }
    }
}

pub struct CopyEngine {
    fs: Arc<dyn CacheFileSystem>,
    transfer: Arc<dyn FileTransfer>,
    policy: CopyPolicy,
}

impl CopyEngine {
    pub fn new(
        fs: Arc<dyn CacheFileSystem>,
        transfer: Arc<dyn FileTransfer>,
        policy: CopyPolicy,
    ) -> Self {
        Self {
            fs,
            transfer,
            policy,
        }
    }

    pub fn policy(&self) -> &CopyPolicy {
        &self.policy
    }

    /// Copy `source` to `cache` and link it into place.
    #[instrument(skip(self, source, cache), fields(file = %strip_path(source)))]
    pub async fn copy(
        &self,
        source: &Path,
        cache: &Path,
    ) -> std::result::Result<CopyOutcome, CopyFailure> {
        if let Some(bytes) = self
            .linked_size(source, cache)
            .await
            .map_err(|e| CopyFailure::new(e, 0))?
        {
            debug!("Source already links to a complete cache file");
            return Ok(CopyOutcome {
                bytes,
                retries: 0,
                already_cached: true,
            });
        }

        let meta = self
            .fs
            .symlink_metadata(source)
            .await
            .map_err(|e| CopyFailure::new(e, 0))?;
        if !meta.is_regular_file() {
            return Err(CopyFailure::new(
                CacheError::InvalidSource(source.to_path_buf()),
                0,
            ));
        }
        let size = meta.size;

        if let Some(parent) = cache.parent() {
            self.fs
                .create_dir_all(parent)
                .await
                .map_err(|e| CopyFailure::new(e, 0))?;
        }

        let partial = with_suffix(cache, PARTIAL_SUFFIX);
        let options = TransferOptions::with_bandwidth_limit(self.policy.bandwidth_limit_kbps);
        let mut failed_attempts = 0u32;

        loop {
            self.ensure_space(cache, size)
                .await
                .map_err(|e| CopyFailure::new(e, failed_attempts))?;

            match self.attempt(source, &partial, size, options).await {
                Ok(()) => break,
                Err(error) => {
                    failed_attempts += 1;
                    warn!(
                        attempt = failed_attempts,
                        max_retries = self.policy.max_retries,
                        error = %error,
                        "Copy attempt failed"
                    );
                    if let Err(e) = self.fs.remove_if_exists(&partial).await {
                        warn!(error = %e, "Failed to remove partial copy");
                    }
                    if failed_attempts >= self.policy.max_retries {
                        return Err(CopyFailure::new(error, failed_attempts));
                    }
                    sleep(self.policy.backoff(failed_attempts - 1)).await;
                }
            }
        }

        self.swap(source, cache, &partial)
            .await
            .map_err(|e| CopyFailure::new(e, failed_attempts))?;

        info!(bytes = size, retries = failed_attempts, "Copy complete");
        Ok(CopyOutcome {
            bytes: size,
            retries: failed_attempts,
            already_cached: false,
        })
    }

    async fn attempt(
        &self,
        source: &Path,
        partial: &Path,
        size: u64,
        options: TransferOptions,
    ) -> Result<()> {
        self.fs.remove_if_exists(partial).await?;

        match timeout(
            self.policy.attempt_timeout,
            self.transfer.transfer(source, partial, options),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(CacheError::TransientCopy(e.to_string())),
            Err(_) => {
                return Err(CacheError::TransientCopy(format!(
                    "attempt timed out after {}s",
                    self.policy.attempt_timeout.as_secs()
                )))
            }
        }

        let copied = self
            .fs
            .metadata(partial)
            .await
            .map_err(|e| CacheError::TransientCopy(format!("partial copy missing: {}", e)))?
            .size;
        if copied != size {
            return Err(CacheError::TransientCopy(format!(
                "size mismatch: copied {} of {} bytes",
                copied, size
            )));
        }
        Ok(())
    }

    /// Available space on the fast pool must cover the file plus the reserve
    pub async fn ensure_space(&self, cache: &Path, size: u64) -> Result<()> {
        let probe = cache.parent().unwrap_or(cache);
        let space = self.fs.space(probe).await?;
        let required = size.saturating_add(self.policy.min_free_space);
        if space.available_bytes < required {
            return Err(CacheError::InsufficientSpace {
                required,
                available: space.available_bytes,
            });
        }
        Ok(())
    }

    async fn swap(&self, source: &Path, cache: &Path, partial: &Path) -> Result<()> {
        let preserved = with_suffix(source, PRESERVED_SUFFIX);
        let temp_link = with_suffix(source, TEMP_LINK_SUFFIX);

        self.fs.rename(partial, cache).await?;

        let linked = async {
            self.fs.remove_if_exists(&preserved).await?;
            self.fs.hard_link(source, &preserved).await?;
            self.fs.remove_if_exists(&temp_link).await?;
            self.fs.symlink(cache, &temp_link).await?;
            self.fs.rename(&temp_link, source).await?;
            Ok::<_, bridge_traits::BridgeError>(())
        }
        .await;

        if let Err(e) = linked {
            warn!(error = %e, "Link swap failed, rolling back");
            self.rollback(cache, &preserved, &temp_link).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn rollback(&self, cache: &Path, preserved: &Path, temp_link: &Path) {
        for path in [temp_link, preserved, cache] {
            if let Err(e) = self.fs.remove_if_exists(path).await {
                warn!(file = %strip_path(path), error = %e, "Rollback step failed");
            }
        }
    }

    /// Size of the cache file when `source` is a link to a complete `cache`.
    ///
    /// Complete means the cache file exists and, when the preserved original
    /// is still around, has the same size as it.
    pub async fn linked_size(&self, source: &Path, cache: &Path) -> Result<Option<u64>> {
        let target = match self.fs.read_link(source).await {
            Ok(Some(target)) => target,
            Ok(None) => return Ok(None),
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if target != cache {
            return Ok(None);
        }
        let cached = match self.fs.metadata(cache).await {
            Ok(meta) if meta.size > 0 => meta.size,
            Ok(_) => return Ok(None),
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let preserved = with_suffix(source, PRESERVED_SUFFIX);
        match self.fs.metadata(&preserved).await {
            Ok(original) if original.size != cached => Ok(None),
            Ok(_) => Ok(Some(cached)),
            Err(e) if e.is_not_found() => Ok(Some(cached)),
            Err(e) => Err(e.into()),
        }
    }

    /// Copy the cache file back over `source` when no preserved original exists.
    #[instrument(skip(self, cache, source), fields(file = %strip_path(source)))]
    pub async fn copy_back(&self, cache: &Path, source: &Path) -> Result<u64> {
        let staging: PathBuf = with_suffix(source, PARTIAL_SUFFIX);
        self.fs.remove_if_exists(&staging).await?;
        let options = TransferOptions::with_bandwidth_limit(self.policy.bandwidth_limit_kbps);

        let copied = match timeout(
            self.policy.attempt_timeout,
            self.transfer.transfer(cache, &staging, options),
        )
        .await
        {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                self.fs.remove_if_exists(&staging).await?;
                return Err(CacheError::TransientCopy(e.to_string()));
            }
            Err(_) => {
                self.fs.remove_if_exists(&staging).await?;
                return Err(CacheError::TransientCopy("copy back timed out".to_string()));
            }
        };

        self.fs.rename(&staging, source).await?;
        warn!(bytes = copied, "Original restored from the cache copy");
        Ok(copied)
    }
}
