//! # Engine Configuration
//!
//! Settings for the smart cache engine, loaded from a JSON settings file and
//! adjustable with `with_*` builder methods.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::EngineConfig;
//!
//! let config = EngineConfig::load("/config/settings.json")?
//!     .with_copy_concurrency(1);
//! config.validate()?;
//! ```
//!
//! Every key is optional except the two pool roots; missing keys take the
//! defaults below.
//!
//! ```json
//! {
//!   "slow_root": "/mnt/user0",
//!   "fast_root": "/mnt/cache",
//!   "cooldown_movie_secs": 60,
//!   "cooldown_episode_secs": 30,
//!   "precache_episodes": 1,
//!   "cleanup_delay_hours": 24,
//!   "min_free_space_gb": 100,
//!   "path_map": [{ "from": "/media", "to": "/mnt/user0" }]
//! }
//! ```

use crate::error::{Error, Result};
use crate::logging::redact_if_sensitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// Default file extensions admitted to the cache
pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &[".mkv", ".mp4", ".m4v", ".avi", ".mov", ".ts"];

/// Prefix rewrite from a media-server path to a host path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapping {
    pub from: String,
    pub to: PathBuf,
}

impl PathMapping {
    pub fn new(from: impl Into<String>, to: impl Into<PathBuf>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Parse the compact `"from:to,from:to"` form
    pub fn parse_list(list: &str) -> Result<Vec<PathMapping>> {
        list.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (from, to) = entry.split_once(':').ok_or_else(|| {
                    Error::Config(format!("Invalid path mapping '{}', expected from:to", entry))
                })?;
                Ok(PathMapping::new(from.trim(), to.trim()))
            })
            .collect()
    }
}

/// Configuration of the cache engine
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Master switch; when off, cache requests are skipped
    pub enabled: bool,
    /// Root of the slow (array) pool
    pub slow_root: PathBuf,
    /// Root of the fast (cache) pool
    pub fast_root: PathBuf,
    /// SQLite state database
    pub database_path: PathBuf,
    /// Optional list of paths the host's mover must skip
    pub mover_ignore_file: Option<PathBuf>,

    pub cooldown_movie_secs: u64,
    pub cooldown_episode_secs: u64,
    /// Upcoming episodes cached speculatively after an episode's cooldown
    pub precache_episodes: usize,

    pub cleanup_delay_hours: f64,
    /// Whether a Stop event schedules cleanup at all
    pub delete_on_stop: bool,

    pub min_free_space_gb: u64,
    /// Largest file admitted, 0 for unlimited
    pub max_file_size_gb: u64,
    /// 0 for unlimited
    pub bandwidth_limit_kbps: u64,

    /// Attempts per copy run
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Backoff ceiling, also the delay before a failed item's extra retry
    pub retry_max_delay_ms: u64,
    pub attempt_timeout_secs: u64,
    pub copy_concurrency: usize,

    pub maintenance_interval_secs: u64,
    pub failed_retention_hours: u64,
    pub history_limit: usize,

    pub allowed_extensions: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub skip_hardlinks: bool,
    pub path_map: Vec<PathMapping>,

    pub media_server_url: Option<String>,
    pub media_server_api_key: Option<String>,

    pub log_level: String,
    pub log_format: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            slow_root: PathBuf::new(),
            fast_root: PathBuf::new(),
            database_path: PathBuf::from("state.db"),
            mover_ignore_file: None,
            cooldown_movie_secs: 60,
            cooldown_episode_secs: 30,
            precache_episodes: 1,
            cleanup_delay_hours: 24.0,
            delete_on_stop: true,
            min_free_space_gb: 100,
            max_file_size_gb: 0,
            bandwidth_limit_kbps: 0,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            attempt_timeout_secs: 3_600,
            copy_concurrency: 2,
            maintenance_interval_secs: 300,
            failed_retention_hours: 168,
            history_limit: 1_000,
            allowed_extensions: DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            exclude_patterns: Vec::new(),
            skip_hardlinks: true,
            path_map: Vec::new(),
            media_server_url: None,
            media_server_api_key: None,
            log_level: "info".to_string(),
            log_format: None,
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("enabled", &self.enabled)
            .field("slow_root", &self.slow_root)
            .field("fast_root", &self.fast_root)
            .field("database_path", &self.database_path)
            .field("mover_ignore_file", &self.mover_ignore_file)
            .field("cooldown_movie_secs", &self.cooldown_movie_secs)
            .field("cooldown_episode_secs", &self.cooldown_episode_secs)
            .field("precache_episodes", &self.precache_episodes)
            .field("cleanup_delay_hours", &self.cleanup_delay_hours)
            .field("delete_on_stop", &self.delete_on_stop)
            .field("min_free_space_gb", &self.min_free_space_gb)
            .field("max_file_size_gb", &self.max_file_size_gb)
            .field("bandwidth_limit_kbps", &self.bandwidth_limit_kbps)
            .field("max_retries", &self.max_retries)
            .field("copy_concurrency", &self.copy_concurrency)
            .field("media_server_url", &self.media_server_url)
            .field(
                "media_server_api_key",
                &self
                    .media_server_api_key
                    .as_deref()
                    .map(|key| redact_if_sensitive("api_key", key)),
            )
            .finish_non_exhaustive()
    }
}

impl EngineConfig {
    pub fn new(slow_root: impl Into<PathBuf>, fast_root: impl Into<PathBuf>) -> Self {
        Self {
            slow_root: slow_root.into(),
            fast_root: fast_root.into(),
            ..Self::default()
        }
    }

    /// Parse settings from a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read settings from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| Error::SettingsFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn with_mover_ignore_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.mover_ignore_file = Some(path.into());
        self
    }

    pub fn with_cooldowns(mut self, movie_secs: u64, episode_secs: u64) -> Self {
        self.cooldown_movie_secs = movie_secs;
        self.cooldown_episode_secs = episode_secs;
        self
    }

    pub fn with_precache_episodes(mut self, count: usize) -> Self {
        self.precache_episodes = count;
        self
    }

    pub fn with_cleanup_delay_hours(mut self, hours: f64) -> Self {
        self.cleanup_delay_hours = hours;
        self
    }

    pub fn with_delete_on_stop(mut self, enabled: bool) -> Self {
        self.delete_on_stop = enabled;
        self
    }

    pub fn with_min_free_space_gb(mut self, gb: u64) -> Self {
        self.min_free_space_gb = gb;
        self
    }

    pub fn with_max_file_size_gb(mut self, gb: u64) -> Self {
        self.max_file_size_gb = gb;
        self
    }

    pub fn with_bandwidth_limit_kbps(mut self, kbps: u64) -> Self {
        self.bandwidth_limit_kbps = kbps;
        self
    }

    pub fn with_retry_policy(mut self, max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay_ms = base_delay_ms;
        self.retry_max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_attempt_timeout_secs(mut self, secs: u64) -> Self {
        self.attempt_timeout_secs = secs;
        self
    }

    pub fn with_copy_concurrency(mut self, concurrency: usize) -> Self {
        self.copy_concurrency = concurrency;
        self
    }

    pub fn with_maintenance_interval_secs(mut self, secs: u64) -> Self {
        self.maintenance_interval_secs = secs;
        self
    }

    pub fn with_skip_hardlinks(mut self, skip: bool) -> Self {
        self.skip_hardlinks = skip;
        self
    }

    pub fn with_exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.exclude_patterns = patterns;
        self
    }

    pub fn with_path_map(mut self, path_map: Vec<PathMapping>) -> Self {
        self.path_map = path_map;
        self
    }

    pub fn with_media_server(mut self, url: impl Into<String>, api_key: impl Into<String>) -> Self {
        self.media_server_url = Some(url.into());
        self.media_server_api_key = Some(api_key.into());
        self
    }

    pub fn min_free_space_bytes(&self) -> u64 {
        self.min_free_space_gb.saturating_mul(BYTES_PER_GB)
    }

    /// Largest admitted file size, `None` when unlimited
    pub fn max_file_size_bytes(&self) -> Option<u64> {
        (self.max_file_size_gb > 0).then(|| self.max_file_size_gb.saturating_mul(BYTES_PER_GB))
    }

    pub fn cooldown_movie(&self) -> Duration {
        Duration::from_secs(self.cooldown_movie_secs)
    }

    pub fn cooldown_episode(&self) -> Duration {
        Duration::from_secs(self.cooldown_episode_secs)
    }

    pub fn cleanup_delay(&self) -> Duration {
        if !self.cleanup_delay_hours.is_finite() {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.cleanup_delay_hours.max(0.0) * 3600.0)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn failed_retention(&self) -> Duration {
        Duration::from_secs(self.failed_retention_hours.saturating_mul(3600))
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Both pool roots are absolute and do not contain each other
    /// - Concurrency, retry and interval settings are usable
    /// - Path mappings and the media server settings are complete
    pub fn validate(&self) -> Result<()> {
        for (name, root) in [("slow_root", &self.slow_root), ("fast_root", &self.fast_root)] {
            if root.as_os_str().is_empty() {
                return Err(Error::Config(format!("{} cannot be empty", name)));
            }
            if !root.is_absolute() {
                return Err(Error::Config(format!(
                    "{} must be an absolute path, got {}",
                    name,
                    root.display()
                )));
            }
        }

        if self.slow_root.starts_with(&self.fast_root) || self.fast_root.starts_with(&self.slow_root) {
            return Err(Error::Config(
                "slow_root and fast_root must not contain each other".to_string(),
            ));
        }

        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("database_path cannot be empty".to_string()));
        }

        if self.copy_concurrency == 0 {
            return Err(Error::Config(
                "copy_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be greater than 0".to_string()));
        }

        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(Error::Config(
                "retry_base_delay_ms cannot exceed retry_max_delay_ms".to_string(),
            ));
        }

        if !self.cleanup_delay_hours.is_finite() || self.cleanup_delay_hours < 0.0 {
            return Err(Error::Config(
                "cleanup_delay_hours must be a non-negative number".to_string(),
            ));
        }

        if self.attempt_timeout_secs == 0 {
            return Err(Error::Config(
                "attempt_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.maintenance_interval_secs == 0 {
            return Err(Error::Config(
                "maintenance_interval_secs must be greater than 0".to_string(),
            ));
        }

        if let Some(mapping) = self.path_map.iter().find(|m| m.from.is_empty()) {
            return Err(Error::Config(format!(
                "path_map entry to {} has an empty prefix",
                mapping.to.display()
            )));
        }

        if self.media_server_url.is_some() && self.media_server_api_key.is_none() {
            return Err(Error::Config(
                "media_server_url is set but media_server_api_key is missing".to_string(),
            ));
        }

        Ok(())
    }
}
