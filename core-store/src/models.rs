//! Domain models for the cache state store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Suffix of an in-progress copy next to the cache file
pub const PARTIAL_SUFFIX: &str = ".partial";
/// Suffix of the hard link that preserves the original while it is cached
pub const PRESERVED_SUFFIX: &str = ".moved_to_cache";
/// Suffix of the symlink that is renamed over the source during the swap
pub const TEMP_LINK_SUFFIX: &str = ".cachelink";

// =============================================================================
// ID Types
// =============================================================================

/// Media-server identifier of a cached item
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ItemId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// =============================================================================
// Item state
// =============================================================================

/// Lifecycle state of a managed item. An item without a row is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Waiting for the playback cooldown to elapse
    CooldownPending,
    /// Copy to the fast pool in progress
    Copying,
    /// Source path is a link to the cache file
    Cached,
    /// Cached, cleanup deadline armed
    PendingCleanup,
    /// Eviction started; cleared once every step has run
    Evicted,
    /// Copy failed; the original is untouched
    Failed,
}

impl ItemState {
    pub const ALL: [ItemState; 6] = [
        ItemState::CooldownPending,
        ItemState::Copying,
        ItemState::Cached,
        ItemState::PendingCleanup,
        ItemState::Evicted,
        ItemState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::CooldownPending => "cooldown_pending",
            ItemState::Copying => "copying",
            ItemState::Cached => "cached",
            ItemState::PendingCleanup => "pending_cleanup",
            ItemState::Evicted => "evicted",
            ItemState::Failed => "failed",
        }
    }

    /// States in which `cache_path` may hold a completed file
    pub fn holds_cache_file(&self) -> bool {
        matches!(
            self,
            ItemState::Copying | ItemState::Cached | ItemState::PendingCleanup
        )
    }

    /// States in which the source path is a link into the fast pool
    pub fn is_linked(&self) -> bool {
        matches!(self, ItemState::Cached | ItemState::PendingCleanup)
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cooldown_pending" => Ok(ItemState::CooldownPending),
            "copying" => Ok(ItemState::Copying),
            "cached" => Ok(ItemState::Cached),
            "pending_cleanup" => Ok(ItemState::PendingCleanup),
            "evicted" => Ok(ItemState::Evicted),
            "failed" => Ok(ItemState::Failed),
            other => Err(format!("unknown item state: {}", other)),
        }
    }
}

// =============================================================================
// Managed item
// =============================================================================

/// One media file the engine has taken responsibility for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedItem {
    pub item_id: ItemId,
    /// Original location on the slow pool
    pub source_path: PathBuf,
    /// Copy location on the fast pool
    pub cache_path: PathBuf,
    pub state: ItemState,
    pub size_bytes: u64,
    pub last_activity_at: DateTime<Utc>,
    pub cleanup_deadline_at: Option<DateTime<Utc>>,
    /// When the single extended retry of a failed copy is due
    pub retry_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub failed_retry_used: bool,
    pub last_error: Option<String>,
    pub is_precache: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ManagedItem {
    /// New row in `CooldownPending`
    pub fn new(
        item_id: impl Into<ItemId>,
        source_path: impl Into<PathBuf>,
        cache_path: impl Into<PathBuf>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            source_path: source_path.into(),
            cache_path: cache_path.into(),
            state: ItemState::CooldownPending,
            size_bytes: 0,
            last_activity_at: now,
            cleanup_deadline_at: None,
            retry_at: None,
            retry_count: 0,
            failed_retry_used: false,
            last_error: None,
            is_precache: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_precache(mut self, is_precache: bool) -> Self {
        self.is_precache = is_precache;
        self
    }

    pub fn with_state(mut self, state: ItemState) -> Self {
        self.state = state;
        self
    }

    /// `<cache_path>.partial`
    pub fn partial_path(&self) -> PathBuf {
        with_suffix(&self.cache_path, PARTIAL_SUFFIX)
    }

    /// `<source_path>.moved_to_cache`
    pub fn preserved_path(&self) -> PathBuf {
        with_suffix(&self.source_path, PRESERVED_SUFFIX)
    }

    /// `<source_path>.cachelink`
    pub fn temp_link_path(&self) -> PathBuf {
        with_suffix(&self.source_path, TEMP_LINK_SUFFIX)
    }
}

/// Append `suffix` to the final component of `path`
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

// =============================================================================
// History
// =============================================================================

/// Kind of a history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Requested,
    Completed,
    Failed,
    Retrying,
    CleanupScheduled,
    Resumed,
    Evicted,
    Skipped,
    Abandoned,
    Recovered,
    Reset,
}

impl HistoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryKind::Requested => "requested",
            HistoryKind::Completed => "completed",
            HistoryKind::Failed => "failed",
            HistoryKind::Retrying => "retrying",
            HistoryKind::CleanupScheduled => "cleanup_scheduled",
            HistoryKind::Resumed => "resumed",
            HistoryKind::Evicted => "evicted",
            HistoryKind::Skipped => "skipped",
            HistoryKind::Abandoned => "abandoned",
            HistoryKind::Recovered => "recovered",
            HistoryKind::Reset => "reset",
        }
    }
}

impl fmt::Display for HistoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HistoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(HistoryKind::Requested),
            "completed" => Ok(HistoryKind::Completed),
            "failed" => Ok(HistoryKind::Failed),
            "retrying" => Ok(HistoryKind::Retrying),
            "cleanup_scheduled" => Ok(HistoryKind::CleanupScheduled),
            "resumed" => Ok(HistoryKind::Resumed),
            "evicted" => Ok(HistoryKind::Evicted),
            "skipped" => Ok(HistoryKind::Skipped),
            "abandoned" => Ok(HistoryKind::Abandoned),
            "recovered" => Ok(HistoryKind::Recovered),
            "reset" => Ok(HistoryKind::Reset),
            other => Err(format!("unknown history kind: {}", other)),
        }
    }
}

/// One line of the history log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub item_id: ItemId,
    pub kind: HistoryKind,
    pub detail: String,
    pub bytes: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// Lifetime counters, kept apart from the trimmed history
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatistics {
    pub copies_completed: u64,
    pub bytes_copied: u64,
    pub evictions: u64,
    pub failures: u64,
}
