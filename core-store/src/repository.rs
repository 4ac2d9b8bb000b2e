//! Cache state repository trait and SQLite implementation

use crate::error::{Result, StoreError};
use crate::models::{
    CacheStatistics, HistoryEntry, HistoryKind, ItemId, ItemState, ManagedItem,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

/// Default number of history rows retained
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Durable storage of managed items and their history
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Insert or replace the row for `item.item_id`.
    ///
    /// # Errors
    /// Returns [`StoreError::Conflict`] when another item already owns
    /// `item.source_path`.
    async fn put(&self, item: &ManagedItem) -> Result<()>;

    /// Find an item by its id
    async fn get(&self, item_id: &ItemId) -> Result<Option<ManagedItem>>;

    /// All items in `state`, oldest activity first
    async fn list_by_state(&self, state: ItemState) -> Result<Vec<ManagedItem>>;

    /// Every managed item, ordered by id
    async fn list_all(&self) -> Result<Vec<ManagedItem>>;

    /// Delete the row for `item_id`
    ///
    /// # Returns
    /// - `Ok(true)` if a row was deleted
    /// - `Ok(false)` if there was none
    async fn delete(&self, item_id: &ItemId) -> Result<bool>;

    /// Find the item that owns `source_path`
    async fn find_by_source_path(&self, source_path: &Path) -> Result<Option<ManagedItem>>;

    /// Append a history entry and bump the lifetime counters it affects.
    ///
    /// History beyond the configured limit is trimmed in the same transaction.
    async fn log_event(
        &self,
        item_id: &ItemId,
        kind: HistoryKind,
        detail: &str,
        bytes: Option<u64>,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Most recent history entries, newest first
    async fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>>;

    /// Lifetime counters
    async fn statistics(&self) -> Result<CacheStatistics>;

    /// Verify the backing database is reachable
    async fn health_check(&self) -> Result<()>;
}

/// SQLite implementation of [`CacheStore`]
pub struct SqliteCacheStore {
    pool: SqlitePool,
    history_limit: usize,
}

impl SqliteCacheStore {
    /// Create a store over a migrated pool
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_item(row: &SqliteRow) -> Result<ManagedItem> {
        let item_id: String = row.try_get("item_id")?;
        let corrupt = |message: String| StoreError::CorruptRow {
            item_id: item_id.clone(),
            message,
        };

        let state_str: String = row.try_get("state")?;
        let state = state_str.parse::<ItemState>().map_err(corrupt)?;

        let millis = |column: &str| -> Result<DateTime<Utc>> {
            let value: i64 = row.try_get(column)?;
            from_millis(value).ok_or_else(|| corrupt(format!("invalid timestamp in {}", column)))
        };
        let optional_millis = |column: &str| -> Result<Option<DateTime<Utc>>> {
            let value: Option<i64> = row.try_get(column)?;
            value
                .map(|v| {
                    from_millis(v)
                        .ok_or_else(|| corrupt(format!("invalid timestamp in {}", column)))
                })
                .transpose()
        };

        let size_bytes: i64 = row.try_get("size_bytes")?;
        let retry_count: i64 = row.try_get("retry_count")?;
        let source_path: String = row.try_get("source_path")?;
        let cache_path: String = row.try_get("cache_path")?;

        Ok(ManagedItem {
            item_id: ItemId(item_id.clone()),
            source_path: PathBuf::from(source_path),
            cache_path: PathBuf::from(cache_path),
            state,
            size_bytes: size_bytes.max(0) as u64,
            last_activity_at: millis("last_activity_at")?,
            cleanup_deadline_at: optional_millis("cleanup_deadline_at")?,
            retry_at: optional_millis("retry_at")?,
            retry_count: retry_count.clamp(0, u32::MAX as i64) as u32,
            failed_retry_used: row.try_get::<i64, _>("failed_retry_used")? != 0,
            last_error: row.try_get("last_error")?,
            is_precache: row.try_get::<i64, _>("is_precache")? != 0,
            created_at: millis("created_at")?,
            updated_at: millis("updated_at")?,
        })
    }

    fn row_to_history(row: &SqliteRow) -> Result<HistoryEntry> {
        let item_id: String = row.try_get("item_id")?;
        let kind_str: String = row.try_get("kind")?;
        let kind = kind_str
            .parse::<HistoryKind>()
            .map_err(|message| StoreError::CorruptRow {
                item_id: item_id.clone(),
                message,
            })?;
        let created_at: i64 = row.try_get("created_at")?;
        let bytes: Option<i64> = row.try_get("bytes")?;

        Ok(HistoryEntry {
            id: row.try_get("id")?,
            item_id: ItemId(item_id.clone()),
            kind,
            detail: row.try_get("detail")?,
            bytes: bytes.map(|b| b.max(0) as u64),
            created_at: from_millis(created_at).ok_or_else(|| StoreError::CorruptRow {
                item_id,
                message: "invalid history timestamp".to_string(),
            })?,
        })
    }

    fn rows_to_items(rows: Vec<SqliteRow>) -> Result<Vec<ManagedItem>> {
        rows.iter().map(Self::row_to_item).collect()
    }
}

fn from_millis(value: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(value)
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Counter keys bumped by a history entry of `kind`
fn counter_updates(kind: HistoryKind, bytes: Option<u64>) -> Vec<(&'static str, i64)> {
    match kind {
        HistoryKind::Completed => vec![
            ("copies_completed", 1),
            ("bytes_copied", bytes.unwrap_or(0) as i64),
        ],
        HistoryKind::Evicted => vec![("evictions", 1)],
        HistoryKind::Failed => vec![("failures", 1)],
        _ => Vec::new(),
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    #[instrument(skip(self, item), fields(item_id = %item.item_id, state = %item.state))]
    async fn put(&self, item: &ManagedItem) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO managed_items (
                item_id, source_path, cache_path, state, size_bytes,
                last_activity_at, cleanup_deadline_at, retry_at, retry_count,
                failed_retry_used, last_error, is_precache, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(item_id) DO UPDATE SET
                source_path = excluded.source_path,
                cache_path = excluded.cache_path,
                state = excluded.state,
                size_bytes = excluded.size_bytes,
                last_activity_at = excluded.last_activity_at,
                cleanup_deadline_at = excluded.cleanup_deadline_at,
                retry_at = excluded.retry_at,
                retry_count = excluded.retry_count,
                failed_retry_used = excluded.failed_retry_used,
                last_error = excluded.last_error,
                is_precache = excluded.is_precache,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(item.item_id.as_str())
        .bind(path_text(&item.source_path))
        .bind(path_text(&item.cache_path))
        .bind(item.state.as_str())
        .bind(item.size_bytes as i64)
        .bind(item.last_activity_at.timestamp_millis())
        .bind(item.cleanup_deadline_at.map(|t| t.timestamp_millis()))
        .bind(item.retry_at.map(|t| t.timestamp_millis()))
        .bind(item.retry_count as i64)
        .bind(item.failed_retry_used as i64)
        .bind(item.last_error.as_deref())
        .bind(item.is_precache as i64)
        .bind(item.created_at.timestamp_millis())
        .bind(item.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!("Item persisted");
                Ok(())
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                warn!(source_path = ?item.source_path, "Source path already managed");
                Err(StoreError::Conflict(format!(
                    "{} is already managed by another item",
                    item.source_path.display()
                )))
            }
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    async fn get(&self, item_id: &ItemId) -> Result<Option<ManagedItem>> {
        let row = sqlx::query("SELECT * FROM managed_items WHERE item_id = ?")
            .bind(item_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_item).transpose()
    }

    async fn list_by_state(&self, state: ItemState) -> Result<Vec<ManagedItem>> {
        let rows = sqlx::query(
            "SELECT * FROM managed_items WHERE state = ? ORDER BY last_activity_at ASC, item_id ASC",
        )
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;

        Self::rows_to_items(rows)
    }

    async fn list_all(&self) -> Result<Vec<ManagedItem>> {
        let rows = sqlx::query("SELECT * FROM managed_items ORDER BY item_id ASC")
            .fetch_all(&self.pool)
            .await?;

        Self::rows_to_items(rows)
    }

    #[instrument(skip(self), fields(item_id = %item_id))]
    async fn delete(&self, item_id: &ItemId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM managed_items WHERE item_id = ?")
            .bind(item_id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_by_source_path(&self, source_path: &Path) -> Result<Option<ManagedItem>> {
        let row = sqlx::query("SELECT * FROM managed_items WHERE source_path = ?")
            .bind(path_text(source_path))
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_item).transpose()
    }

    async fn log_event(
        &self,
        item_id: &ItemId,
        kind: HistoryKind,
        detail: &str,
        bytes: Option<u64>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO cache_history (item_id, kind, detail, bytes, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(item_id.as_str())
        .bind(kind.as_str())
        .bind(detail)
        .bind(bytes.map(|b| b as i64))
        .bind(at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        for (key, delta) in counter_updates(kind, bytes) {
            sqlx::query(
                "INSERT INTO cache_stats (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = value + excluded.value",
            )
            .bind(key)
            .bind(delta)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            DELETE FROM cache_history WHERE id <= (
                SELECT id FROM cache_history ORDER BY id DESC LIMIT 1 OFFSET ?
            )
            "#,
        )
        .bind(self.history_limit as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query("SELECT * FROM cache_history ORDER BY id DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_history).collect()
    }

    async fn statistics(&self) -> Result<CacheStatistics> {
        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT key, value FROM cache_stats")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = CacheStatistics::default();
        for (key, value) in rows {
            let value = value.max(0) as u64;
            match key.as_str() {
                "copies_completed" => stats.copies_completed = value,
                "bytes_copied" => stats.bytes_copied = value,
                "evictions" => stats.evictions = value,
                "failures" => stats.failures = value,
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn health_check(&self) -> Result<()> {
        crate::db::health_check(&self.pool).await
    }
}
