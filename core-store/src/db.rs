//! # State Database
//!
//! Opens the SQLite file that holds managed items, history and counters.
//!
//! - WAL journal on file databases so status reads never wait on the engine
//! - `migrations/` is embedded and applied on open
//! - The parent directory of the database file is created when missing
//! - `:memory:` pools are pinned to one connection, since every connection to
//!   an in-memory URL opens a separate database
//!
//! ```rust,ignore
//! use core_store::db::{create_pool, DatabaseConfig};
//!
//! let pool = create_pool(DatabaseConfig::new("/var/lib/smart-cache/state.db")).await?;
//! ```

use crate::{Result, StoreError};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const MEMORY_PATH: &str = ":memory:";

/// Where the state lives and how many connections may touch it
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database file, or `:memory:`
    pub path: PathBuf,
    pub max_connections: u32,
    /// Wait for a pooled connection before giving up
    pub acquire_timeout: Duration,
    /// Wait on a locked database before `SQLITE_BUSY`
    pub busy_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let max_connections = if is_memory(&path) { 1 } else { 4 };
        Self {
            path,
            max_connections,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MEMORY_PATH)
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = if self.is_in_memory() { 1 } else { max.max(1) };
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn is_in_memory(&self) -> bool {
        is_memory(&self.path)
    }

    fn connect_options(&self) -> SqliteConnectOptions {
        let options = SqliteConnectOptions::new()
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(self.busy_timeout);
        if self.is_in_memory() {
            options.in_memory(true)
        } else {
            options
                .filename(&self.path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
        }
    }
}

fn is_memory(path: &Path) -> bool {
    path.as_os_str() == MEMORY_PATH
}

/// Open the state database, apply migrations and check it answers.
///
/// # Errors
///
/// Fails when the file cannot be created or opened, or a migration fails.
pub async fn create_pool(config: DatabaseConfig) -> Result<Pool<Sqlite>> {
    info!(
        path = %config.path.display(),
        max_connections = config.max_connections,
        "Opening state database"
    );

    if !config.is_in_memory() {
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Open {
                    path: config.path.clone(),
                    message: e.to_string(),
                })?;
        }
    }

    let mut pool_options = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout);
    if config.is_in_memory() {
        pool_options = pool_options.max_lifetime(None).idle_timeout(None);
    }

    let pool = pool_options
        .connect_with(config.connect_options())
        .await
        .map_err(|e| {
            warn!(error = %e, "Failed to open state database");
            StoreError::Database(e)
        })?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    debug!("Migrations applied");
    health_check(&pool).await?;

    Ok(pool)
}

/// In-memory pool with migrations applied
pub async fn create_test_pool() -> Result<Pool<Sqlite>> {
    create_pool(DatabaseConfig::in_memory()).await
}

/// `SELECT 1` against the pool
pub async fn health_check(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query("SELECT 1").fetch_one(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_pool_is_migrated() {
        let pool = create_test_pool().await.unwrap();
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('managed_items', 'cache_history', 'cache_stats') ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let names: Vec<_> = tables.into_iter().map(|(n,)| n).collect();
        assert_eq!(names, vec!["cache_history", "cache_stats", "managed_items"]);
        assert!(health_check(&pool).await.is_ok());
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");

        let pool = create_pool(DatabaseConfig::new(&path)).await.unwrap();
        sqlx::query("UPDATE cache_stats SET value = 7 WHERE key = 'evictions'")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let pool = create_pool(DatabaseConfig::new(&path)).await.unwrap();
        let (value,): (i64,) =
            sqlx::query_as("SELECT value FROM cache_stats WHERE key = 'evictions'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn memory_database_keeps_a_single_connection() {
        let config = DatabaseConfig::in_memory().with_max_connections(8);
        assert!(config.is_in_memory());
        assert_eq!(config.max_connections, 1);

        let config = DatabaseConfig::new("/var/lib/smart-cache/state.db").with_max_connections(0);
        assert!(!config.is_in_memory());
        assert_eq!(config.max_connections, 1);
    }
}
