//! # Core Store
//!
//! Durable state of the cache engine: one row per managed media file, a
//! bounded history log and lifetime counters, all in SQLite.
//!
//! Every state transition is written here before its side effects run, so
//! the engine can reconcile the filesystem against these rows after a crash.

pub mod db;
pub mod error;
pub mod models;
pub mod repository;

pub use db::{create_pool, create_test_pool, DatabaseConfig};
pub use error::{Result, StoreError};
pub use models::{
    CacheStatistics, HistoryEntry, HistoryKind, ItemId, ItemState, ManagedItem,
};
pub use repository::{CacheStore, SqliteCacheStore};
