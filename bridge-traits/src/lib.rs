//! # Host Bridge Traits
//!
//! Adapter traits at the seams between the cache engine and the host it runs on.
//!
//! ## Overview
//!
//! The engine is written against these traits only. Production adapters live in
//! `bridge-desktop`; in-memory fakes for tests live in [`mock`] behind the
//! `test-support` feature.
//!
//! ## Traits
//!
//! ### Storage
//! - [`CacheFileSystem`](storage::CacheFileSystem) - Link-aware file operations and pool capacity
//! - [`FileTransfer`](transfer::FileTransfer) - External bulk copier (rsync)
//!
//! ### Media Server
//! - [`MediaCatalog`](catalog::MediaCatalog) - Path and next-up lookups
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to an external pipeline
//!
//! ## Error Handling
//!
//! All bridge traits use the [`BridgeError`](error::BridgeError) type. Adapters should:
//!
//! - Convert platform-specific errors to `BridgeError`
//! - Report missing paths so that [`BridgeError::is_not_found`] holds
//! - Include the offending path in error messages
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` bounds; the engine shares adapters
//! between the scheduler loop and the copy workers behind `Arc`.

pub mod catalog;
pub mod error;
pub mod storage;
pub mod time;
pub mod transfer;

#[cfg(any(test, feature = "test-support"))]
pub mod mock;

pub use error::BridgeError;

// Re-export commonly used types
pub use catalog::{CatalogEpisode, MediaCatalog};
pub use storage::{CacheFileSystem, FileMetadata, SpaceInfo};
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, SystemClock};
pub use transfer::{FileTransfer, TransferOptions};
