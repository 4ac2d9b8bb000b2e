//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for POSIX hosts (Linux NAS
//! appliances in practice).
//!
//! ## Overview
//!
//! - `CacheFileSystem` using `tokio::fs`, unix symlinks and `fs2` for capacity
//! - `FileTransfer` shelling out to `rsync`
//! - `MediaCatalog` talking to an Emby server over HTTP with `reqwest`
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{RsyncTransfer, TokioFileSystem};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let fs = Arc::new(TokioFileSystem::new());
//!     let transfer = Arc::new(RsyncTransfer::new());
//!
//!     // Hand both to the cache engine
//! }
//! ```

mod catalog;
mod filesystem;
mod transfer;

pub use catalog::EmbyCatalog;
pub use filesystem::TokioFileSystem;
pub use transfer::RsyncTransfer;
