use bridge_traits::error::BridgeError;
use core_store::StoreError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Copy failed: {0}")]
    TransientCopy(String),

    #[error("Insufficient space on fast pool: {required} bytes required, {available} available")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("Path escapes the storage roots: {0}")]
    PathTraversal(String),

    #[error("Source is not a regular file: {}", .0.display())]
    InvalidSource(PathBuf),

    #[error("Corrupt state for item {item_id}: {message}")]
    CorruptState { item_id: String, message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid playback event: {0}")]
    InvalidEvent(String),

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("Invalid operation on {item_id}: {message}")]
    InvalidOperation { item_id: String, message: String },

    #[error("Engine stopped after fatal error: {0}")]
    Fatal(String),
}

impl CacheError {
    /// Store failures stop the engine; everything else is per-item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CacheError::Store(_) | CacheError::Fatal(_))
    }

    /// Whether another copy attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::TransientCopy(_))
    }
}

impl From<core_runtime::Error> for CacheError {
    fn from(error: core_runtime::Error) -> Self {
        CacheError::Config(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
