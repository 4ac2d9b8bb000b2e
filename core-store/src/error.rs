use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cannot open state database {path}: {message}")]
    Open { path: PathBuf, message: String },

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Corrupt row for {item_id}: {message}")]
    CorruptRow { item_id: String, message: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
