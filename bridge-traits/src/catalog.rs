//! Media Server Catalog Abstraction
//!
//! Playback webhooks do not always carry file paths or the upcoming episodes
//! of a series. The engine falls back to a [`MediaCatalog`] for both.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Result;

/// An upcoming episode returned by a next-up query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEpisode {
    pub item_id: String,
    pub path: Option<PathBuf>,
}

/// Read-only lookups against the media server library
#[async_trait]
pub trait MediaCatalog: Send + Sync {
    /// Path of the media file backing an item, as the media server sees it
    async fn resolve_path(&self, item_id: &str) -> Result<Option<PathBuf>>;

    /// Episodes following the user's current position in a series, in play order
    async fn next_episodes(
        &self,
        user_id: &str,
        series_id: &str,
        limit: usize,
    ) -> Result<Vec<CatalogEpisode>>;
}
