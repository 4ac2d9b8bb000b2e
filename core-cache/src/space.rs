//! Space manager helpers
//!
//! Candidate ordering for pressure eviction and pool usage snapshots for the
//! health report.

use bridge_traits::storage::SpaceInfo;
use core_store::{ItemId, ItemState, ManagedItem};
use serde::Serialize;
use std::collections::HashSet;

/// Cached rows that may be evicted, best candidate first.
///
/// Precache rows go first, then the least recently active, then `item_id`
/// ascending. Items with a started session are never candidates.
pub fn eviction_candidates(items: Vec<ManagedItem>, active: &HashSet<ItemId>) -> Vec<ManagedItem> {
    let mut candidates: Vec<ManagedItem> = items
        .into_iter()
        .filter(|item| matches!(item.state, ItemState::Cached | ItemState::PendingCleanup))
        .filter(|item| !active.contains(&item.item_id))
        .collect();
    candidates.sort_by(|a, b| {
        b.is_precache
            .cmp(&a.is_precache)
            .then(a.last_activity_at.cmp(&b.last_activity_at))
            .then_with(|| a.item_id.cmp(&b.item_id))
    });
    candidates
}

/// Usage of one storage pool
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoolUsage {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
    pub used_percent: f64,
}

impl From<SpaceInfo> for PoolUsage {
    fn from(space: SpaceInfo) -> Self {
        Self {
            total_bytes: space.total_bytes,
            available_bytes: space.available_bytes,
            used_bytes: space.used_bytes(),
            used_percent: space.used_percent(),
        }
    }
}
