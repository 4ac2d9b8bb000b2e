//! Startup reconciliation
//!
//! Brings the filesystem and the store back into agreement after a restart or
//! crash. Runs before the scheduler loop and before any webhook is accepted.

use crate::engine::SmartCache;
use crate::error::{CacheError, Result};
use crate::scheduler::TimerKind;
use crate::state::Trigger;
use chrono::{DateTime, Duration, Utc};
use core_runtime::logging::strip_path;
use core_store::models::PARTIAL_SUFFIX;
use core_store::{HistoryKind, ItemId, ItemState, ManagedItem};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, info, instrument, warn};

/// Partial copies younger than this may still belong to a running copier
const ORPHAN_PARTIAL_AGE_SECS: i64 = 3600;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Interrupted copies whose link swap had already completed
    pub promoted: usize,
    /// Items re-requested without a cooldown
    pub requeued: usize,
    /// Rows dropped because their link or cache file was gone
    pub recovered: usize,
    /// Pending cleanups past their deadline, evicted now
    pub evicted: usize,
    /// Cleanup and retry timers armed again
    pub rearmed: usize,
    pub resumed_evictions: usize,
    pub orphans_removed: usize,
}

impl SmartCache {
    /// Reconcile every stored row against the filesystem.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let now = self.now();
        let mut report = ReconcileReport::default();
        let mut requeue: Vec<(ItemId, PathBuf, bool)> = Vec::new();
        let mut check_space = false;

        for item in self.inner.store.list_all().await? {
            let result = self
                .reconcile_item(&item, now, &mut report, &mut requeue, &mut check_space)
                .await;
            if let Err(e) = result {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(item_id = %item.item_id, state = %item.state, error = %e, "Reconcile failed for item");
            }
        }

        match self.remove_orphan_partials(now).await {
            Ok(removed) => report.orphans_removed = removed,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(error = %e, "Orphan partial sweep failed"),
        }

        if check_space {
            self.check_and_evict().await?;
        }

        for (item_id, source_path, is_precache) in requeue {
            match self.request_cache(&item_id, Some(source_path), is_precache).await {
                Ok(outcome) => {
                    report.requeued += 1;
                    debug!(item_id = %item_id, ?outcome, "Re-requested after restart");
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(item_id = %item_id, error = %e, "Re-request failed"),
            }
        }

        info!(?report, "Reconcile complete");
        Ok(report)
    }

    async fn reconcile_item(
        &self,
        item: &ManagedItem,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
        requeue: &mut Vec<(ItemId, PathBuf, bool)>,
        check_space: &mut bool,
    ) -> Result<()> {
        let _guard = self.lock_item(&item.item_id).await;

        match item.state {
            ItemState::Copying => {
                let linked = self
                    .inner
                    .copier
                    .linked_size(&item.source_path, &item.cache_path)
                    .await?;
                if let Some(bytes) = linked {
                    let trigger = Trigger::CopySucceeded {
                        bytes,
                        retries: item.retry_count,
                    };
                    let applied = self.apply(Some(item), trigger).await?;
                    *check_space |= applied.check_space;
                    report.promoted += 1;
                    return Ok(());
                }

                self.clean_interrupted_copy(item).await?;
                let mut pending = item.clone();
                pending.state = ItemState::CooldownPending;
                pending.updated_at = now;
                self.inner.store.put(&pending).await?;
                requeue.push((item.item_id.clone(), item.source_path.clone(), item.is_precache));
            }

            ItemState::CooldownPending => {
                requeue.push((item.item_id.clone(), item.source_path.clone(), item.is_precache));
            }

            ItemState::Cached | ItemState::PendingCleanup => {
                let linked = self
                    .inner
                    .copier
                    .linked_size(&item.source_path, &item.cache_path)
                    .await?;
                if linked.is_none() {
                    self.recover_broken_link(item, now).await?;
                    report.recovered += 1;
                    return Ok(());
                }

                if let Err(e) = self.inner.mover_ignore.add(&item.source_path).await {
                    warn!(item_id = %item.item_id, error = %e, "Mover ignore update failed");
                }

                if item.state == ItemState::PendingCleanup {
                    match item.cleanup_deadline_at {
                        Some(deadline) if deadline > now => {
                            self.schedule_timer(TimerKind::Cleanup(item.item_id.clone()), deadline);
                            report.rearmed += 1;
                        }
                        _ => {
                            let trigger = Trigger::ForceEvict {
                                reason: "cleanup deadline passed while stopped".to_string(),
                            };
                            self.apply(Some(item), trigger).await?;
                            report.evicted += 1;
                        }
                    }
                }
            }

            ItemState::Evicted => {
                self.apply(Some(item), Trigger::ResumeEviction).await?;
                report.resumed_evictions += 1;
            }

            ItemState::Failed => {
                if let (Some(retry_at), false) = (item.retry_at, item.failed_retry_used) {
                    self.schedule_timer(TimerKind::FailedRetry(item.item_id.clone()), retry_at);
                    report.rearmed += 1;
                }
            }
        }
        Ok(())
    }

    /// Undo whatever an interrupted copy left behind; the original ends up as
    /// a regular file at the source path.
    async fn clean_interrupted_copy(&self, item: &ManagedItem) -> Result<()> {
        let fs = &self.inner.fs;
        fs.remove_if_exists(&item.partial_path()).await?;
        self.restore_original(item).await?;
        fs.remove_if_exists(&item.preserved_path()).await?;
        self.delete_cache_file(item).await?;
        debug!(item_id = %item.item_id, "Interrupted copy cleaned up");
        Ok(())
    }

    async fn recover_broken_link(&self, item: &ManagedItem, now: DateTime<Utc>) -> Result<()> {
        let error = CacheError::CorruptState {
            item_id: item.item_id.to_string(),
            message: "link or cache file missing".to_string(),
        };
        warn!(error = %error, "Recovering item");

        self.restore_original(item).await?;
        self.delete_cache_file(item).await?;
        if let Err(e) = self.inner.mover_ignore.remove(&item.source_path).await {
            warn!(item_id = %item.item_id, error = %e, "Mover ignore update failed");
        }
        self.inner.store.delete(&item.item_id).await?;
        self.inner
            .store
            .log_event(&item.item_id, HistoryKind::Recovered, &error.to_string(), None, now)
            .await?;
        Ok(())
    }

    /// Remove `*.partial` files under the fast root that no copy owns.
    async fn remove_orphan_partials(&self, now: DateTime<Utc>) -> Result<usize> {
        let fs = &self.inner.fs;
        let owned: HashSet<PathBuf> = self
            .inner
            .store
            .list_by_state(ItemState::Copying)
            .await?
            .iter()
            .map(ManagedItem::partial_path)
            .collect();
        let cutoff = (now - Duration::seconds(ORPHAN_PARTIAL_AGE_SECS)).timestamp();

        let mut removed = 0usize;
        let mut pending = vec![self.inner.paths.fast_root().to_path_buf()];
        while let Some(dir) = pending.pop() {
            let children = match fs.list_directory(&dir).await {
                Ok(children) => children,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            for child in children {
                let meta = match fs.symlink_metadata(&child).await {
                    Ok(meta) => meta,
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e.into()),
                };
                if meta.is_directory {
                    pending.push(child);
                    continue;
                }
                let is_partial = child
                    .file_name()
                    .is_some_and(|name| name.to_string_lossy().ends_with(PARTIAL_SUFFIX));
                let is_stale = meta.modified_at.is_some_and(|modified| modified < cutoff);
                if is_partial && is_stale && !owned.contains(&child) && fs.remove_if_exists(&child).await? {
                    info!(file = %strip_path(&child), "Removed orphaned partial copy");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}
