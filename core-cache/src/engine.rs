//! # Smart Cache Engine
//!
//! Orchestrates sessions, the state machine, the copy worker pool, the space
//! manager and the scheduler loop.
//!
//! ## Concurrency
//!
//! - Every read-modify-write of a row happens under that item's async lock
//! - Copies run on a [`TaskTracker`] gated by a [`Semaphore`] with
//!   `copy_concurrency` permits
//! - The session table and the timer heap sit behind short synchronous locks
//! - A store failure anywhere, including inside a copy worker, cancels the
//!   fatal token and [`SmartCache::run`] returns the error
//!
//! ## Example
//!
//! ```rust,ignore
//! let engine = SmartCache::builder(config, store, fs, transfer)
//!     .with_catalog(catalog)
//!     .build()?;
//! engine.reconcile().await?;
//! let shutdown = CancellationToken::new();
//! tokio::spawn({
//!     let engine = engine.clone();
//!     let shutdown = shutdown.clone();
//!     async move { engine.run(shutdown).await }
//! });
//! engine.on_playback_event(event).await?;
//! ```

use crate::copy::{CopyEngine, CopyFailure, CopyOutcome, CopyPolicy};
use crate::error::{CacheError, Result};
use crate::mover_ignore::MoverIgnoreList;
use crate::paths::PathMapper;
use crate::scheduler::{TimerKind, TimerQueue};
use crate::session::{
    MediaType, NextEpisode, PendingCooldown, PlaybackEvent, PlaybackKind, Session,
    SessionTracker,
};
use crate::space::{eviction_candidates, PoolUsage};
use crate::state::{transition, Command, MoverIgnoreOp, Trigger, TransitionContext};
use bridge_traits::catalog::MediaCatalog;
use bridge_traits::storage::CacheFileSystem;
use bridge_traits::time::{Clock, SystemClock};
use bridge_traits::transfer::FileTransfer;
use chrono::{DateTime, Utc};
use core_runtime::events::DEFAULT_EVENT_BUFFER_SIZE;
use core_runtime::{CacheEvent, EngineConfig, EventBus};
use core_store::{
    CacheStatistics, CacheStore, HistoryEntry, HistoryKind, ItemId, ItemState, ManagedItem,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify, OwnedMutexGuard, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// Loop wake-up interval when no timer is armed
const IDLE_WAKE_INTERVAL: Duration = Duration::from_secs(60);

/// Result of a cache request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A new copy was queued
    Started,
    /// The row exists and the request changed nothing
    Unchanged(ItemState),
    /// The row exists and was updated (resumed or promoted)
    Updated(ItemState),
    /// Another item already manages the same source path
    Duplicate(ItemId),
    /// An admission filter rejected the request
    Skipped(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub database_ok: bool,
    pub fatal_error: Option<String>,
    pub uptime_secs: i64,
    pub slow_pool: Option<PoolUsage>,
    pub fast_pool: Option<PoolUsage>,
    pub active_copies: usize,
    pub queued_copies: usize,
    pub managed_items: usize,
    pub failed_items: usize,
    pub pending_timers: usize,
}

/// Outcome of running one transition
#[derive(Debug, Clone, Copy)]
pub(crate) struct Applied {
    pub changed: bool,
    pub state: Option<ItemState>,
    pub check_space: bool,
}

/// One async lock per item, created on demand
#[derive(Default)]
struct ItemLocks {
    locks: Mutex<HashMap<ItemId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ItemLocks {
    async fn lock(&self, item_id: &ItemId) -> OwnedMutexGuard<()> {
        let lock = self.locks.lock().entry(item_id.clone()).or_default().clone();
        lock.lock_owned().await
    }

    /// Drop locks nobody holds or waits on
    fn prune(&self) -> usize {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }
}

struct CopyPool {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    queued: AtomicUsize,
    running: AtomicUsize,
    in_flight: Mutex<HashSet<ItemId>>,
}

impl CopyPool {
    fn new(concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            queued: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            in_flight: Mutex::new(HashSet::new()),
        }
    }
}

pub(crate) struct Inner {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<dyn CacheStore>,
    pub(crate) fs: Arc<dyn CacheFileSystem>,
    pub(crate) copier: CopyEngine,
    pub(crate) paths: PathMapper,
    pub(crate) mover_ignore: MoverIgnoreList,
    catalog: Option<Arc<dyn MediaCatalog>>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    sessions: Mutex<SessionTracker>,
    timers: Mutex<TimerQueue>,
    locks: ItemLocks,
    pool: CopyPool,
    space_pass: tokio::sync::Mutex<()>,
    wake: Notify,
    fatal: CancellationToken,
    fatal_error: Mutex<Option<String>>,
    started_at: DateTime<Utc>,
}

/// Handle to the cache engine; clones share the same engine.
#[derive(Clone)]
pub struct SmartCache {
    pub(crate) inner: Arc<Inner>,
}

pub struct SmartCacheBuilder {
    config: EngineConfig,
    store: Arc<dyn CacheStore>,
    fs: Arc<dyn CacheFileSystem>,
    transfer: Arc<dyn FileTransfer>,
    catalog: Option<Arc<dyn MediaCatalog>>,
    clock: Option<Arc<dyn Clock>>,
    events: Option<EventBus>,
}

impl SmartCacheBuilder {
    /// Media server used to resolve paths and next-up episodes
    pub fn with_catalog(mut self, catalog: Arc<dyn MediaCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<SmartCache> {
        self.config.validate()?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let copier = CopyEngine::new(
            self.fs.clone(),
            self.transfer,
            CopyPolicy::from_config(&self.config),
        );
        let paths = PathMapper::new(&self.config);
        let mover_ignore = MoverIgnoreList::new(self.config.mover_ignore_file.clone(), self.fs.clone());
        let pool = CopyPool::new(self.config.copy_concurrency);
        let started_at = clock.now();

        Ok(SmartCache {
            inner: Arc::new(Inner {
                config: self.config,
                store: self.store,
                fs: self.fs,
                copier,
                paths,
                mover_ignore,
                catalog: self.catalog,
                clock,
                events: self
                    .events
                    .unwrap_or_else(|| EventBus::new(DEFAULT_EVENT_BUFFER_SIZE)),
                sessions: Mutex::new(SessionTracker::new()),
                timers: Mutex::new(TimerQueue::new()),
                locks: ItemLocks::default(),
                pool,
                space_pass: tokio::sync::Mutex::new(()),
                wake: Notify::new(),
                fatal: CancellationToken::new(),
                fatal_error: Mutex::new(None),
                started_at,
            }),
        })
    }
}

fn chrono_duration(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration).map_err(|e| CacheError::Config(e.to_string()))
}

impl SmartCache {
    pub fn builder(
        config: EngineConfig,
        store: Arc<dyn CacheStore>,
        fs: Arc<dyn CacheFileSystem>,
        transfer: Arc<dyn FileTransfer>,
    ) -> SmartCacheBuilder {
        SmartCacheBuilder {
            config,
            store,
            fs,
            transfer,
            catalog: None,
            clock: None,
            events: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.fatal.is_cancelled() {
            let message = self.inner.fatal_error.lock().clone().unwrap_or_default();
            return Err(CacheError::Fatal(message));
        }
        Ok(())
    }

    /// Log a failed operation; store failures stop the engine.
    pub(crate) fn report(&self, error: &CacheError, context: &str) {
        if error.is_fatal() {
            error!(context, error = %error, "Fatal engine error");
            let mut slot = self.inner.fatal_error.lock();
            if slot.is_none() {
                *slot = Some(error.to_string());
            }
            self.inner.fatal.cancel();
        } else {
            warn!(context, error = %error, "Operation failed");
        }
    }

    pub(crate) async fn lock_item(&self, item_id: &ItemId) -> OwnedMutexGuard<()> {
        self.inner.locks.lock(item_id).await
    }

    pub(crate) fn schedule_timer(&self, kind: TimerKind, at: DateTime<Utc>) {
        self.inner.timers.lock().schedule(kind, at);
        self.inner.wake.notify_one();
    }

    // ========================================================================
    // Inbound events
    // ========================================================================

    /// Feed one playback event into the engine.
    #[instrument(skip(self, event), fields(item_id = %event.item_id, kind = ?event.kind))]
    pub async fn on_playback_event(&self, event: PlaybackEvent) -> Result<()> {
        self.ensure_running()?;
        let result = match event.kind {
            PlaybackKind::Start => self.on_start(&event).await,
            PlaybackKind::Stop => self.on_stop(&event).await,
            PlaybackKind::Progress => self.on_progress(&event).await,
        };
        if let Err(e) = &result {
            self.report(e, "playback event");
        }
        result
    }

    async fn on_start(&self, event: &PlaybackEvent) -> Result<()> {
        let cooldown = match event.media_type {
            MediaType::Movie => self.inner.config.cooldown_movie(),
            MediaType::Episode => self.inner.config.cooldown_episode(),
            MediaType::Other => {
                debug!("Ignoring playback of unsupported media type");
                return Ok(());
            }
        };
        let cooldown = chrono_duration(cooldown)?;

        let _guard = self.lock_item(&event.item_id).await;
        let now = self.now();
        let current = self.inner.store.get(&event.item_id).await?;

        match current.as_ref().map(|item| item.state) {
            Some(ItemState::Copying | ItemState::Cached | ItemState::PendingCleanup) => {
                self.inner.sessions.lock().start(event, now, None);
                self.apply(current.as_ref(), Trigger::PlaybackResumed).await?;
            }
            Some(ItemState::Failed | ItemState::Evicted) => {
                self.inner.sessions.lock().start(event, now, None);
                debug!("Item is not eligible for a new request");
            }
            Some(ItemState::CooldownPending) | None => {
                let armed = self.inner.sessions.lock().start(event, now, Some(cooldown));
                if let Some(expires_at) = armed {
                    self.schedule_timer(TimerKind::Cooldown(event.item_id.clone()), expires_at);
                    info!(expires_at = %expires_at, "Cooldown armed");
                }
            }
        }
        Ok(())
    }

    async fn on_stop(&self, event: &PlaybackEvent) -> Result<()> {
        let now = self.now();
        let outcome = self.inner.sessions.lock().stop(event, now);
        if outcome.cancelled_cooldown {
            self.inner
                .timers
                .lock()
                .cancel(&TimerKind::Cooldown(event.item_id.clone()));
            info!("Playback stopped before cooldown expired, request dropped");
        }
        if outcome.still_active || !self.inner.config.delete_on_stop {
            return Ok(());
        }

        let deadline = now + chrono_duration(self.inner.config.cleanup_delay())?;
        let _guard = self.lock_item(&event.item_id).await;
        let current = self.inner.store.get(&event.item_id).await?;
        if current.is_some() {
            self.apply(current.as_ref(), Trigger::PlaybackStopped { deadline })
                .await?;
        }
        Ok(())
    }

    async fn on_progress(&self, event: &PlaybackEvent) -> Result<()> {
        let now = self.now();
        self.inner.sessions.lock().progress(event, now);

        let _guard = self.lock_item(&event.item_id).await;
        let current = self.inner.store.get(&event.item_id).await?;
        if current.as_ref().is_some_and(|item| item.state.is_linked()) {
            self.apply(current.as_ref(), Trigger::Activity).await?;
        }
        Ok(())
    }

    async fn on_cooldown_expired(&self, item_id: &ItemId) -> Result<()> {
        let now = self.now();
        let Some(pending) = self.inner.sessions.lock().take_due_cooldown(item_id, now) else {
            debug!(item_id = %item_id, "Cooldown expired without an active session");
            return Ok(());
        };

        match self.request_cache(item_id, pending.path.clone(), false).await {
            Ok(outcome) => debug!(item_id = %item_id, ?outcome, "Primary request handled"),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(item_id = %item_id, error = %e, "Primary request failed"),
        }

        if pending.media_type == MediaType::Episode && self.inner.config.precache_episodes > 0 {
            self.precache_next(&pending).await?;
        }
        Ok(())
    }

    async fn precache_next(&self, pending: &PendingCooldown) -> Result<()> {
        let limit = self.inner.config.precache_episodes;
        let Some(series) = &pending.series else {
            return Ok(());
        };

        let next: Vec<NextEpisode> = if !series.next_episodes.is_empty() {
            series.next_episodes.iter().take(limit).cloned().collect()
        } else if let Some(catalog) = &self.inner.catalog {
            match catalog
                .next_episodes(&pending.user_id, &series.series_id, limit)
                .await
            {
                Ok(episodes) => episodes
                    .into_iter()
                    .map(|episode| NextEpisode {
                        item_id: ItemId::from(episode.item_id),
                        path: episode.path,
                    })
                    .collect(),
                Err(e) => {
                    warn!(series_id = %series.series_id, error = %e, "Next-up lookup failed");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        for episode in next {
            match self.request_cache(&episode.item_id, episode.path, true).await {
                Ok(outcome) => debug!(item_id = %episode.item_id, ?outcome, "Precache request handled"),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(item_id = %episode.item_id, error = %e, "Precache request failed"),
            }
        }
        Ok(())
    }

    // ========================================================================
    // Cache requests
    // ========================================================================

    /// Request that an item be cached, bypassing the cooldown.
    ///
    /// `path_hint` is the media server's path for the item; without it the
    /// catalog is asked, then any existing row.
    #[instrument(skip(self, path_hint), fields(item_id = %item_id))]
    pub async fn request_cache(
        &self,
        item_id: &ItemId,
        path_hint: Option<PathBuf>,
        is_precache: bool,
    ) -> Result<RequestOutcome> {
        self.ensure_running()?;
        let _guard = self.lock_item(item_id).await;
        let now = self.now();
        let current = self.inner.store.get(item_id).await?;

        if let Some(existing) = current
            .as_ref()
            .filter(|item| item.state != ItemState::CooldownPending)
        {
            let trigger = Trigger::CacheRequested {
                item_id: item_id.clone(),
                source_path: existing.source_path.clone(),
                cache_path: existing.cache_path.clone(),
                is_precache,
            };
            let applied = self.apply(Some(existing), trigger).await?;
            return Ok(match applied.state {
                Some(state) if applied.changed => RequestOutcome::Updated(state),
                _ => RequestOutcome::Unchanged(existing.state),
            });
        }

        if !self.inner.config.enabled {
            return self.skip(item_id, current.as_ref(), "engine disabled").await;
        }

        let media_path = match path_hint {
            Some(path) => Some(path),
            None => self.resolve_path(item_id).await,
        }
        .or_else(|| current.as_ref().map(|item| item.source_path.clone()));
        let Some(media_path) = media_path else {
            return self.skip(item_id, current.as_ref(), "no media path").await;
        };

        let mapped = match self.inner.paths.map(&media_path) {
            Ok(mapped) => mapped,
            Err(e) => {
                self.inner
                    .store
                    .log_event(item_id, HistoryKind::Skipped, &e.to_string(), None, now)
                    .await?;
                self.drop_pending_row(current.as_ref()).await?;
                return Err(e);
            }
        };
        let source = &mapped.source_path;

        if !self.inner.paths.has_allowed_extension(source) {
            return self
                .skip(item_id, current.as_ref(), "extension not allowed")
                .await;
        }
        if let Some(pattern) = self.inner.paths.excluded_by(source) {
            let reason = format!("matches exclude pattern '{}'", pattern);
            return self.skip(item_id, current.as_ref(), &reason).await;
        }
        if let Some(other) = self.inner.store.find_by_source_path(source).await? {
            if &other.item_id != item_id {
                let reason = format!("source already managed by {}", other.item_id);
                self.skip(item_id, current.as_ref(), &reason).await?;
                return Ok(RequestOutcome::Duplicate(other.item_id));
            }
        }

        let meta = match self.inner.fs.symlink_metadata(source).await {
            Ok(meta) => meta,
            Err(e) if e.is_not_found() => {
                return self.skip(item_id, current.as_ref(), "source missing").await;
            }
            Err(e) => return Err(e.into()),
        };
        if meta.is_symlink {
            return self
                .skip(item_id, current.as_ref(), "source is already a link")
                .await;
        }
        if !meta.is_regular_file() {
            return self
                .skip(item_id, current.as_ref(), "source is not a regular file")
                .await;
        }
        if let Some(max) = self.inner.config.max_file_size_bytes() {
            if meta.size > max {
                let reason = format!("{} bytes exceeds size limit", meta.size);
                return self.skip(item_id, current.as_ref(), &reason).await;
            }
        }
        if self.inner.config.skip_hardlinks && meta.link_count > 1 {
            return self
                .skip(item_id, current.as_ref(), "source has other hard links")
                .await;
        }

        let trigger = Trigger::CacheRequested {
            item_id: item_id.clone(),
            source_path: mapped.source_path.clone(),
            cache_path: mapped.cache_path.clone(),
            is_precache,
        };
        let applied = self.apply(current.as_ref(), trigger).await?;
        Ok(if applied.changed {
            RequestOutcome::Started
        } else {
            RequestOutcome::Unchanged(applied.state.unwrap_or(ItemState::CooldownPending))
        })
    }

    async fn resolve_path(&self, item_id: &ItemId) -> Option<PathBuf> {
        let catalog = self.inner.catalog.as_ref()?;
        match catalog.resolve_path(item_id.as_str()).await {
            Ok(path) => path,
            Err(e) => {
                warn!(item_id = %item_id, error = %e, "Path lookup failed");
                None
            }
        }
    }

    async fn skip(
        &self,
        item_id: &ItemId,
        current: Option<&ManagedItem>,
        reason: &str,
    ) -> Result<RequestOutcome> {
        info!(item_id = %item_id, reason, "Cache request skipped");
        self.inner
            .store
            .log_event(item_id, HistoryKind::Skipped, reason, None, self.now())
            .await?;
        self.drop_pending_row(current).await?;
        Ok(RequestOutcome::Skipped(reason.to_string()))
    }

    /// A re-request queued by reconcile leaves a CooldownPending row behind
    async fn drop_pending_row(&self, current: Option<&ManagedItem>) -> Result<()> {
        if let Some(item) = current.filter(|item| item.state == ItemState::CooldownPending) {
            self.inner.store.delete(&item.item_id).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    fn transition_context(&self) -> Result<TransitionContext> {
        Ok(TransitionContext {
            now: self.now(),
            failed_retry_delay: chrono_duration(self.inner.config.retry_max_delay())?,
        })
    }

    /// Run `trigger` against `current` and execute the resulting commands in
    /// order. The caller holds the item lock. The first failing command stops
    /// the sequence.
    pub(crate) async fn apply(
        &self,
        current: Option<&ManagedItem>,
        trigger: Trigger,
    ) -> Result<Applied> {
        let ctx = self.transition_context()?;
        let Some(step) = transition(current, &trigger, &ctx) else {
            return Ok(Applied {
                changed: false,
                state: current.map(|item| item.state),
                check_space: false,
            });
        };
        let Some(item) = step.item.as_ref().or(current) else {
            return Ok(Applied {
                changed: false,
                state: None,
                check_space: false,
            });
        };
        debug!(
            item_id = %item.item_id,
            from = ?current.map(|c| c.state),
            to = ?step.state(),
            "Applying transition"
        );

        let mut check_space = false;
        for command in &step.commands {
            match command {
                Command::Persist => self.inner.store.put(item).await?,
                Command::DeleteRecord => {
                    self.inner.store.delete(&item.item_id).await?;
                }
                Command::StartCopy => self.spawn_copy(item.clone()),
                Command::RestoreOriginal => self.restore_original(item).await?,
                Command::DeleteCacheFile => self.delete_cache_file(item).await?,
                Command::MoverIgnore(op) => {
                    let result = match op {
                        MoverIgnoreOp::Add => self.inner.mover_ignore.add(&item.source_path).await,
                        MoverIgnoreOp::Remove => {
                            self.inner.mover_ignore.remove(&item.source_path).await
                        }
                    };
                    if let Err(e) = result {
                        warn!(item_id = %item.item_id, error = %e, "Mover ignore update failed");
                    }
                }
                Command::ScheduleTimer(slot, at) => {
                    self.schedule_timer(TimerKind::for_slot(*slot, &item.item_id), *at);
                }
                Command::CancelTimer(slot) => {
                    self.inner
                        .timers
                        .lock()
                        .cancel(&TimerKind::for_slot(*slot, &item.item_id));
                }
                Command::CheckSpace => check_space = true,
                Command::Notify(kind, detail) => {
                    let event = CacheEvent::new(*kind, item.item_id.as_str(), detail.as_str())
                        .with_timestamp(ctx.now);
                    // No subscribers is fine
                    let _ = self.inner.events.emit(event);
                }
                Command::Record(kind, detail, bytes) => {
                    self.inner
                        .store
                        .log_event(&item.item_id, *kind, detail, *bytes, ctx.now)
                        .await?;
                }
            }
        }

        Ok(Applied {
            changed: true,
            state: step.state(),
            check_space,
        })
    }

    /// Put the original file back at `source_path`.
    ///
    /// Uses the preserved hard link when present. Without one, a link to the
    /// cache file is replaced by a copy of it. A regular file at the source
    /// means the original is already in place.
    pub(crate) async fn restore_original(&self, item: &ManagedItem) -> Result<()> {
        let fs = &self.inner.fs;
        fs.remove_if_exists(&item.temp_link_path()).await?;

        let preserved = item.preserved_path();
        match fs.symlink_metadata(&preserved).await {
            Ok(meta) if meta.is_regular_file() => {
                fs.rename(&preserved, &item.source_path).await?;
                debug!(item_id = %item.item_id, "Original restored");
                return Ok(());
            }
            Ok(_) => {
                return Err(CacheError::CorruptState {
                    item_id: item.item_id.to_string(),
                    message: "preserved original is not a regular file".to_string(),
                })
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        match fs.read_link(&item.source_path).await {
            Ok(None) => Ok(()),
            Ok(Some(target)) if target == item.cache_path => {
                if !fs.exists(&item.cache_path).await? {
                    return Err(CacheError::CorruptState {
                        item_id: item.item_id.to_string(),
                        message: "original and cache copy are both gone".to_string(),
                    });
                }
                self.inner
                    .copier
                    .copy_back(&item.cache_path, &item.source_path)
                    .await?;
                Ok(())
            }
            Ok(Some(target)) => Err(CacheError::CorruptState {
                item_id: item.item_id.to_string(),
                message: format!("source links to unexpected target {}", target.display()),
            }),
            Err(e) if e.is_not_found() => {
                if fs.exists(&item.cache_path).await? {
                    self.inner
                        .copier
                        .copy_back(&item.cache_path, &item.source_path)
                        .await?;
                    Ok(())
                } else {
                    Err(CacheError::CorruptState {
                        item_id: item.item_id.to_string(),
                        message: "original and cache copy are both gone".to_string(),
                    })
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the cache file and partial copy. Refuses while the source still
    /// links to the cache file.
    pub(crate) async fn delete_cache_file(&self, item: &ManagedItem) -> Result<()> {
        let fs = &self.inner.fs;
        if !self.inner.paths.is_under_fast_root(&item.cache_path) {
            return Err(CacheError::PathTraversal(item.cache_path.display().to_string()));
        }
        if let Ok(Some(target)) = fs.read_link(&item.source_path).await {
            if target == item.cache_path {
                return Err(CacheError::CorruptState {
                    item_id: item.item_id.to_string(),
                    message: "source still links to the cache file".to_string(),
                });
            }
        }
        fs.remove_if_exists(&item.cache_path).await?;
        fs.remove_if_exists(&item.partial_path()).await?;
        Ok(())
    }

    // ========================================================================
    // Copy workers
    // ========================================================================

    fn spawn_copy(&self, item: ManagedItem) {
        let pool = &self.inner.pool;
        if !pool.in_flight.lock().insert(item.item_id.clone()) {
            debug!(item_id = %item.item_id, "Copy already in flight");
            return;
        }
        pool.queued.fetch_add(1, Ordering::SeqCst);

        let engine = self.clone();
        pool.tracker.spawn(async move {
            let pool = &engine.inner.pool;
            let permit = tokio::select! {
                _ = pool.cancel.cancelled() => None,
                permit = pool.permits.clone().acquire_owned() => permit.ok(),
            };
            pool.queued.fetch_sub(1, Ordering::SeqCst);
            let Some(permit) = permit else {
                pool.in_flight.lock().remove(&item.item_id);
                return;
            };

            pool.running.fetch_add(1, Ordering::SeqCst);
            let result = tokio::select! {
                _ = pool.cancel.cancelled() => None,
                result = engine.inner.copier.copy(&item.source_path, &item.cache_path) => Some(result),
            };
            pool.running.fetch_sub(1, Ordering::SeqCst);
            drop(permit);

            let Some(result) = result else {
                pool.in_flight.lock().remove(&item.item_id);
                info!(item_id = %item.item_id, "Copy interrupted by shutdown");
                return;
            };
            if let Err(e) = engine.finish_copy(&item.item_id, result).await {
                engine.report(&e, "copy completion");
            }
        });
    }

    async fn finish_copy(
        &self,
        item_id: &ItemId,
        result: std::result::Result<CopyOutcome, CopyFailure>,
    ) -> Result<()> {
        let guard = self.lock_item(item_id).await;
        self.inner.pool.in_flight.lock().remove(item_id);
        let current = self.inner.store.get(item_id).await?;

        let mut low_space = false;
        let trigger = match result {
            Ok(outcome) => Trigger::CopySucceeded {
                bytes: outcome.bytes,
                retries: outcome.retries,
            },
            Err(failure) => {
                low_space = matches!(failure.error, CacheError::InsufficientSpace { .. });
                let abandon = matches!(
                    failure.error,
                    CacheError::PathTraversal(_)
                        | CacheError::InvalidSource(_)
                        | CacheError::CorruptState { .. }
                );
                warn!(item_id = %item_id, error = %failure.error, retries = failure.retries, "Copy failed");
                Trigger::CopyFailed {
                    error: failure.error.to_string(),
                    retries: failure.retries,
                    abandon,
                }
            }
        };
        let applied = self.apply(current.as_ref(), trigger).await?;
        drop(guard);

        if applied.check_space || low_space {
            self.check_and_evict().await?;
        }
        Ok(())
    }

    /// Wait until every queued and running copy has finished.
    pub async fn wait_for_copies(&self) {
        let tracker = &self.inner.pool.tracker;
        tracker.close();
        tracker.wait().await;
        tracker.reopen();
    }

    // ========================================================================
    // Space manager
    // ========================================================================

    /// Evict cached items until the fast pool is back above its reserve.
    ///
    /// Returns the number of evicted items.
    #[instrument(skip(self))]
    pub async fn check_and_evict(&self) -> Result<usize> {
        let _pass = self.inner.space_pass.lock().await;
        let reserve = self.inner.config.min_free_space_bytes();
        let mut evicted = 0usize;
        let mut passed_over: HashSet<ItemId> = HashSet::new();

        loop {
            let space = self.inner.fs.space(self.inner.paths.fast_root()).await?;
            if space.available_bytes >= reserve {
                break;
            }

            let active = self.inner.sessions.lock().active_items();
            let candidates = eviction_candidates(self.inner.store.list_all().await?, &active);
            let Some(candidate) = candidates
                .into_iter()
                .find(|item| !passed_over.contains(&item.item_id))
            else {
                warn!(
                    available = space.available_bytes,
                    reserve, "Fast pool below reserve and nothing left to evict"
                );
                break;
            };

            let _guard = self.lock_item(&candidate.item_id).await;
            let current = self.inner.store.get(&candidate.item_id).await?;
            let still_evictable = current.as_ref().is_some_and(|item| item.state.is_linked())
                && !self.inner.sessions.lock().is_active(&candidate.item_id);
            if !still_evictable {
                passed_over.insert(candidate.item_id);
                continue;
            }

            let trigger = Trigger::ForceEvict {
                reason: "space pressure".to_string(),
            };
            match self.apply(current.as_ref(), trigger).await {
                Ok(_) => {
                    evicted += 1;
                    info!(
                        item_id = %candidate.item_id,
                        bytes = candidate.size_bytes,
                        "Evicted under space pressure"
                    );
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(item_id = %candidate.item_id, error = %e, "Eviction failed");
                    passed_over.insert(candidate.item_id);
                }
            }
        }

        Ok(evicted)
    }

    // ========================================================================
    // Scheduler loop
    // ========================================================================

    pub(crate) fn schedule_maintenance(&self, now: DateTime<Utc>) -> Result<()> {
        let interval = chrono_duration(self.inner.config.maintenance_interval())?;
        self.schedule_timer(TimerKind::Maintenance, now + interval);
        Ok(())
    }

    /// Run every timer due at `now`. Only fatal errors are returned.
    pub async fn fire_due_timers(&self) -> Result<usize> {
        let now = self.now();
        let due = self.inner.timers.lock().pop_due(now);
        let count = due.len();

        for (kind, _) in due {
            let result = match &kind {
                TimerKind::Cooldown(item_id) => self.on_cooldown_expired(item_id).await,
                TimerKind::Cleanup(item_id) => self.on_item_timer(item_id, Trigger::CleanupDue).await,
                TimerKind::FailedRetry(item_id) => {
                    self.on_item_timer(item_id, Trigger::FailedRetryDue).await
                }
                TimerKind::Maintenance => self.run_maintenance().await,
            };
            if let Err(e) = result {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(timer = ?kind, error = %e, "Timer handler failed");
            }
        }
        Ok(count)
    }

    async fn on_item_timer(&self, item_id: &ItemId, trigger: Trigger) -> Result<()> {
        let _guard = self.lock_item(item_id).await;
        let current = self.inner.store.get(item_id).await?;
        self.apply(current.as_ref(), trigger).await?;
        Ok(())
    }

    /// Drive timers until `shutdown` is cancelled or a fatal error occurs.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.schedule_maintenance(self.now())?;
        info!("Scheduler loop started");

        let result = loop {
            if let Err(e) = self.fire_due_timers().await {
                self.report(&e, "scheduler");
                break Err(e);
            }

            let next = self.inner.timers.lock().next_deadline();
            let sleep_for = next
                .map(|at| (at - self.now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(IDLE_WAKE_INTERVAL);

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                _ = self.inner.fatal.cancelled() => {
                    let message = self.inner.fatal_error.lock().clone().unwrap_or_default();
                    error!(error = %message, "Scheduler loop stopping after fatal error");
                    break Err(CacheError::Fatal(message));
                }
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        };

        self.stop_copies().await;
        result
    }

    /// Abort queued and running copies; their rows are left in Copying for
    /// reconcile to pick up.
    pub async fn stop_copies(&self) {
        let pool = &self.inner.pool;
        pool.cancel.cancel();
        pool.tracker.close();
        pool.tracker.wait().await;
    }

    #[instrument(skip(self))]
    async fn run_maintenance(&self) -> Result<()> {
        let now = self.now();
        self.schedule_maintenance(now)?;

        if let Err(e) = self.check_and_evict().await {
            if e.is_fatal() {
                return Err(e);
            }
            warn!(error = %e, "Space check failed");
        }

        for item in self.inner.store.list_by_state(ItemState::Evicted).await? {
            let _guard = self.lock_item(&item.item_id).await;
            let current = self.inner.store.get(&item.item_id).await?;
            match self.apply(current.as_ref(), Trigger::ResumeEviction).await {
                Ok(_) => info!(item_id = %item.item_id, "Interrupted eviction completed"),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(item_id = %item.item_id, error = %e, "Eviction still failing"),
            }
        }

        let retention = chrono_duration(self.inner.config.failed_retention())?;
        let mut collected = 0usize;
        for item in self.inner.store.list_by_state(ItemState::Failed).await? {
            if item.retry_at.is_some() || item.updated_at + retention > now {
                continue;
            }
            let _guard = self.lock_item(&item.item_id).await;
            if self.inner.store.delete(&item.item_id).await? {
                collected += 1;
            }
        }

        let session_cutoff = now - chrono_duration(self.inner.config.maintenance_interval())?;
        let pruned_sessions = self.inner.sessions.lock().prune_stopped(session_cutoff);
        let pruned_locks = self.inner.locks.prune();

        debug!(
            collected,
            pruned_sessions, pruned_locks, "Maintenance pass complete"
        );
        Ok(())
    }

    // ========================================================================
    // Manual operations
    // ========================================================================

    /// Evict a cached item now.
    #[instrument(skip(self))]
    pub async fn force_cleanup(&self, item_id: &ItemId) -> Result<()> {
        self.ensure_running()?;
        let _guard = self.lock_item(item_id).await;
        let current = self
            .inner
            .store
            .get(item_id)
            .await?
            .ok_or_else(|| CacheError::ItemNotFound(item_id.to_string()))?;
        if !current.state.is_linked() {
            return Err(CacheError::InvalidOperation {
                item_id: item_id.to_string(),
                message: format!("cannot clean up an item in state {}", current.state),
            });
        }
        let trigger = Trigger::ForceEvict {
            reason: "manual cleanup".to_string(),
        };
        self.apply(Some(&current), trigger).await?;
        Ok(())
    }

    /// Drop a failed row so the item can be requested again.
    #[instrument(skip(self))]
    pub async fn reset_failed(&self, item_id: &ItemId) -> Result<()> {
        self.ensure_running()?;
        let _guard = self.lock_item(item_id).await;
        let current = self
            .inner
            .store
            .get(item_id)
            .await?
            .ok_or_else(|| CacheError::ItemNotFound(item_id.to_string()))?;
        if current.state != ItemState::Failed {
            return Err(CacheError::InvalidOperation {
                item_id: item_id.to_string(),
                message: format!("only failed items can be reset, found {}", current.state),
            });
        }
        self.inner
            .timers
            .lock()
            .cancel(&TimerKind::FailedRetry(item_id.clone()));
        self.inner.store.delete(item_id).await?;
        self.inner
            .store
            .log_event(item_id, HistoryKind::Reset, "manual reset", None, self.now())
            .await?;
        info!("Failed item reset");
        Ok(())
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub async fn managed_items(&self) -> Result<Vec<ManagedItem>> {
        Ok(self.inner.store.list_all().await?)
    }

    pub async fn item(&self, item_id: &ItemId) -> Result<Option<ManagedItem>> {
        Ok(self.inner.store.get(item_id).await?)
    }

    /// Queued plus running copies
    pub fn queue_depth(&self) -> usize {
        self.inner.pool.queued.load(Ordering::SeqCst) + self.active_copies()
    }

    pub fn active_copies(&self) -> usize {
        self.inner.pool.running.load(Ordering::SeqCst)
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        Ok(self.inner.store.history(limit).await?)
    }

    pub async fn statistics(&self) -> Result<CacheStatistics> {
        Ok(self.inner.store.statistics().await?)
    }

    pub async fn mover_ignore_entries(&self) -> Result<Vec<PathBuf>> {
        self.inner.mover_ignore.entries().await
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.inner.sessions.lock().sessions()
    }

    pub fn timer_deadline(&self, kind: &TimerKind) -> Option<DateTime<Utc>> {
        self.inner.timers.lock().deadline(kind)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    pub async fn health(&self) -> HealthReport {
        let fs = &self.inner.fs;
        let slow_pool = fs.space(self.inner.paths.slow_root()).await.ok().map(PoolUsage::from);
        let fast_pool = fs.space(self.inner.paths.fast_root()).await.ok().map(PoolUsage::from);

        let database_ok = self.inner.store.health_check().await.is_ok();
        let (managed_items, failed_items) = match self.inner.store.list_all().await {
            Ok(items) => (
                items.len(),
                items.iter().filter(|i| i.state == ItemState::Failed).count(),
            ),
            Err(_) => (0, 0),
        };
        let fatal_error = self.inner.fatal_error.lock().clone();

        HealthReport {
            healthy: database_ok && fatal_error.is_none(),
            database_ok,
            fatal_error,
            uptime_secs: (self.now() - self.inner.started_at).num_seconds(),
            slow_pool,
            fast_pool,
            active_copies: self.active_copies(),
            queued_copies: self.inner.pool.queued.load(Ordering::SeqCst),
            managed_items,
            failed_items,
            pending_timers: self.inner.timers.lock().len(),
        }
    }
}
