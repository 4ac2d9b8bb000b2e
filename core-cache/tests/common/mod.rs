//! Engine harness over the in-memory bridge fakes

#![allow(dead_code)]

use bridge_traits::mock::{InMemoryFileSystem, ManualClock, ScriptedTransfer};
use bridge_traits::MediaCatalog;
use chrono::{DateTime, TimeZone, Utc};
use core_cache::{
    MediaType, NextEpisode, PlaybackEvent, PlaybackKind, SeriesContext, SmartCache,
};
use core_runtime::EngineConfig;
use core_store::{create_test_pool, CacheStore, ItemId, ManagedItem, SqliteCacheStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const GB: u64 = 1024 * 1024 * 1024;
pub const SLOW: &str = "/mnt/user0";
pub const FAST: &str = "/mnt/cache";
pub const MOVER_IGNORE: &str = "/boot/config/mover_ignore.txt";

pub fn t0() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

pub fn config() -> EngineConfig {
    EngineConfig::new(SLOW, FAST)
        .with_database_path(":memory:")
        .with_mover_ignore_file(MOVER_IGNORE)
        .with_cooldowns(60, 30)
        .with_precache_episodes(2)
        .with_cleanup_delay_hours(24.0)
        .with_min_free_space_gb(10)
        .with_retry_policy(3, 1, 5)
        .with_attempt_timeout_secs(5)
        .with_copy_concurrency(2)
}

pub struct Harness {
    pub fs: Arc<InMemoryFileSystem>,
    pub transfer: Arc<ScriptedTransfer>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<SqliteCacheStore>,
    pub engine: SmartCache,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(config()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        let fs = Arc::new(InMemoryFileSystem::new());
        fs.add_mount(SLOW, 1000 * GB);
        fs.add_mount(FAST, 100 * GB);
        fs.add_mount("/boot", GB);
        let store = Arc::new(SqliteCacheStore::new(create_test_pool().await.unwrap()));
        let clock = Arc::new(ManualClock::new(t0()));
        Self::assemble(config, fs, store, clock, None)
    }

    pub fn assemble(
        config: EngineConfig,
        fs: Arc<InMemoryFileSystem>,
        store: Arc<SqliteCacheStore>,
        clock: Arc<ManualClock>,
        catalog: Option<Arc<dyn MediaCatalog>>,
    ) -> Self {
        let transfer = Arc::new(ScriptedTransfer::new(fs.clone()));
        let mut builder = SmartCache::builder(
            config,
            store.clone() as Arc<dyn CacheStore>,
            fs.clone(),
            transfer.clone(),
        )
        .with_clock(clock.clone());
        if let Some(catalog) = catalog {
            builder = builder.with_catalog(catalog);
        }
        let engine = builder.build().unwrap();
        Self {
            fs,
            transfer,
            clock,
            store,
            engine,
        }
    }

    /// A fresh engine over the same filesystem, store and clock, as after a restart
    pub fn restart(&self) -> Self {
        Self::assemble(
            config(),
            self.fs.clone(),
            self.store.clone(),
            self.clock.clone(),
            None,
        )
    }

    pub fn add_media(&self, relative: &str, len: u64) -> PathBuf {
        let path = Path::new(SLOW).join(relative);
        self.fs.add_file(path.clone(), len);
        path
    }

    pub fn cache_path(relative: &str) -> PathBuf {
        Path::new(FAST).join(relative)
    }

    pub async fn start(&self, user: &str, item: &str, media: MediaType, path: &Path) {
        let event = PlaybackEvent::new(user, item, PlaybackKind::Start, media).with_path(path);
        self.engine.on_playback_event(event).await.unwrap();
    }

    pub async fn start_episode(&self, user: &str, item: &str, path: &Path, next: &[(&str, &Path)]) {
        let series = SeriesContext {
            series_id: "series-1".to_string(),
            episode_index: Some(1),
            next_episodes: next
                .iter()
                .map(|(id, path)| NextEpisode {
                    item_id: ItemId::from(*id),
                    path: Some(path.to_path_buf()),
                })
                .collect(),
        };
        let event = PlaybackEvent::new(user, item, PlaybackKind::Start, MediaType::Episode)
            .with_path(path)
            .with_series(series);
        self.engine.on_playback_event(event).await.unwrap();
    }

    pub async fn stop(&self, user: &str, item: &str, media: MediaType) {
        let event = PlaybackEvent::new(user, item, PlaybackKind::Stop, media);
        self.engine.on_playback_event(event).await.unwrap();
    }

    /// Move the clock, fire due timers and wait for the copies they started
    pub async fn advance(&self, secs: i64) {
        self.clock.advance_secs(secs);
        self.engine.fire_due_timers().await.unwrap();
        self.engine.wait_for_copies().await;
    }

    /// Play a movie through its cooldown until it is cached
    pub async fn cache_movie(&self, item: &str, relative: &str, len: u64) -> PathBuf {
        let source = self.add_media(relative, len);
        self.start("alice", item, MediaType::Movie, &source).await;
        self.advance(61).await;
        source
    }

    pub async fn item(&self, item: &str) -> Option<ManagedItem> {
        self.store.get(&ItemId::from(item)).await.unwrap()
    }
}
