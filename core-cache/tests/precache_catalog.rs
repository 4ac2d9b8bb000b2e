//! Path resolution and next-up lookups through the media catalog

mod common;

use async_trait::async_trait;
use bridge_traits::catalog::{CatalogEpisode, MediaCatalog};
use bridge_traits::error::{BridgeError, Result};
use bridge_traits::mock::{InMemoryFileSystem, ManualClock, StaticCatalog};
use common::{Harness, FAST, GB, SLOW};
use core_cache::{MediaType, PlaybackEvent, PlaybackKind, SeriesContext};
use core_runtime::PathMapping;
use core_store::{create_test_pool, ItemState, SqliteCacheStore};
use mockall::mock;
use mockall::predicate::eq;
use std::path::PathBuf;
use std::sync::Arc;

mock! {
    Catalog {}

    #[async_trait]
    impl MediaCatalog for Catalog {
        async fn resolve_path(&self, item_id: &str) -> Result<Option<PathBuf>>;
        async fn next_episodes(
            &self,
            user_id: &str,
            series_id: &str,
            limit: usize,
        ) -> Result<Vec<CatalogEpisode>>;
    }
}

async fn harness(catalog: MockCatalog) -> Harness {
    let catalog: Arc<dyn MediaCatalog> = Arc::new(catalog);
    harness_with(common::config(), catalog).await
}

async fn harness_with(config: core_runtime::EngineConfig, catalog: Arc<dyn MediaCatalog>) -> Harness {
    let fs = Arc::new(InMemoryFileSystem::new());
    fs.add_mount(SLOW, 1000 * GB);
    fs.add_mount(FAST, 100 * GB);
    fs.add_mount("/boot", GB);
    let store = Arc::new(SqliteCacheStore::new(create_test_pool().await.unwrap()));
    let clock = Arc::new(ManualClock::new(common::t0()));
    Harness::assemble(config, fs, store, clock, Some(catalog))
}

fn episode_event(item: &str) -> PlaybackEvent {
    PlaybackEvent::new("bob", item, PlaybackKind::Start, MediaType::Episode).with_series(
        SeriesContext {
            series_id: "show".to_string(),
            episode_index: Some(1),
            next_episodes: Vec::new(),
        },
    )
}

#[tokio::test]
async fn test_precache_uses_catalog_next_up_after_primary() {
    let mut catalog = MockCatalog::new();
    catalog
        .expect_resolve_path()
        .with(eq("e1"))
        .times(1)
        .returning(|_| Ok(Some(PathBuf::from("/mnt/user0/TV/Show/S01E01.mkv"))));
    catalog
        .expect_next_episodes()
        .with(eq("bob"), eq("show"), eq(2))
        .times(1)
        .returning(|_, _, _| {
            Ok(vec![
                CatalogEpisode {
                    item_id: "e2".to_string(),
                    path: Some(PathBuf::from("/mnt/user0/TV/Show/S01E02.mkv")),
                },
                CatalogEpisode {
                    item_id: "e3".to_string(),
                    path: Some(PathBuf::from("/mnt/user0/TV/Show/S01E03.mkv")),
                },
            ])
        });

    let h = harness(catalog).await;
    for n in 1..=3 {
        h.add_media(&format!("TV/Show/S01E0{}.mkv", n), GB);
    }

    h.engine.on_playback_event(episode_event("e1")).await.unwrap();
    h.advance(31).await;

    let primary = h.item("e1").await.unwrap();
    assert_eq!(primary.state, ItemState::Cached);
    assert!(!primary.is_precache);
    for id in ["e2", "e3"] {
        let next = h.item(id).await.unwrap();
        assert_eq!(next.state, ItemState::Cached);
        assert!(next.is_precache);
    }

    let order: Vec<PathBuf> = h.transfer.calls().into_iter().map(|(source, _, _)| source).collect();
    assert_eq!(order[0], PathBuf::from("/mnt/user0/TV/Show/S01E01.mkv"));
}

#[tokio::test]
async fn test_catalog_failure_does_not_block_primary() {
    let mut catalog = MockCatalog::new();
    catalog
        .expect_resolve_path()
        .returning(|_| Ok(Some(PathBuf::from("/mnt/user0/TV/Show/S01E01.mkv"))));
    catalog
        .expect_next_episodes()
        .returning(|_, _, _| Err(BridgeError::OperationFailed("server down".to_string())));

    let h = harness(catalog).await;
    h.add_media("TV/Show/S01E01.mkv", GB);

    h.engine.on_playback_event(episode_event("e1")).await.unwrap();
    h.advance(31).await;

    assert_eq!(h.item("e1").await.unwrap().state, ItemState::Cached);
    assert_eq!(h.engine.managed_items().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_precache_request_for_playing_item_promotes_it() {
    let mut catalog = MockCatalog::new();
    catalog.expect_resolve_path().returning(|_| Ok(None));
    catalog.expect_next_episodes().returning(|_, _, _| Ok(Vec::new()));

    let h = harness(catalog).await;
    let path = h.add_media("TV/Show/S01E02.mkv", GB);
    h.engine
        .request_cache(&"e2".into(), Some(path.clone()), true)
        .await
        .unwrap();
    h.engine.wait_for_copies().await;
    assert!(h.item("e2").await.unwrap().is_precache);

    h.engine
        .request_cache(&"e2".into(), Some(path), false)
        .await
        .unwrap();
    assert!(!h.item("e2").await.unwrap().is_precache);
}

#[tokio::test]
async fn test_container_paths_from_catalog_are_mapped_onto_the_slow_pool() {
    let catalog = Arc::new(StaticCatalog::new());
    catalog.insert_path("e1", "/media/TV/Show/S01E01.mkv");
    catalog.insert_series(
        "show",
        vec![CatalogEpisode {
            item_id: "e2".to_string(),
            path: Some(PathBuf::from("/media/TV/Show/S01E02.mkv")),
        }],
    );
    let config = common::config()
        .with_precache_episodes(1)
        .with_path_map(vec![PathMapping::new("/media", SLOW)]);

    let h = harness_with(config, catalog).await;
    h.add_media("TV/Show/S01E01.mkv", GB);
    h.add_media("TV/Show/S01E02.mkv", GB);

    h.engine.on_playback_event(episode_event("e1")).await.unwrap();
    h.advance(31).await;

    let primary = h.item("e1").await.unwrap();
    assert_eq!(primary.state, ItemState::Cached);
    assert_eq!(primary.source_path, PathBuf::from("/mnt/user0/TV/Show/S01E01.mkv"));
    assert_eq!(primary.cache_path, PathBuf::from(FAST).join("TV/Show/S01E01.mkv"));

    let next = h.item("e2").await.unwrap();
    assert_eq!(next.state, ItemState::Cached);
    assert!(next.is_precache);
}
