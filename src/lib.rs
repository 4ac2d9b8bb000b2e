//! # Smart Cache
//!
//! Umbrella crate for the playback-driven media cache. Hosts depend on this
//! crate and get the engine, its store, runtime plumbing and bridge traits
//! under one name. The `desktop-shims` feature (on by default) adds the POSIX
//! adapters used by the `smart-cached` daemon.

pub use bridge_traits as bridge;
pub use core_cache as cache;
pub use core_runtime as runtime;
pub use core_store as store;

#[cfg(feature = "desktop-shims")]
pub use bridge_desktop as desktop;

pub use core_cache::{PlaybackEvent, SmartCache, WebhookPayload};
pub use core_runtime::EngineConfig;
