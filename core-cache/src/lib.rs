//! # Core Cache
//!
//! Playback-driven cache engine that keeps media being watched on the fast
//! pool and puts it back on the slow pool when viewers move on.
//!
//! ## Overview
//!
//! - [`session`] - Playback sessions and debounce cooldowns
//! - [`state`] - Pure transition function over stored rows
//! - [`copy`] - Retrying copier and the symlink swap
//! - [`space`] - Eviction ordering under space pressure
//! - [`scheduler`] - Deadline heap driving the scheduler loop
//! - [`engine`] - [`SmartCache`], the orchestrator tying it all together
//! - [`reconcile`] - Startup recovery from the store
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_cache::{PlaybackEvent, SmartCache, WebhookPayload};
//!
//! let engine = SmartCache::builder(config, store, fs, transfer).build()?;
//! engine.reconcile().await?;
//!
//! let payload = WebhookPayload::from_json(line)?;
//! engine.on_playback_event(PlaybackEvent::try_from(payload)?).await?;
//! ```

pub mod copy;
pub mod engine;
pub mod error;
pub mod mover_ignore;
pub mod paths;
pub mod reconcile;
pub mod scheduler;
pub mod session;
pub mod space;
pub mod state;

pub use copy::{CopyEngine, CopyFailure, CopyOutcome, CopyPolicy};
pub use engine::{HealthReport, RequestOutcome, SmartCache, SmartCacheBuilder};
pub use error::{CacheError, Result};
pub use mover_ignore::MoverIgnoreList;
pub use paths::{MappedPaths, PathMapper};
pub use reconcile::ReconcileReport;
pub use scheduler::{TimerKind, TimerQueue};
pub use session::{
    MediaType, NextEpisode, PlaybackEvent, PlaybackKind, SeriesContext, Session, SessionState,
    SessionTracker, WebhookPayload,
};
pub use space::{eviction_candidates, PoolUsage};
pub use state::{transition, Command, Transition, TransitionContext, Trigger};
