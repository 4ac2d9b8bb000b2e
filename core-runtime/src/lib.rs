//! # Core Runtime Module
//!
//! Foundational runtime infrastructure for the smart cache engine:
//! - Logging and tracing infrastructure
//! - Configuration loading and validation
//! - Event bus for outbound cache notifications

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use config::{EngineConfig, PathMapping};
pub use error::{Error, Result};
pub use events::{CacheEvent, CacheEventKind, EventBus};
