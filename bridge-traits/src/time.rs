//! Clock and log sink seams
//!
//! Cooldowns, cleanup deadlines and retry timers all read time through
//! [`Clock`] so tests can drive them with a manual clock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;

/// Time source
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current Unix timestamp in seconds, the resolution the store persists
    fn unix_timestamp(&self) -> i64 {
        self.now().timestamp()
    }
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// One log line mirrored to a [`LoggerSink`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub timestamp: DateTime<Utc>,
    /// Module that emitted the event
    pub target: String,
    pub message: String,
    /// Item the line is about, lifted out of the `item_id` field
    pub item_id: Option<String>,
    pub fields: BTreeMap<String, String>,
    /// Name of the innermost span, usually the engine operation
    pub span: Option<String>,
}

impl LogEntry {
    pub fn new(level: LogLevel, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            timestamp: Utc::now(),
            target: target.into(),
            message: message.into(),
            item_id: None,
            fields: BTreeMap::new(),
            span: None,
        }
    }

    /// Attach a structured field; `item_id` is kept apart from the rest.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        if key == "item_id" {
            self.item_id = Some(value.into());
        } else {
            self.fields.insert(key, value.into());
        }
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }
}

/// Destination for mirrored log lines, such as a status page's activity feed
/// or syslog.
///
/// Implementations must not forward the media server API key.
#[async_trait::async_trait]
pub trait LoggerSink: Send + Sync {
    async fn log(&self, entry: LogEntry) -> Result<()>;

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Lines below this level are dropped before they reach the sink
    fn min_level(&self) -> LogLevel {
        LogLevel::Info
    }
}
