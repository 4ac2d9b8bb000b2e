//! # Event Bus System
//!
//! Outbound notifications of the cache engine, published on a
//! `tokio::sync::broadcast` channel.
//!
//! ## Overview
//!
//! - **CacheEvent**: one notification per lifecycle milestone of a cached item
//! - **EventBus**: broadcast channel the engine publishes on
//! - **EventStream**: receiver wrapper with optional filtering
//!
//! Formatting and delivery (webhooks, chat integrations) belong to whoever
//! subscribes; the engine only emits.
//!
//! ```text
//! ┌──────────────┐    emit     ┌───────────┐   subscribe   ┌────────────┐
//! │ Cache engine ├────────────>│ EventBus  ├──────────────>│ Notifier   │
//! └──────────────┘             │ (broadcast│               └────────────┘
//!                              │  channel) ├──────────────>┌────────────┐
//!                              └───────────┘               │ Status UI  │
//!                                                          └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CacheEvent, CacheEventKind, EventBus};
//!
//! let event_bus = EventBus::new(100);
//! let mut subscriber = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CacheEvent::new(CacheEventKind::Completed, "item-1", "copied 4.2 GB"))
//!     .ok();
//!
//! let event = subscriber.try_recv().unwrap();
//! assert_eq!(event.kind, CacheEventKind::Completed);
//! ```
//!
//! ## Error Handling
//!
//! - **`SendError`**: returned by `emit` when nobody is subscribed. The engine
//!   ignores it.
//! - **`RecvError::Lagged(n)`**: a subscriber fell behind by `n` events.
//! - **`RecvError::Closed`**: the bus was dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

// Re-export commonly used types
pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

/// Lifecycle milestone of a cached item
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CacheEventKind {
    /// A copy to the fast pool was started
    Started,
    /// The item is served from the fast pool
    Completed,
    /// The copy failed; the item stays on the slow pool
    Failed,
    /// The cached copy was removed and the original restored
    Evicted,
}

impl CacheEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheEventKind::Started => "started",
            CacheEventKind::Completed => "completed",
            CacheEventKind::Failed => "failed",
            CacheEventKind::Evicted => "evicted",
        }
    }
}

impl fmt::Display for CacheEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification emitted by the engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEvent {
    pub kind: CacheEventKind,
    pub item_id: String,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl CacheEvent {
    pub fn new(kind: CacheEventKind, item_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            item_id: item_id.into(),
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self.kind {
            CacheEventKind::Started => "Caching started",
            CacheEventKind::Completed => "Item cached",
            CacheEventKind::Failed => "Caching failed",
            CacheEventKind::Evicted => "Item evicted from cache",
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self.kind {
            CacheEventKind::Failed => EventSeverity::Error,
            CacheEventKind::Completed | CacheEventKind::Evicted => EventSeverity::Info,
            CacheEventKind::Started => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Central broadcast channel for [`CacheEvent`]s.
///
/// Cheap to clone; clones publish on the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// Subscribers that fall behind by more than `capacity` events receive
    /// `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// if there are no active subscribers.
    pub fn emit(&self, event: CacheEvent) -> Result<usize, SendError<CacheEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CacheEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

/// Type alias for event filter functions.
type EventFilter = Box<dyn Fn(&CacheEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with optional filtering.
///
/// ```rust
/// use core_runtime::events::{CacheEventKind, EventBus, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let failures = EventStream::new(event_bus.subscribe())
///     .filter(|event| event.kind == CacheEventKind::Failed);
/// ```
pub struct EventStream {
    receiver: Receiver<CacheEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CacheEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events that match the predicate will be returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CacheEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn matches(&self, event: &CacheEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter (if any).
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CacheEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no matching events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<CacheEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_subscription() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);
        let _sub1 = bus.subscribe();
        let _sub2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_event_emission_no_subscribers() {
        let bus = EventBus::new(10);
        let event = CacheEvent::new(CacheEventKind::Started, "1", "copy queued");

        // Should error when no subscribers
        assert!(bus.emit(event).is_err());
    }

    #[tokio::test]
    async fn test_event_emission_with_subscribers() {
        let bus = EventBus::new(10);
        let mut sub = bus.subscribe();

        let event = CacheEvent::new(CacheEventKind::Evicted, "42", "cleanup deadline reached");
        assert_eq!(bus.emit(event.clone()).unwrap(), 1);

        let received = sub.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn test_event_stream_filter() {
        let bus = EventBus::new(10);
        let mut failures =
            EventStream::new(bus.subscribe()).filter(|event| event.kind == CacheEventKind::Failed);

        bus.emit(CacheEvent::new(CacheEventKind::Started, "1", "")).unwrap();
        bus.emit(CacheEvent::new(CacheEventKind::Failed, "1", "no space")).unwrap();

        let event = failures.recv().await.unwrap();
        assert_eq!(event.kind, CacheEventKind::Failed);
        assert!(failures.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        for i in 0..5 {
            bus.emit(CacheEvent::new(CacheEventKind::Started, i.to_string(), ""))
                .unwrap();
        }
        assert!(matches!(sub.recv().await, Err(RecvError::Lagged(_))));
    }

    #[test]
    fn test_event_severity() {
        let failed = CacheEvent::new(CacheEventKind::Failed, "1", "");
        let started = CacheEvent::new(CacheEventKind::Started, "1", "");
        assert_eq!(failed.severity(), EventSeverity::Error);
        assert_eq!(started.severity(), EventSeverity::Debug);
        assert!(failed.severity() > started.severity());
        assert_eq!(failed.description(), "Caching failed");
    }

    #[test]
    fn test_event_serialization() {
        let event = CacheEvent::new(CacheEventKind::Completed, "7", "4096 bytes");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"completed\""));
        let back: CacheEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
