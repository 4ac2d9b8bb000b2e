//! # Playback Sessions
//!
//! In-memory view of who is watching what, plus the per-item cooldowns that
//! debounce short playbacks. Nothing here is persisted; after a restart the
//! engine rebuilds its picture from the store and from new webhook events.

use crate::error::CacheError;
use chrono::{DateTime, Duration, Utc};
use core_store::ItemId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackKind {
    Start,
    Stop,
    Progress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Movie,
    Episode,
    Other,
}

impl MediaType {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "movie" => MediaType::Movie,
            "episode" => MediaType::Episode,
            _ => MediaType::Other,
        }
    }
}

/// Upcoming episode supplied with a playback event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextEpisode {
    pub item_id: ItemId,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SeriesContext {
    pub series_id: String,
    pub episode_index: Option<u32>,
    /// Episodes after this one, in play order
    pub next_episodes: Vec<NextEpisode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackEvent {
    pub user_id: String,
    pub item_id: ItemId,
    pub kind: PlaybackKind,
    pub media_type: MediaType,
    pub path: Option<PathBuf>,
    pub series: Option<SeriesContext>,
}

impl PlaybackEvent {
    pub fn new(
        user_id: impl Into<String>,
        item_id: impl Into<ItemId>,
        kind: PlaybackKind,
        media_type: MediaType,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            item_id: item_id.into(),
            kind,
            media_type,
            path: None,
            series: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_series(mut self, series: SeriesContext) -> Self {
        self.series = Some(series);
        self
    }
}

/// Webhook body as posted by the media server plugin
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub event_type: String,
    pub user_id: String,
    pub item_id: String,
    #[serde(default)]
    pub item_type: String,
    #[serde(default)]
    pub series_id: Option<String>,
    #[serde(default)]
    pub episode_index: Option<u32>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub next_episodes: Option<Vec<NextEpisode>>,
}

impl WebhookPayload {
    pub fn from_json(json: &str) -> Result<Self, CacheError> {
        serde_json::from_str(json).map_err(|e| CacheError::InvalidEvent(e.to_string()))
    }
}

impl TryFrom<WebhookPayload> for PlaybackEvent {
    type Error = CacheError;

    fn try_from(payload: WebhookPayload) -> Result<Self, Self::Error> {
        let event_type = payload.event_type.to_ascii_lowercase();
        let kind = match event_type.strip_prefix("playback.").unwrap_or(&event_type) {
            "start" => PlaybackKind::Start,
            "stop" => PlaybackKind::Stop,
            "progress" => PlaybackKind::Progress,
            other => {
                return Err(CacheError::InvalidEvent(format!(
                    "unsupported event type '{}'",
                    other
                )))
            }
        };
        if payload.user_id.trim().is_empty() || payload.item_id.trim().is_empty() {
            return Err(CacheError::InvalidEvent(
                "user_id and item_id are required".to_string(),
            ));
        }

        let series = payload.series_id.map(|series_id| SeriesContext {
            series_id,
            episode_index: payload.episode_index,
            next_episodes: payload.next_episodes.unwrap_or_default(),
        });

        Ok(PlaybackEvent {
            user_id: payload.user_id,
            item_id: ItemId::from(payload.item_id),
            kind,
            media_type: MediaType::parse(&payload.item_type),
            path: payload.path.filter(|p| !p.is_empty()).map(PathBuf::from),
            series,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Started,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub user_id: String,
    pub item_id: ItemId,
    pub state: SessionState,
    pub next_episode_ids: Vec<ItemId>,
    pub cooldown_expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Context captured when a cooldown was armed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCooldown {
    pub item_id: ItemId,
    pub user_id: String,
    pub media_type: MediaType,
    pub path: Option<PathBuf>,
    pub series: Option<SeriesContext>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StopOutcome {
    /// A pending cooldown was dropped
    pub cancelled_cooldown: bool,
    /// Another user still has a started session on the item
    pub still_active: bool,
}

#[derive(Debug, Default)]
pub struct SessionTracker {
    sessions: HashMap<(String, ItemId), Session>,
    cooldowns: HashMap<ItemId, PendingCooldown>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a started session. With `cooldown`, arms one for the item unless
    /// it already has one pending; returns the new expiry.
    pub fn start(
        &mut self,
        event: &PlaybackEvent,
        now: DateTime<Utc>,
        cooldown: Option<Duration>,
    ) -> Option<DateTime<Utc>> {
        let armed = cooldown.and_then(|delay| {
            if self.cooldowns.contains_key(&event.item_id) {
                return None;
            }
            let expires_at = now + delay;
            self.cooldowns.insert(
                event.item_id.clone(),
                PendingCooldown {
                    item_id: event.item_id.clone(),
                    user_id: event.user_id.clone(),
                    media_type: event.media_type,
                    path: event.path.clone(),
                    series: event.series.clone(),
                    expires_at,
                },
            );
            Some(expires_at)
        });

        let cooldown_expires_at = self.cooldowns.get(&event.item_id).map(|c| c.expires_at);
        let next_episode_ids = event
            .series
            .as_ref()
            .map(|s| s.next_episodes.iter().map(|e| e.item_id.clone()).collect())
            .unwrap_or_default();
        self.sessions.insert(
            (event.user_id.clone(), event.item_id.clone()),
            Session {
                user_id: event.user_id.clone(),
                item_id: event.item_id.clone(),
                state: SessionState::Started,
                next_episode_ids,
                cooldown_expires_at,
                updated_at: now,
            },
        );
        armed
    }

    pub fn stop(&mut self, event: &PlaybackEvent, now: DateTime<Utc>) -> StopOutcome {
        if let Some(session) = self
            .sessions
            .get_mut(&(event.user_id.clone(), event.item_id.clone()))
        {
            session.state = SessionState::Stopped;
            session.cooldown_expires_at = None;
            session.updated_at = now;
        }

        let still_active = self.is_active(&event.item_id);
        let cancelled_cooldown = !still_active && self.cooldowns.remove(&event.item_id).is_some();
        StopOutcome {
            cancelled_cooldown,
            still_active,
        }
    }

    /// Refresh a session; a progress report for an unknown session starts one.
    pub fn progress(&mut self, event: &PlaybackEvent, now: DateTime<Utc>) {
        let key = (event.user_id.clone(), event.item_id.clone());
        match self.sessions.get_mut(&key) {
            Some(session) => {
                session.state = SessionState::Started;
                session.updated_at = now;
            }
            None => {
                self.start(event, now, None);
            }
        }
    }

    /// Take the cooldown of `item_id` if it is due and someone is still watching.
    pub fn take_due_cooldown(
        &mut self,
        item_id: &ItemId,
        now: DateTime<Utc>,
    ) -> Option<PendingCooldown> {
        let pending = self.cooldowns.get(item_id)?;
        if pending.expires_at > now {
            return None;
        }
        let pending = self.cooldowns.remove(item_id)?;
        for session in self.sessions.values_mut() {
            if &session.item_id == item_id {
                session.cooldown_expires_at = None;
            }
        }
        self.is_active(item_id).then_some(pending)
    }

    pub fn has_pending_cooldown(&self, item_id: &ItemId) -> bool {
        self.cooldowns.contains_key(item_id)
    }

    pub fn cooldown_expiry(&self, item_id: &ItemId) -> Option<DateTime<Utc>> {
        self.cooldowns.get(item_id).map(|c| c.expires_at)
    }

    pub fn is_active(&self, item_id: &ItemId) -> bool {
        self.sessions
            .values()
            .any(|s| &s.item_id == item_id && s.state == SessionState::Started)
    }

    /// Items with at least one started session
    pub fn active_items(&self) -> HashSet<ItemId> {
        self.sessions
            .values()
            .filter(|s| s.state == SessionState::Started)
            .map(|s| s.item_id.clone())
            .collect()
    }

    /// Drop stopped sessions last updated before `cutoff`
    pub fn prune_stopped(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| s.state == SessionState::Started || s.updated_at >= cutoff);
        before - self.sessions.len()
    }

    pub fn sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<_> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| (&a.item_id, &a.user_id).cmp(&(&b.item_id, &b.user_id)));
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn event(user: &str, kind: PlaybackKind) -> PlaybackEvent {
        PlaybackEvent::new(user, "42", kind, MediaType::Episode).with_path("/media/tv/a.mkv")
    }

    #[test]
    fn test_start_arms_single_cooldown() {
        let mut tracker = SessionTracker::new();
        let first = tracker.start(&event("alice", PlaybackKind::Start), t0(), Some(Duration::seconds(30)));
        assert_eq!(first, Some(t0() + Duration::seconds(30)));

        let second = tracker.start(
            &event("bob", PlaybackKind::Start),
            t0() + Duration::seconds(5),
            Some(Duration::seconds(30)),
        );
        assert_eq!(second, None);
        assert_eq!(tracker.cooldown_expiry(&ItemId::from("42")), first);
    }

    #[test]
    fn test_stop_before_expiry_cancels_cooldown() {
        let mut tracker = SessionTracker::new();
        tracker.start(&event("alice", PlaybackKind::Start), t0(), Some(Duration::seconds(30)));
        let outcome = tracker.stop(&event("alice", PlaybackKind::Stop), t0() + Duration::seconds(10));
        assert!(outcome.cancelled_cooldown);
        assert!(!outcome.still_active);
        assert!(tracker
            .take_due_cooldown(&ItemId::from("42"), t0() + Duration::seconds(60))
            .is_none());
    }

    #[test]
    fn test_stop_keeps_cooldown_while_another_user_watches() {
        let mut tracker = SessionTracker::new();
        tracker.start(&event("alice", PlaybackKind::Start), t0(), Some(Duration::seconds(30)));
        tracker.start(&event("bob", PlaybackKind::Start), t0(), Some(Duration::seconds(30)));
        let outcome = tracker.stop(&event("alice", PlaybackKind::Stop), t0());
        assert!(!outcome.cancelled_cooldown);
        assert!(outcome.still_active);

        let fired = tracker
            .take_due_cooldown(&ItemId::from("42"), t0() + Duration::seconds(30))
            .unwrap();
        assert_eq!(fired.media_type, MediaType::Episode);
        assert!(!tracker.has_pending_cooldown(&ItemId::from("42")));
    }

    #[test]
    fn test_cooldown_not_due_yet() {
        let mut tracker = SessionTracker::new();
        tracker.start(&event("alice", PlaybackKind::Start), t0(), Some(Duration::seconds(30)));
        assert!(tracker
            .take_due_cooldown(&ItemId::from("42"), t0() + Duration::seconds(29))
            .is_none());
        assert!(tracker.has_pending_cooldown(&ItemId::from("42")));
    }

    #[test]
    fn test_progress_creates_session() {
        let mut tracker = SessionTracker::new();
        tracker.progress(&event("alice", PlaybackKind::Progress), t0());
        assert!(tracker.is_active(&ItemId::from("42")));
        assert!(!tracker.has_pending_cooldown(&ItemId::from("42")));
    }

    #[test]
    fn test_prune_stopped_sessions() {
        let mut tracker = SessionTracker::new();
        tracker.start(&event("alice", PlaybackKind::Start), t0(), None);
        tracker.start(&event("bob", PlaybackKind::Start), t0(), None);
        tracker.stop(&event("alice", PlaybackKind::Stop), t0());

        assert_eq!(tracker.prune_stopped(t0() + Duration::seconds(1)), 1);
        assert_eq!(tracker.sessions().len(), 1);
        assert_eq!(tracker.active_items().len(), 1);
    }

    #[test]
    fn test_webhook_payload_conversion() {
        let payload = WebhookPayload::from_json(
            r#"{
                "event_type": "playback.start",
                "user_id": "u1",
                "item_id": "42",
                "item_type": "Episode",
                "series_id": "s1",
                "episode_index": 3,
                "path": "/media/tv/Show/S01E03.mkv",
                "next_episodes": [{"item_id": "43", "path": "/media/tv/Show/S01E04.mkv"}, {"item_id": "44"}]
            }"#,
        )
        .unwrap();
        let event = PlaybackEvent::try_from(payload).unwrap();
        assert_eq!(event.kind, PlaybackKind::Start);
        assert_eq!(event.media_type, MediaType::Episode);
        let series = event.series.unwrap();
        assert_eq!(series.episode_index, Some(3));
        assert_eq!(series.next_episodes.len(), 2);
        assert_eq!(series.next_episodes[1].path, None);
    }

    #[test]
    fn test_webhook_bare_event_types() {
        let payload = WebhookPayload::from_json(
            r#"{"event_type": "stop", "user_id": "u1", "item_id": "1", "item_type": "Movie"}"#,
        )
        .unwrap();
        let event = PlaybackEvent::try_from(payload).unwrap();
        assert_eq!(event.kind, PlaybackKind::Stop);
        assert_eq!(event.media_type, MediaType::Movie);
        assert!(event.series.is_none());

        let bad = WebhookPayload::from_json(
            r#"{"event_type": "playback.pause", "user_id": "u1", "item_id": "1"}"#,
        )
        .unwrap();
        assert!(matches!(
            PlaybackEvent::try_from(bad),
            Err(CacheError::InvalidEvent(_))
        ));
    }
}
