//! # Cache State Machine
//!
//! Pure transition function over [`ManagedItem`] rows.
//!
//! ```text
//!  (no row) ──► CooldownPending ──► Copying ──► Cached ◄──► PendingCleanup
//!                                      │                         │
//!                                      ▼                         ▼
//!                                    Failed                   Evicted ──► (no row)
//! ```
//!
//! [`transition`] never performs I/O. It returns the row to persist and an
//! ordered list of [`Command`]s that the engine executes front to back,
//! stopping at the first failing step. `None` means the trigger does not apply
//! to the current state and nothing happens.

use chrono::{DateTime, Duration, Utc};
use core_runtime::CacheEventKind;
use core_store::{HistoryKind, ItemId, ItemState, ManagedItem};
use std::path::PathBuf;

/// Per-item timers owned by the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerSlot {
    Cleanup,
    FailedRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoverIgnoreOp {
    Add,
    Remove,
}

/// Side effect requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Write the transition's row
    Persist,
    /// Delete the row
    DeleteRecord,
    /// Queue a copy on the worker pool
    StartCopy,
    /// Rename the preserved original back over the link
    RestoreOriginal,
    /// Remove the cache file and any partial copy
    DeleteCacheFile,
    MoverIgnore(MoverIgnoreOp),
    ScheduleTimer(TimerSlot, DateTime<Utc>),
    CancelTimer(TimerSlot),
    /// Run the space manager once the item lock is released
    CheckSpace,
    Notify(CacheEventKind, String),
    Record(HistoryKind, String, Option<u64>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    CacheRequested {
        item_id: ItemId,
        source_path: PathBuf,
        cache_path: PathBuf,
        is_precache: bool,
    },
    CopySucceeded {
        bytes: u64,
        retries: u32,
    },
    CopyFailed {
        error: String,
        retries: u32,
        /// Never retry, not even once more after the backoff ceiling
        abandon: bool,
    },
    FailedRetryDue,
    PlaybackStopped {
        deadline: DateTime<Utc>,
    },
    PlaybackResumed,
    Activity,
    CleanupDue,
    ForceEvict {
        reason: String,
    },
    ResumeEviction,
}

#[derive(Debug, Clone, Copy)]
pub struct TransitionContext {
    pub now: DateTime<Utc>,
    /// Delay before the single extended retry of a failed copy
    pub failed_retry_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Row written by [`Command::Persist`]
    pub item: Option<ManagedItem>,
    pub commands: Vec<Command>,
}

impl Transition {
    fn new(item: ManagedItem, commands: Vec<Command>) -> Self {
        Self {
            item: Some(item),
            commands,
        }
    }

    pub fn has(&self, command: &Command) -> bool {
        self.commands.contains(command)
    }

    pub fn state(&self) -> Option<ItemState> {
        self.item.as_ref().map(|item| item.state)
    }
}

pub fn transition(
    current: Option<&ManagedItem>,
    trigger: &Trigger,
    ctx: &TransitionContext,
) -> Option<Transition> {
    let now = ctx.now;
    let state = current.map(|item| item.state);

    match (trigger, state) {
        (
            Trigger::CacheRequested {
                item_id,
                source_path,
                cache_path,
                is_precache,
            },
            None | Some(ItemState::CooldownPending),
        ) => {
            let mut item = match current {
                Some(existing) => existing.clone(),
                None => ManagedItem::new(item_id.clone(), source_path.clone(), cache_path.clone(), now),
            };
            item.source_path = source_path.clone();
            item.cache_path = cache_path.clone();
            item.state = ItemState::Copying;
            item.is_precache = *is_precache;
            item.last_activity_at = now;
            item.cleanup_deadline_at = None;
            item.retry_at = None;
            item.retry_count = 0;
            item.failed_retry_used = false;
            item.last_error = None;
            item.updated_at = now;

            let origin = if *is_precache { "precache" } else { "playback" };
            Some(Transition::new(
                item,
                vec![
                    Command::Persist,
                    Command::Record(HistoryKind::Requested, origin.to_string(), None),
                    Command::Notify(CacheEventKind::Started, format!("copy queued ({})", origin)),
                    Command::StartCopy,
                ],
            ))
        }

        (Trigger::CacheRequested { is_precache, .. }, Some(ItemState::PendingCleanup)) => {
            let item = current?;
            let mut resumed = resume(item, now);
            if !*is_precache {
                resumed.is_precache = false;
            }
            Some(Transition::new(resumed, resume_commands()))
        }

        (Trigger::CacheRequested { is_precache, .. }, Some(_)) => {
            let item = current?;
            if *is_precache || !item.is_precache {
                return None;
            }
            let mut promoted = item.clone();
            promoted.is_precache = false;
            promoted.last_activity_at = now;
            promoted.updated_at = now;
            Some(Transition::new(promoted, vec![Command::Persist]))
        }

        (Trigger::CopySucceeded { bytes, retries }, Some(ItemState::Copying)) => {
            let item = current?;
            let mut done = item.clone();
            done.size_bytes = *bytes;
            done.retry_count = *retries;
            done.last_error = None;
            done.retry_at = None;
            done.updated_at = now;

            let mut commands = vec![Command::Persist, Command::MoverIgnore(MoverIgnoreOp::Add)];
            match done.cleanup_deadline_at {
                Some(deadline) => {
                    done.state = ItemState::PendingCleanup;
                    commands.push(Command::ScheduleTimer(TimerSlot::Cleanup, deadline));
                }
                None => done.state = ItemState::Cached,
            }
            commands.push(Command::Record(
                HistoryKind::Completed,
                format!("{} retries", retries),
                Some(*bytes),
            ));
            commands.push(Command::Notify(
                CacheEventKind::Completed,
                format!("{} bytes on fast pool", bytes),
            ));
            commands.push(Command::CheckSpace);
            Some(Transition::new(done, commands))
        }

        (
            Trigger::CopyFailed {
                error,
                retries,
                abandon,
            },
            Some(ItemState::Copying),
        ) => {
            let item = current?;
            let mut failed = item.clone();
            failed.state = ItemState::Failed;
            failed.retry_count = *retries;
            failed.last_error = Some(error.clone());
            failed.cleanup_deadline_at = None;
            failed.updated_at = now;

            let mut commands = vec![
                Command::Persist,
                Command::Record(HistoryKind::Failed, error.clone(), None),
            ];
            if *abandon || failed.failed_retry_used {
                failed.retry_at = None;
                commands.push(Command::Record(
                    HistoryKind::Abandoned,
                    "no further retries".to_string(),
                    None,
                ));
            } else {
                let at = now + ctx.failed_retry_delay;
                failed.retry_at = Some(at);
                commands.push(Command::ScheduleTimer(TimerSlot::FailedRetry, at));
            }
            commands.push(Command::Notify(CacheEventKind::Failed, error.clone()));
            Some(Transition::new(failed, commands))
        }

        (Trigger::FailedRetryDue, Some(ItemState::Failed)) => {
            let item = current?;
            if item.failed_retry_used || item.retry_at.is_none() {
                return None;
            }
            let mut retry = item.clone();
            retry.state = ItemState::Copying;
            retry.failed_retry_used = true;
            retry.retry_at = None;
            retry.updated_at = now;
            Some(Transition::new(
                retry,
                vec![
                    Command::Persist,
                    Command::Record(
                        HistoryKind::Retrying,
                        item.last_error.clone().unwrap_or_default(),
                        None,
                    ),
                    Command::StartCopy,
                ],
            ))
        }

        (Trigger::PlaybackStopped { deadline }, Some(ItemState::Cached)) => {
            let item = current?;
            let mut pending = item.clone();
            pending.state = ItemState::PendingCleanup;
            pending.cleanup_deadline_at = Some(*deadline);
            pending.last_activity_at = now;
            pending.updated_at = now;
            Some(Transition::new(
                pending,
                vec![
                    Command::Persist,
                    Command::ScheduleTimer(TimerSlot::Cleanup, *deadline),
                    Command::Record(HistoryKind::CleanupScheduled, deadline.to_rfc3339(), None),
                ],
            ))
        }

        (Trigger::PlaybackStopped { deadline }, Some(ItemState::PendingCleanup)) => {
            let item = current?;
            if item.cleanup_deadline_at.is_some_and(|existing| existing >= *deadline) {
                return None;
            }
            let mut pending = item.clone();
            pending.cleanup_deadline_at = Some(*deadline);
            pending.last_activity_at = now;
            pending.updated_at = now;
            Some(Transition::new(
                pending,
                vec![
                    Command::Persist,
                    Command::ScheduleTimer(TimerSlot::Cleanup, *deadline),
                    Command::Record(HistoryKind::CleanupScheduled, deadline.to_rfc3339(), None),
                ],
            ))
        }

        (Trigger::PlaybackStopped { deadline }, Some(ItemState::Copying)) => {
            let item = current?;
            let mut copying = item.clone();
            copying.cleanup_deadline_at = Some(*deadline);
            copying.last_activity_at = now;
            copying.updated_at = now;
            Some(Transition::new(copying, vec![Command::Persist]))
        }

        (Trigger::PlaybackResumed, Some(ItemState::PendingCleanup)) => {
            let item = current?;
            Some(Transition::new(resume(item, now), resume_commands()))
        }

        (Trigger::PlaybackResumed, Some(ItemState::Copying)) => {
            let item = current?;
            let mut copying = item.clone();
            copying.cleanup_deadline_at = None;
            copying.last_activity_at = now;
            copying.updated_at = now;
            Some(Transition::new(copying, vec![Command::Persist]))
        }

        (Trigger::PlaybackResumed | Trigger::Activity, Some(ItemState::Cached))
        | (Trigger::Activity, Some(ItemState::PendingCleanup)) => {
            let item = current?;
            let mut touched = item.clone();
            touched.last_activity_at = now;
            touched.updated_at = now;
            Some(Transition::new(touched, vec![Command::Persist]))
        }

        (Trigger::CleanupDue, Some(ItemState::PendingCleanup)) => {
            let item = current?;
            match item.cleanup_deadline_at {
                Some(deadline) if deadline <= now => {
                    Some(evict(item, now, "cleanup deadline reached", true))
                }
                _ => None,
            }
        }

        (Trigger::ForceEvict { reason }, Some(ItemState::Cached | ItemState::PendingCleanup)) => {
            let item = current?;
            Some(evict(item, now, reason, true))
        }

        (Trigger::ResumeEviction, Some(ItemState::Evicted)) => {
            let item = current?;
            Some(evict(item, now, "resumed interrupted eviction", false))
        }

        _ => None,
    }
}

fn resume(item: &ManagedItem, now: DateTime<Utc>) -> ManagedItem {
    let mut resumed = item.clone();
    resumed.state = ItemState::Cached;
    resumed.cleanup_deadline_at = None;
    resumed.last_activity_at = now;
    resumed.updated_at = now;
    resumed
}

fn resume_commands() -> Vec<Command> {
    vec![
        Command::Persist,
        Command::CancelTimer(TimerSlot::Cleanup),
        Command::Record(HistoryKind::Resumed, "playback resumed".to_string(), None),
    ]
}

/// The link is always replaced by the original before the cache file goes.
fn evict(item: &ManagedItem, now: DateTime<Utc>, reason: &str, persist: bool) -> Transition {
    let mut evicted = item.clone();
    evicted.state = ItemState::Evicted;
    evicted.updated_at = now;

    let mut commands = Vec::with_capacity(8);
    if persist {
        commands.push(Command::Persist);
    }
    commands.extend([
        Command::CancelTimer(TimerSlot::Cleanup),
        Command::RestoreOriginal,
        Command::DeleteCacheFile,
        Command::MoverIgnore(MoverIgnoreOp::Remove),
        Command::Record(HistoryKind::Evicted, reason.to_string(), Some(item.size_bytes)),
        Command::Notify(CacheEventKind::Evicted, reason.to_string()),
        Command::DeleteRecord,
    ]);
    Transition::new(evicted, commands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx() -> TransitionContext {
        TransitionContext {
            now: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            failed_retry_delay: Duration::seconds(60),
        }
    }

    fn item(state: ItemState) -> ManagedItem {
        ManagedItem::new(
            "1",
            "/mnt/slow/a.mkv",
            "/mnt/fast/a.mkv",
            Utc.timestamp_opt(1_699_999_000, 0).unwrap(),
        )
        .with_state(state)
    }

    fn request(is_precache: bool) -> Trigger {
        Trigger::CacheRequested {
            item_id: ItemId::from("1"),
            source_path: PathBuf::from("/mnt/slow/a.mkv"),
            cache_path: PathBuf::from("/mnt/fast/a.mkv"),
            is_precache,
        }
    }

    #[test]
    fn test_request_from_idle_persists_before_copy() {
        let t = transition(None, &request(false), &ctx()).unwrap();
        assert_eq!(t.state(), Some(ItemState::Copying));
        let persist = t.commands.iter().position(|c| *c == Command::Persist).unwrap();
        let copy = t.commands.iter().position(|c| *c == Command::StartCopy).unwrap();
        assert!(persist < copy);
    }

    #[test]
    fn test_request_from_cooldown_keeps_created_at() {
        let pending = item(ItemState::CooldownPending);
        let t = transition(Some(&pending), &request(true), &ctx()).unwrap();
        let row = t.item.unwrap();
        assert_eq!(row.state, ItemState::Copying);
        assert_eq!(row.created_at, pending.created_at);
        assert!(row.is_precache);
    }

    #[test]
    fn test_request_is_idempotent() {
        for state in [
            ItemState::Copying,
            ItemState::Cached,
            ItemState::Failed,
            ItemState::Evicted,
        ] {
            assert!(transition(Some(&item(state)), &request(false), &ctx()).is_none());
        }
    }

    #[test]
    fn test_primary_request_promotes_precache_row() {
        let precached = item(ItemState::Cached).with_precache(true);
        let t = transition(Some(&precached), &request(false), &ctx()).unwrap();
        assert!(!t.item.unwrap().is_precache);
        assert!(transition(Some(&precached), &request(true), &ctx()).is_none());
    }

    #[test]
    fn test_request_resumes_pending_cleanup() {
        let mut pending = item(ItemState::PendingCleanup);
        pending.cleanup_deadline_at = Some(ctx().now + Duration::hours(1));
        let t = transition(Some(&pending), &request(false), &ctx()).unwrap();
        assert_eq!(t.state(), Some(ItemState::Cached));
        assert!(t.has(&Command::CancelTimer(TimerSlot::Cleanup)));
        assert_eq!(t.item.unwrap().cleanup_deadline_at, None);
    }

    #[test]
    fn test_copy_success_records_retries() {
        let t = transition(
            Some(&item(ItemState::Copying)),
            &Trigger::CopySucceeded {
                bytes: 4096,
                retries: 2,
            },
            &ctx(),
        )
        .unwrap();
        let row = t.item.clone().unwrap();
        assert_eq!(row.state, ItemState::Cached);
        assert_eq!(row.retry_count, 2);
        assert_eq!(row.size_bytes, 4096);
        assert!(t.has(&Command::MoverIgnore(MoverIgnoreOp::Add)));
        assert_eq!(t.commands.last(), Some(&Command::CheckSpace));
    }

    #[test]
    fn test_stop_during_copy_goes_straight_to_pending_cleanup() {
        let deadline = ctx().now + Duration::hours(24);
        let copying = transition(
            Some(&item(ItemState::Copying)),
            &Trigger::PlaybackStopped { deadline },
            &ctx(),
        )
        .unwrap()
        .item
        .unwrap();
        assert_eq!(copying.state, ItemState::Copying);

        let t = transition(
            Some(&copying),
            &Trigger::CopySucceeded {
                bytes: 1,
                retries: 0,
            },
            &ctx(),
        )
        .unwrap();
        assert_eq!(t.state(), Some(ItemState::PendingCleanup));
        assert!(t.has(&Command::ScheduleTimer(TimerSlot::Cleanup, deadline)));
    }

    #[test]
    fn test_failure_schedules_one_extended_retry() {
        let failed = transition(
            Some(&item(ItemState::Copying)),
            &Trigger::CopyFailed {
                error: "rsync exited 23".into(),
                retries: 3,
                abandon: false,
            },
            &ctx(),
        )
        .unwrap();
        let row = failed.item.clone().unwrap();
        let due = ctx().now + Duration::seconds(60);
        assert_eq!(row.state, ItemState::Failed);
        assert_eq!(row.retry_at, Some(due));
        assert!(failed.has(&Command::ScheduleTimer(TimerSlot::FailedRetry, due)));

        let retry = transition(Some(&row), &Trigger::FailedRetryDue, &ctx()).unwrap();
        let retrying = retry.item.clone().unwrap();
        assert_eq!(retrying.state, ItemState::Copying);
        assert!(retrying.failed_retry_used);
        assert!(retry.has(&Command::StartCopy));

        let second = transition(
            Some(&retrying),
            &Trigger::CopyFailed {
                error: "again".into(),
                retries: 3,
                abandon: false,
            },
            &ctx(),
        )
        .unwrap();
        assert_eq!(second.item.clone().unwrap().retry_at, None);
        assert!(second
            .commands
            .iter()
            .any(|c| matches!(c, Command::Record(HistoryKind::Abandoned, _, _))));
        assert!(transition(second.item.as_ref(), &Trigger::FailedRetryDue, &ctx()).is_none());
    }

    #[test]
    fn test_abandoned_failure_has_no_retry() {
        let t = transition(
            Some(&item(ItemState::Copying)),
            &Trigger::CopyFailed {
                error: "path escapes root".into(),
                retries: 0,
                abandon: true,
            },
            &ctx(),
        )
        .unwrap();
        assert_eq!(t.item.unwrap().retry_at, None);
    }

    #[test]
    fn test_stop_on_cached_arms_cleanup() {
        let deadline = ctx().now + Duration::hours(24);
        let t = transition(
            Some(&item(ItemState::Cached)),
            &Trigger::PlaybackStopped { deadline },
            &ctx(),
        )
        .unwrap();
        assert_eq!(t.state(), Some(ItemState::PendingCleanup));
        assert!(t.has(&Command::ScheduleTimer(TimerSlot::Cleanup, deadline)));
        assert!(!t.has(&Command::RestoreOriginal));
    }

    #[test]
    fn test_cleanup_due_before_deadline_is_ignored() {
        let mut pending = item(ItemState::PendingCleanup);
        pending.cleanup_deadline_at = Some(ctx().now + Duration::seconds(1));
        assert!(transition(Some(&pending), &Trigger::CleanupDue, &ctx()).is_none());

        pending.cleanup_deadline_at = Some(ctx().now);
        let t = transition(Some(&pending), &Trigger::CleanupDue, &ctx()).unwrap();
        assert_eq!(t.state(), Some(ItemState::Evicted));
    }

    #[test]
    fn test_eviction_command_order() {
        let t = transition(
            Some(&item(ItemState::Cached)),
            &Trigger::ForceEvict {
                reason: "space pressure".into(),
            },
            &ctx(),
        )
        .unwrap();
        let kinds: Vec<&Command> = t.commands.iter().collect();
        assert_eq!(kinds[0], &Command::Persist);
        assert_eq!(kinds[1], &Command::CancelTimer(TimerSlot::Cleanup));
        assert_eq!(kinds[2], &Command::RestoreOriginal);
        assert_eq!(kinds[3], &Command::DeleteCacheFile);
        assert_eq!(kinds[4], &Command::MoverIgnore(MoverIgnoreOp::Remove));
        assert_eq!(kinds.last(), Some(&&Command::DeleteRecord));
    }

    #[test]
    fn test_resume_eviction_skips_persist() {
        let t = transition(
            Some(&item(ItemState::Evicted)),
            &Trigger::ResumeEviction,
            &ctx(),
        )
        .unwrap();
        assert!(!t.has(&Command::Persist));
        assert!(t.has(&Command::RestoreOriginal));
        assert!(transition(Some(&item(ItemState::Cached)), &Trigger::ResumeEviction, &ctx()).is_none());
    }

    #[test]
    fn test_force_evict_requires_cached_state() {
        let trigger = Trigger::ForceEvict {
            reason: "manual".into(),
        };
        assert!(transition(Some(&item(ItemState::Copying)), &trigger, &ctx()).is_none());
        assert!(transition(Some(&item(ItemState::Failed)), &trigger, &ctx()).is_none());
        assert!(transition(None, &trigger, &ctx()).is_none());
    }

    #[test]
    fn test_activity_touches_last_activity() {
        let t = transition(Some(&item(ItemState::PendingCleanup)), &Trigger::Activity, &ctx())
            .unwrap();
        let row = t.item.unwrap();
        assert_eq!(row.state, ItemState::PendingCleanup);
        assert_eq!(row.last_activity_at, ctx().now);
        assert!(transition(Some(&item(ItemState::Failed)), &Trigger::Activity, &ctx()).is_none());
    }
}
