//! Deadline queue for the scheduler loop
//!
//! A min-heap of `(deadline, sequence, kind)`. Rescheduling a kind pushes a
//! new entry and bumps its live sequence number; stale heap entries are
//! skipped when they reach the top.

use crate::state::TimerSlot;
use chrono::{DateTime, Utc};
use core_store::ItemId;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    Cooldown(ItemId),
    Cleanup(ItemId),
    FailedRetry(ItemId),
    Maintenance,
}

impl TimerKind {
    pub fn for_slot(slot: TimerSlot, item_id: &ItemId) -> Self {
        match slot {
            TimerSlot::Cleanup => TimerKind::Cleanup(item_id.clone()),
            TimerSlot::FailedRetry => TimerKind::FailedRetry(item_id.clone()),
        }
    }

    pub fn item_id(&self) -> Option<&ItemId> {
        match self {
            TimerKind::Cooldown(id) | TimerKind::Cleanup(id) | TimerKind::FailedRetry(id) => {
                Some(id)
            }
            TimerKind::Maintenance => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, u64, TimerKind)>>,
    live: HashMap<TimerKind, (u64, DateTime<Utc>)>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind` at `at`, replacing any earlier deadline for the same kind
    pub fn schedule(&mut self, kind: TimerKind, at: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(kind.clone(), (seq, at));
        self.heap.push(Reverse((at, seq, kind)));
    }

    pub fn cancel(&mut self, kind: &TimerKind) -> bool {
        self.live.remove(kind).is_some()
    }

    pub fn deadline(&self, kind: &TimerKind) -> Option<DateTime<Utc>> {
        self.live.get(kind).map(|(_, at)| *at)
    }

    pub fn is_scheduled(&self, kind: &TimerKind) -> bool {
        self.live.contains_key(kind)
    }

    /// Remove and return every live timer due at or before `now`, earliest first
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<(TimerKind, DateTime<Utc>)> {
        let mut due = Vec::new();
        while let Some(Reverse((at, _, _))) = self.heap.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((at, seq, kind))) = self.heap.pop() else {
                break;
            };
            if self.is_live(&kind, seq) {
                self.live.remove(&kind);
                due.push((kind, at));
            }
        }
        due
    }

    /// Earliest live deadline
    pub fn next_deadline(&mut self) -> Option<DateTime<Utc>> {
        while let Some(Reverse((at, seq, kind))) = self.heap.peek() {
            if self.is_live(kind, *seq) {
                return Some(*at);
            }
            self.heap.pop();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn is_live(&self, kind: &TimerKind, seq: u64) -> bool {
        self.live.get(kind).is_some_and(|(live_seq, _)| *live_seq == seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn cleanup(id: &str) -> TimerKind {
        TimerKind::Cleanup(ItemId::from(id))
    }

    #[test]
    fn test_pops_in_deadline_order() {
        let mut queue = TimerQueue::new();
        queue.schedule(cleanup("b"), at(20));
        queue.schedule(TimerKind::Maintenance, at(5));
        queue.schedule(cleanup("a"), at(10));

        let due: Vec<_> = queue.pop_due(at(15)).into_iter().map(|(k, _)| k).collect();
        assert_eq!(due, vec![TimerKind::Maintenance, cleanup("a")]);
        assert_eq!(queue.next_deadline(), Some(at(20)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_reschedule_replaces_deadline() {
        let mut queue = TimerQueue::new();
        queue.schedule(cleanup("a"), at(10));
        queue.schedule(cleanup("a"), at(100));

        assert!(queue.pop_due(at(50)).is_empty());
        assert_eq!(queue.deadline(&cleanup("a")), Some(at(100)));
        assert_eq!(queue.pop_due(at(100)).len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cancel_is_lazy() {
        let mut queue = TimerQueue::new();
        queue.schedule(cleanup("a"), at(10));
        queue.schedule(cleanup("b"), at(20));
        assert!(queue.cancel(&cleanup("a")));
        assert!(!queue.cancel(&cleanup("a")));

        assert_eq!(queue.next_deadline(), Some(at(20)));
        let due = queue.pop_due(at(30));
        assert_eq!(due, vec![(cleanup("b"), at(20))]);
    }

    #[test]
    fn test_equal_deadlines_fire_in_schedule_order() {
        let mut queue = TimerQueue::new();
        let when = at(0) + Duration::seconds(1);
        queue.schedule(cleanup("z"), when);
        queue.schedule(cleanup("a"), when);
        let due: Vec<_> = queue.pop_due(when).into_iter().map(|(k, _)| k).collect();
        assert_eq!(due, vec![cleanup("z"), cleanup("a")]);
    }

    #[test]
    fn test_slot_mapping() {
        let id = ItemId::from("7");
        assert_eq!(TimerKind::for_slot(TimerSlot::Cleanup, &id), TimerKind::Cleanup(id.clone()));
        assert_eq!(TimerKind::for_slot(TimerSlot::FailedRetry, &id).item_id(), Some(&id));
        assert_eq!(TimerKind::Maintenance.item_id(), None);
    }
}
