//! Priority scheduler - decides which queued transfers start next
//!
//! Pending transfers are ordered by priority (high first) and then by
//! arrival. Promotion is non-blocking: callers ask for the next ready
//! transfer whenever a slot frees or something new is queued. A priority
//! change keeps the transfer's arrival number within its new tier.

use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use swarmsync_types::{Priority, TransferId};
use tracing::debug;

type QueueKey = (Reverse<Priority>, u64);

/// Slot accounting for one direction of transfers
pub struct PriorityScheduler {
    name: &'static str,
    state: Mutex<SchedulerState>,
}

struct SchedulerState {
    pending: BTreeMap<QueueKey, TransferId>,
    keys: HashMap<TransferId, QueueKey>,
    active: HashSet<TransferId>,
    max_concurrent: usize,
    next_seq: u64,
}

/// Queue sizes at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerCounts {
    pub pending: usize,
    pub active: usize,
    pub max_concurrent: usize,
}

impl PriorityScheduler {
    pub fn new(name: &'static str, max_concurrent: usize) -> Self {
        Self {
            name,
            state: Mutex::new(SchedulerState {
                pending: BTreeMap::new(),
                keys: HashMap::new(),
                active: HashSet::new(),
                max_concurrent: max_concurrent.max(1),
                next_seq: 0,
            }),
        }
    }

    /// Queue a transfer. Returns false if it is already known.
    pub fn enqueue(&self, id: TransferId, priority: Priority) -> bool {
        let mut state = self.state.lock();
        if state.keys.contains_key(&id) || state.active.contains(&id) {
            return false;
        }
        let key = (Reverse(priority), state.next_seq);
        state.next_seq += 1;
        state.pending.insert(key, id);
        state.keys.insert(id, key);
        true
    }

    /// Re-sort a pending transfer. Active transfers are left alone.
    pub fn set_priority(&self, id: TransferId, priority: Priority) -> bool {
        let mut state = self.state.lock();
        let Some(old) = state.keys.get(&id).copied() else {
            return false;
        };
        if old.0 .0 == priority {
            return true;
        }
        state.pending.remove(&old);
        let key = (Reverse(priority), old.1);
        state.pending.insert(key, id);
        state.keys.insert(id, key);
        debug!("{} scheduler: {} moved to {}", self.name, id, priority.as_str());
        true
    }

    /// Forget a transfer, pending or active
    pub fn remove(&self, id: TransferId) -> bool {
        let mut state = self.state.lock();
        if let Some(key) = state.keys.remove(&id) {
            state.pending.remove(&key);
            return true;
        }
        state.active.remove(&id)
    }

    /// Promote the best pending transfer if a slot is free
    pub fn next_ready(&self) -> Option<TransferId> {
        let mut state = self.state.lock();
        if state.active.len() >= state.max_concurrent {
            return None;
        }
        let (_, id) = state.pending.pop_first()?;
        state.keys.remove(&id);
        state.active.insert(id);
        debug!(
            "{} scheduler: activated {} ({}/{})",
            self.name,
            id,
            state.active.len(),
            state.max_concurrent
        );
        Some(id)
    }

    /// Free the slot of a transfer that reached a finished state
    pub fn release(&self, id: TransferId) -> bool {
        self.state.lock().active.remove(&id)
    }

    pub fn set_max_concurrent(&self, max: usize) {
        self.state.lock().max_concurrent = max.max(1);
    }

    pub fn is_pending(&self, id: TransferId) -> bool {
        self.state.lock().keys.contains_key(&id)
    }

    pub fn is_active(&self, id: TransferId) -> bool {
        self.state.lock().active.contains(&id)
    }

    /// Pending transfers in activation order
    pub fn pending_ids(&self) -> Vec<TransferId> {
        self.state.lock().pending.values().copied().collect()
    }

    pub fn counts(&self) -> SchedulerCounts {
        let state = self.state.lock();
        SchedulerCounts {
            pending: state.pending.len(),
            active: state.active.len(),
            max_concurrent: state.max_concurrent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_priority_then_arrival() {
        let scheduler = PriorityScheduler::new("download", 1);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        scheduler.enqueue(a, Priority::High);
        scheduler.enqueue(b, Priority::Normal);
        scheduler.enqueue(c, Priority::High);

        let mut order = Vec::new();
        while let Some(id) = scheduler.next_ready() {
            order.push(id);
            assert!(scheduler.next_ready().is_none());
            scheduler.release(id);
        }
        assert_eq!(order, vec![a, c, b]);
    }

    #[test]
    fn test_priority_change_never_preempts() {
        let scheduler = PriorityScheduler::new("download", 1);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        scheduler.enqueue(a, Priority::Low);
        scheduler.enqueue(b, Priority::Normal);
        assert_eq!(scheduler.next_ready(), Some(b));

        // Raising a pending one re-sorts, lowering the running one does nothing
        assert!(scheduler.set_priority(a, Priority::High));
        assert!(!scheduler.set_priority(b, Priority::Low));
        assert!(scheduler.is_active(b));
        assert_eq!(scheduler.next_ready(), None);
        scheduler.release(b);
        assert_eq!(scheduler.next_ready(), Some(a));
    }

    #[test]
    fn test_same_tier_keeps_arrival_order() {
        let scheduler = PriorityScheduler::new("upload", 2);
        let ids: Vec<_> = (0..4).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            scheduler.enqueue(*id, Priority::Low);
        }
        scheduler.set_priority(ids[3], Priority::Normal);
        scheduler.set_priority(ids[1], Priority::Normal);
        assert_eq!(scheduler.pending_ids(), vec![ids[1], ids[3], ids[0], ids[2]]);

        assert!(!scheduler.enqueue(ids[0], Priority::High));
        assert!(scheduler.remove(ids[0]));
        assert_eq!(
            scheduler.counts(),
            SchedulerCounts {
                pending: 3,
                active: 0,
                max_concurrent: 2
            }
        );
    }
}
