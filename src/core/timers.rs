//! One-shot keyed timers driven by polling.
//!
//! Nothing here spawns threads: an owner schedules deadlines against its
//! [`Clock`](super::clock::Clock) and periodically asks for the timers that
//! are due, like a main loop ticking a debounced preloader.
//!
//! Invariants:
//! - a cancelled timer never fires
//! - a timer fires at most once (it is removed when reported as due)

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use log::trace;

/// Handle for a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Deadline-ordered queue of one-shot timers carrying a key `K`.
#[derive(Debug)]
pub struct TimerQueue<K> {
    /// (deadline, id) -> key; ordered so the earliest deadline pops first
    queue: BTreeMap<(Duration, TimerId), K>,
    /// id -> deadline, for O(log n) cancel
    deadlines: HashMap<TimerId, Duration>,
    next_id: u64,
}

impl<K> Default for TimerQueue<K> {
    fn default() -> Self {
        Self {
            queue: BTreeMap::new(),
            deadlines: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<K> TimerQueue<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `key` to fire `delay` after `now`.
    pub fn schedule(&mut self, key: K, now: Duration, delay: Duration) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let deadline = now.saturating_add(delay);
        self.queue.insert((deadline, id), key);
        self.deadlines.insert(id, deadline);
        trace!("{} scheduled for {}ms", id, deadline.as_millis());
        id
    }

    /// Cancel a pending timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id) {
            Some(deadline) => {
                self.queue.remove(&(deadline, id));
                trace!("{} cancelled", id);
                true
            }
            None => false,
        }
    }

    /// Pop every timer whose deadline is at or before `now`, earliest first.
    pub fn due(&mut self, now: Duration) -> Vec<(TimerId, K)> {
        let mut fired = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            let (deadline, id) = *entry.key();
            if deadline > now {
                break;
            }
            let key = entry.remove();
            self.deadlines.remove(&id);
            fired.push((id, key));
        }
        if !fired.is_empty() {
            trace!("{} timer(s) due at {}ms", fired.len(), now.as_millis());
        }
        fired
    }

    /// Deadline of a pending timer
    pub fn deadline(&self, id: TimerId) -> Option<Duration> {
        self.deadlines.get(&id).copied()
    }

    /// Earliest pending deadline, if any
    pub fn next_deadline(&self) -> Option<Duration> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Drop every pending timer
    pub fn clear(&mut self) {
        self.queue.clear();
        self.deadlines.clear();
    }
}
