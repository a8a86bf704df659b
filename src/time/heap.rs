//! Timer queue for deadline management.
//!
//! An ordered map of `(deadline, generation) -> payload`. Every insertion
//! hands back a [`TimerKey`], so an owner that re-arms can drop its previous
//! entry instead of leaving it to expire. Payloads may still carry their own
//! validity token for entries already popped when the owner changes its mind.

use crate::types::Time;
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// Batch of payloads popped in one expiry pass.
pub type ExpiredBatch<T> = SmallVec<[T; 8]>;

/// Handle to one queued timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerKey {
    deadline: Time,
    generation: u64,
}

impl TimerKey {
    /// Deadline the entry was queued for.
    #[must_use]
    pub const fn deadline(self) -> Time {
        self.deadline
    }
}

/// Timers ordered by deadline, ties broken by insertion order.
#[derive(Debug)]
pub struct TimerHeap<T> {
    entries: BTreeMap<TimerKey, T>,
    next_generation: u64,
}

impl<T> Default for TimerHeap<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_generation: 0,
        }
    }
}

impl<T> TimerHeap<T> {
    /// Creates a new empty timer queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of queued timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds a timer with the given deadline.
    pub fn insert(&mut self, deadline: Time, payload: T) -> TimerKey {
        let key = TimerKey {
            deadline,
            generation: self.next_generation,
        };
        self.next_generation += 1;
        self.entries.insert(key, payload);
        key
    }

    /// Removes a queued timer. Returns `None` if it already fired or was
    /// removed.
    pub fn remove(&mut self, key: TimerKey) -> Option<T> {
        self.entries.remove(&key)
    }

    /// Returns the earliest deadline, if any.
    #[must_use]
    pub fn peek_deadline(&self) -> Option<Time> {
        self.entries.first_key_value().map(|(key, _)| key.deadline)
    }

    /// Pops all payloads whose deadline is `<= now`, earliest first.
    pub fn pop_expired(&mut self, now: Time) -> ExpiredBatch<T> {
        let mut expired = ExpiredBatch::new();
        while self
            .entries
            .first_key_value()
            .is_some_and(|(key, _)| key.deadline <= now)
        {
            if let Some((_, payload)) = self.entries.pop_first() {
                expired.push(payload);
            }
        }
        expired
    }
}
