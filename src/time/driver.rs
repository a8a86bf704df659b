//! Time sources and the timer driver behind wakeup auto-release.
//!
//! The driver owns a deadline heap and the clock it is measured against. It
//! supports both production (wall clock) and virtual (test) time: with a
//! [`VirtualClock`] timers only fire when the test advances time and calls
//! [`TimerDriver::collect_expired`].

use super::heap::{ExpiredBatch, TimerHeap, TimerKey};
use crate::types::Time;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

#[inline]
fn duration_to_nanos_saturating(duration: Duration) -> u64 {
    duration.as_nanos().min(u128::from(u64::MAX)) as u64
}

/// Time source abstraction for getting the current time.
///
/// This trait allows the timer driver to work with both wall clock time
/// (production) and virtual time (testing).
pub trait TimeSource: Send + Sync + std::fmt::Debug {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// Wall clock time source for production use.
///
/// Uses `std::time::Instant` internally. The epoch is the time when this
/// source was created.
#[derive(Debug)]
pub struct WallClock {
    epoch: std::time::Instant,
}

impl WallClock {
    /// Creates a new wall clock time source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for WallClock {
    fn now(&self) -> Time {
        Time::from_nanos(duration_to_nanos_saturating(self.epoch.elapsed()))
    }
}

/// Virtual time source for testing.
///
/// Time only advances when explicitly told to do so, enabling
/// deterministic testing of timer races.
///
/// # Example
///
/// ```
/// use wakegate::time::{TimeSource, VirtualClock};
/// use wakegate::types::Time;
/// use std::time::Duration;
///
/// let clock = VirtualClock::new();
/// assert_eq!(clock.now(), Time::ZERO);
///
/// clock.advance(Duration::from_secs(1));
/// assert_eq!(clock.now(), Time::from_secs(1));
/// ```
#[derive(Debug, Default)]
pub struct VirtualClock {
    now: AtomicU64,
}

impl VirtualClock {
    /// Creates a new virtual clock starting at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a virtual clock starting at the given time.
    #[must_use]
    pub fn starting_at(time: Time) -> Self {
        Self {
            now: AtomicU64::new(time.as_nanos()),
        }
    }

    /// Advances time by the given duration.
    pub fn advance(&self, by: Duration) {
        self.now
            .fetch_add(duration_to_nanos_saturating(by), Ordering::AcqRel);
    }

    /// Advances time to the given absolute time.
    ///
    /// If the target time is in the past, this is a no-op.
    pub fn advance_to(&self, time: Time) {
        self.now.fetch_max(time.as_nanos(), Ordering::AcqRel);
    }
}

impl TimeSource for VirtualClock {
    fn now(&self) -> Time {
        Time::from_nanos(self.now.load(Ordering::Acquire))
    }
}

/// Timer driver that manages deadline registrations.
///
/// Each registration returns a [`TimerKey`]; an owner that re-arms passes
/// its previous key to [`rearm`](Self::rearm) so the queue holds at most one
/// entry per owner. Expired payloads are collected under the heap lock and
/// handed back so the caller fires them without holding it.
///
/// # Thread Safety
///
/// The driver is thread-safe. A background worker may block in
/// [`wait_for_work`](Self::wait_for_work) and is woken whenever a
/// registration moves the earliest deadline forward in time.
#[derive(Debug)]
pub struct TimerDriver<T> {
    clock: Arc<dyn TimeSource>,
    heap: Mutex<TimerHeap<T>>,
    changed: Condvar,
    shutdown: AtomicBool,
}

impl<T> TimerDriver<T> {
    /// Creates a new timer driver measuring deadlines against `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn TimeSource>) -> Self {
        Self {
            clock,
            heap: Mutex::new(TimerHeap::new()),
            changed: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Returns the current time from the underlying clock.
    #[inline]
    #[must_use]
    pub fn now(&self) -> Time {
        self.clock.now()
    }

    /// Registers `payload` to expire at `deadline`.
    pub fn register(&self, deadline: Time, payload: T) -> TimerKey {
        self.rearm(None, deadline, payload)
    }

    /// Drops the registration behind `previous`, if still queued, and
    /// registers `payload` to expire at `deadline`.
    pub fn rearm(&self, previous: Option<TimerKey>, deadline: Time, payload: T) -> TimerKey {
        let mut heap = self.heap.lock();
        if let Some(previous) = previous {
            heap.remove(previous);
        }
        let earliest = heap.peek_deadline();
        let key = heap.insert(deadline, payload);
        drop(heap);
        if earliest.is_none_or(|earliest| deadline < earliest) {
            self.changed.notify_all();
        }
        key
    }

    /// Removes a registration. Returns false if it already fired.
    pub fn cancel(&self, key: TimerKey) -> bool {
        self.heap.lock().remove(key).is_some()
    }

    /// Returns the next deadline that will fire, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Time> {
        self.heap.lock().peek_deadline()
    }

    /// Pops every registration whose deadline has passed.
    ///
    /// The caller fires the returned payloads; the heap lock is already
    /// released so firing may re-enter the driver.
    #[allow(clippy::significant_drop_tightening)]
    pub fn collect_expired(&self) -> ExpiredBatch<T> {
        let now = self.clock.now();
        self.heap.lock().pop_expired(now)
    }

    /// Returns the number of pending registrations.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.heap.lock().len()
    }

    /// Blocks the calling worker until a registration may be due.
    ///
    /// Returns `false` once [`shutdown`](Self::shutdown) was requested.
    /// Spurious returns are harmless: the worker re-collects and comes back.
    pub fn wait_for_work(&self, idle_wait: Duration) -> bool {
        let mut heap = self.heap.lock();
        if self.shutdown.load(Ordering::Acquire) {
            return false;
        }
        let wait = match heap.peek_deadline() {
            Some(deadline) => deadline.duration_since(self.clock.now()),
            None => idle_wait,
        };
        if !wait.is_zero() {
            let _ = self.changed.wait_for(&mut heap, wait);
        }
        !self.shutdown.load(Ordering::Acquire)
    }

    /// Requests that any worker blocked in [`wait_for_work`](Self::wait_for_work) exits.
    pub fn shutdown(&self) {
        let _heap = self.heap.lock();
        self.shutdown.store(true, Ordering::Release);
        self.changed.notify_all();
    }

    /// Returns true once shutdown was requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}
