//! Suspend gate: the save/poll/pending protocol of the suspend orchestrator.
//!
//! ```text
//!            save_baseline(c) ok
//! Disabled ───────────────────────► Armed(c)
//!    ▲                                 │ is_pending
//!    │         deviation latched       ▼
//!    └────────────────────────── Pending / Cleared
//! ```
//!
//! The gate owns the [`CombinedCounter`]. Producers move it through
//! [`SuspendGate::begin_event`] and [`SuspendGate::end_event`]; the
//! orchestrator samples it. A blocking poll sleeps on a wait queue that is
//! notified when the in-progress half reaches zero or a [`CancelSignal`] is
//! raised.
//!
//! Independent of the counter comparison, a sticky abort counter raised by
//! hard wakeups forces [`SuspendGate::abort_requested`] until cleared.

use super::counter::{CombinedCounter, CounterSnapshot};
use crate::tracing_compat::{debug, info};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Result of [`poll_blocking`](crate::WakeupContext::poll_blocking).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WakeupCount {
    /// Committed event count at return.
    pub count: u32,
    /// True when no event was in progress at return.
    pub quiescent: bool,
}

#[derive(Debug, Default)]
struct WaitQueue {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    fn notify_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }
}

#[derive(Debug)]
struct SignalInner {
    raised: AtomicBool,
    queue: Arc<WaitQueue>,
}

/// Interrupts a blocking poll.
///
/// Obtained from [`WakeupContext::cancel_signal`](crate::WakeupContext::cancel_signal).
/// Raising the signal wakes every blocked poll that was given it; the signal
/// stays raised until [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct CancelSignal {
    inner: Arc<SignalInner>,
}

impl CancelSignal {
    /// Raises the signal and wakes blocked pollers.
    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        self.inner.queue.notify_all();
    }

    /// Lowers the signal.
    pub fn reset(&self) {
        self.inner.raised.store(false, Ordering::SeqCst);
    }

    /// Returns true while the signal is raised.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct CheckState {
    enabled: bool,
    saved_count: u32,
}

/// Gate state shared by producers and the orchestrator.
#[derive(Debug, Default)]
pub(crate) struct SuspendGate {
    counter: CombinedCounter,
    check: Mutex<CheckState>,
    // Lock-free mirror of `check.enabled` for the producer hot path.
    check_hint: AtomicBool,
    abort: AtomicU32,
    suspend_in_progress: AtomicBool,
    wakeup_irq: Mutex<Option<u32>>,
    waiters: Arc<WaitQueue>,
}

impl SuspendGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn begin_event(&self) -> CounterSnapshot {
        self.counter.begin_event()
    }

    pub(crate) fn end_event(&self) -> CounterSnapshot {
        self.counter.end_event()
    }

    /// Wakes blocked pollers once `after` shows quiescence.
    pub(crate) fn notify_if_quiescent(&self, after: CounterSnapshot) {
        if after.is_quiescent() {
            self.waiters.notify_all();
        }
    }

    pub(crate) fn counters(&self) -> CounterSnapshot {
        self.counter.snapshot()
    }

    /// Returns true while a baseline is armed. Used to attribute
    /// `wakeup_count` without taking the check lock.
    pub(crate) fn check_enabled(&self) -> bool {
        self.check_hint.load(Ordering::Acquire)
    }

    pub(crate) fn cancel_signal(&self) -> CancelSignal {
        CancelSignal {
            inner: Arc::new(SignalInner {
                raised: AtomicBool::new(false),
                queue: Arc::clone(&self.waiters),
            }),
        }
    }

    /// Arms the gate with `expected` if the counter still matches it and is
    /// quiescent. Returns whether the gate is armed.
    pub(crate) fn save_baseline(&self, expected: u32) -> bool {
        let mut check = self.check.lock();
        check.enabled = false;
        let snap = self.counter.snapshot();
        if snap.committed == expected && snap.is_quiescent() {
            check.saved_count = expected;
            check.enabled = true;
        }
        self.check_hint.store(check.enabled, Ordering::Release);
        debug!(
            expected,
            committed = snap.committed,
            in_progress = snap.in_progress,
            armed = check.enabled,
            "save wakeup baseline"
        );
        check.enabled
    }

    /// Samples the counter, optionally blocking until it is quiescent.
    ///
    /// While blocked, `on_wait` runs every `interval` without the wait-queue
    /// lock held, so it may inspect sources.
    pub(crate) fn poll<F>(
        &self,
        block: bool,
        signal: Option<&CancelSignal>,
        interval: Duration,
        mut on_wait: F,
    ) -> WakeupCount
    where
        F: FnMut(),
    {
        if block {
            let mut guard = self.waiters.lock.lock();
            loop {
                if self.counter.snapshot().is_quiescent()
                    || signal.is_some_and(CancelSignal::is_raised)
                {
                    break;
                }
                if self.waiters.cond.wait_for(&mut guard, interval).timed_out() {
                    parking_lot::MutexGuard::unlocked(&mut guard, &mut on_wait);
                }
            }
        }
        let snap = self.counter.snapshot();
        WakeupCount {
            count: snap.committed,
            quiescent: snap.is_quiescent(),
        }
    }

    /// One-shot pending check against the armed baseline.
    ///
    /// Returns true when events arrived since the baseline or some are still
    /// in progress; a true result disarms the gate.
    pub(crate) fn latch_pending(&self) -> bool {
        let mut check = self.check.lock();
        if !check.enabled {
            return false;
        }
        let snap = self.counter.snapshot();
        let pending = snap.committed != check.saved_count || !snap.is_quiescent();
        check.enabled = !pending;
        self.check_hint.store(check.enabled, Ordering::Release);
        pending
    }

    pub(crate) fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst) > 0
    }

    #[cfg(test)]
    pub(crate) fn abort_count(&self) -> u32 {
        self.abort.load(Ordering::SeqCst)
    }

    pub(crate) fn force_abort(&self) {
        let prev = self.abort.fetch_add(1, Ordering::SeqCst);
        info!(abort = prev.saturating_add(1), "suspend abort requested");
    }

    /// Drops one abort request if any is outstanding.
    pub(crate) fn cancel_abort(&self) {
        let _ = self
            .abort
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub(crate) fn clear_wakeup(&self, reset_irq: bool) {
        self.abort.store(0, Ordering::SeqCst);
        if reset_irq {
            *self.wakeup_irq.lock() = None;
        }
    }

    pub(crate) fn begin_suspend(&self) {
        self.suspend_in_progress.store(true, Ordering::SeqCst);
    }

    pub(crate) fn end_suspend(&self) {
        self.suspend_in_progress.store(false, Ordering::SeqCst);
    }

    pub(crate) fn suspend_in_progress(&self) -> bool {
        self.suspend_in_progress.load(Ordering::SeqCst)
    }

    /// Records the first IRQ that woke a suspending system and aborts the
    /// suspend. Returns true if `irq` was recorded.
    pub(crate) fn system_irq_wakeup(&self, irq: u32) -> bool {
        if !self.suspend_in_progress() {
            return false;
        }
        {
            let mut recorded = self.wakeup_irq.lock();
            if recorded.is_some() {
                return false;
            }
            *recorded = Some(irq);
        }
        info!(irq, "system woken by interrupt");
        self.force_abort();
        true
    }

    pub(crate) fn wakeup_irq(&self) -> Option<u32> {
        *self.wakeup_irq.lock()
    }
}
