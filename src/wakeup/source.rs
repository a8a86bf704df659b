//! Wakeup sources: one origin of "do not suspend yet" events.
//!
//! A source is created unregistered, added to a context's registry, toggled
//! between active and inactive by event reports, relaxes and timer
//! expiries, and finally removed and destroyed.
//!
//! ```text
//! new() ──► Prepared ──add──► Registered ◄──► (active / inactive)
//!                                 │
//!                              remove
//!                                 ▼
//!                              Removed ──destroy──► Destroyed
//! ```
//!
//! All mutable state sits behind one short-held per-source lock; no
//! operation sleeps while holding it. Registry membership changes (add,
//! remove, destroy) additionally serialize on a per-source membership lock,
//! which is held across the registry grace wait. The activation bookkeeping itself is
//! in [`SourceState`], the cross-source effects (combined counter, timers)
//! are applied by the [`WakeupContext`](super::WakeupContext).

use super::device::WakeIrq;
use super::stats::SourceStats;
use crate::time::TimerKey;
use crate::types::{SourceId, Time};
use parking_lot::{Mutex, MutexGuard};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Registration state of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// Allocated but never added to a registry.
    Prepared,
    /// Linked into a registry; events are accepted.
    Registered,
    /// Unlinked from its registry; events are ignored.
    Removed,
    /// Statistics merged into the aggregate sink.
    Destroyed,
}

/// Mutable per-source state, guarded by the source lock.
#[derive(Debug)]
pub(crate) struct SourceState {
    pub(crate) lifecycle: Lifecycle,
    pub(crate) active: bool,
    pub(crate) autosleep_enabled: bool,
    pub(crate) event_count: u64,
    pub(crate) active_count: u64,
    pub(crate) relax_count: u64,
    pub(crate) expire_count: u64,
    pub(crate) wakeup_count: u64,
    pub(crate) last_time: Time,
    pub(crate) start_prevent_time: Time,
    pub(crate) total_time: Duration,
    pub(crate) max_time: Duration,
    pub(crate) prevent_sleep_time: Duration,
    pub(crate) timer_expires: Option<Time>,
    pub(crate) timer_epoch: u64,
    /// Last entry queued with the timer driver; may already have fired.
    pub(crate) timer_key: Option<TimerKey>,
    pub(crate) wake_irq: Option<Arc<WakeIrq>>,
}

impl SourceState {
    const fn new() -> Self {
        Self {
            lifecycle: Lifecycle::Prepared,
            active: false,
            autosleep_enabled: false,
            event_count: 0,
            active_count: 0,
            relax_count: 0,
            expire_count: 0,
            wakeup_count: 0,
            last_time: Time::ZERO,
            start_prevent_time: Time::ZERO,
            total_time: Duration::ZERO,
            max_time: Duration::ZERO,
            prevent_sleep_time: Duration::ZERO,
            timer_expires: None,
            timer_epoch: 0,
            timer_key: None,
            wake_irq: None,
        }
    }

    /// Marks the source active. The caller bumps the combined counter.
    pub(crate) fn activate(&mut self, now: Time) {
        self.active = true;
        self.active_count += 1;
        self.last_time = now;
        if self.autosleep_enabled {
            self.start_prevent_time = now;
        }
    }

    /// Attempts to end the current activation.
    ///
    /// `relax_count` is bumped first and must then match `active_count`;
    /// otherwise another release already ended this activation and the
    /// attempt is undone. Returns true when the source was deactivated, in
    /// which case the caller commits one event on the combined counter.
    pub(crate) fn deactivate(&mut self, now: Time) -> bool {
        self.relax_count += 1;
        if self.relax_count != self.active_count {
            self.relax_count -= 1;
            return false;
        }

        self.active = false;
        let duration = now.duration_since(self.last_time);
        self.total_time += duration;
        if duration > self.max_time {
            self.max_time = duration;
        }
        self.last_time = now;
        self.cancel_timer();
        if self.autosleep_enabled {
            self.fold_prevent_time(now);
        }
        true
    }

    /// Arms the auto-release deadline unless a later one is already armed.
    ///
    /// Returns the epoch stamped on the new deadline, or `None` when the
    /// armed deadline already covers `deadline`.
    pub(crate) fn arm_timer(&mut self, deadline: Time) -> Option<u64> {
        if self.timer_expires.is_some_and(|armed| deadline <= armed) {
            return None;
        }
        self.timer_epoch += 1;
        self.timer_expires = Some(deadline);
        Some(self.timer_epoch)
    }

    /// Disarms the auto-release deadline; pending firings become stale.
    pub(crate) fn cancel_timer(&mut self) {
        if self.timer_expires.take().is_some() {
            self.timer_epoch += 1;
        }
    }

    /// Returns true when a firing stamped with `epoch` at `now` must release.
    pub(crate) fn timer_due(&self, epoch: u64, now: Time) -> bool {
        self.active
            && self.timer_epoch == epoch
            && self.timer_expires.is_some_and(|expires| now >= expires)
    }

    pub(crate) fn fold_prevent_time(&mut self, now: Time) {
        self.prevent_sleep_time += now.duration_since(self.start_prevent_time);
    }
}

/// One origin of wakeup events.
///
/// Sources are shared as `Arc<WakeupSource>`: the creator owns it, the
/// registry links it while registered, and armed timers refer to it weakly.
pub struct WakeupSource {
    name: Cow<'static, str>,
    id: Option<SourceId>,
    state: Mutex<SourceState>,
    membership: Mutex<()>,
    warned: AtomicBool,
}

impl WakeupSource {
    /// Prepares an unregistered source with all statistics zeroed.
    ///
    /// Sources created this way carry no identifier; use
    /// [`WakeupContext::create_source`](super::WakeupContext::create_source)
    /// to get one.
    #[must_use]
    pub fn new(name: impl Into<Cow<'static, str>>) -> Arc<Self> {
        Arc::new(Self::with_id(name.into(), None))
    }

    pub(crate) fn with_id(name: Cow<'static, str>, id: Option<SourceId>) -> Self {
        Self {
            name,
            id,
            state: Mutex::new(SourceState::new()),
            membership: Mutex::new(()),
            warned: AtomicBool::new(false),
        }
    }

    /// Returns the source name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the identifier allocated by the owning context, if any.
    #[must_use]
    pub const fn id(&self) -> Option<SourceId> {
        self.id
    }

    /// Returns true while an activation is outstanding.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Returns the current registration state.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    /// Returns the armed auto-release deadline, if any.
    #[must_use]
    pub fn timer_expires(&self) -> Option<Time> {
        self.state.lock().timer_expires
    }

    /// Returns the wake IRQ linked to this source through its device.
    #[must_use]
    pub fn wake_irq(&self) -> Option<Arc<WakeIrq>> {
        self.state.lock().wake_irq.clone()
    }

    /// Copies the raw counters and accumulated times.
    #[must_use]
    pub fn stats(&self) -> SourceStats {
        let state = self.state.lock();
        SourceStats::capture(&self.name, &state)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock()
    }

    /// Serializes registry membership changes. Taken before the source lock.
    pub(crate) fn membership(&self) -> MutexGuard<'_, ()> {
        self.membership.lock()
    }

    /// Returns true the first time it is called for this source.
    pub(crate) fn first_warning(&self) -> bool {
        !self.warned.swap(true, Ordering::Relaxed)
    }
}

impl fmt::Debug for WakeupSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WakeupSource")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("lifecycle", &state.lifecycle)
            .field("active", &state.active)
            .field("event_count", &state.event_count)
            .finish_non_exhaustive()
    }
}

/// Allocator for source identifiers, lowest free value first.
#[derive(Debug, Default)]
pub(crate) struct IdAllocator {
    next: u32,
    free: BTreeSet<u32>,
}

impl IdAllocator {
    pub(crate) fn alloc(&mut self) -> SourceId {
        if let Some(raw) = self.free.pop_first() {
            return SourceId::from_raw(raw);
        }
        let raw = self.next;
        self.next = self.next.wrapping_add(1);
        SourceId::from_raw(raw)
    }

    pub(crate) fn release(&mut self, id: SourceId) {
        if id.as_u32() < self.next {
            self.free.insert(id.as_u32());
        }
    }
}
