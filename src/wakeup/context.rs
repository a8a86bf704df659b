//! The wakeup context: one explicit instance of the whole subsystem.
//!
//! A [`WakeupContext`] owns the registry, the suspend gate with its combined
//! counter, the aggregate sink, the identifier allocator and the timer
//! driver. Producers report events on [`WakeupSource`]s through it; the
//! suspend orchestrator drives the gate through it. Independent contexts
//! share nothing, so tests build one each.
//!
//! # Locking
//!
//! Per-source operations take only the source lock and never sleep. The
//! combined counter is an atomic and needs no lock. Adding, removing and
//! destroying a source serialize on its membership lock, which removal holds
//! through the registry grace wait. Lock order, where two are held at once:
//!
//! ```text
//! membership lock -> source lock -> timer heap lock
//! device power lock -> source lock
//! source lock -> wait-queue lock
//! ```
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use wakegate::{WakeupConfig, WakeupContext};
//! use wakegate::time::VirtualClock;
//!
//! let clock = Arc::new(VirtualClock::new());
//! let ctx = WakeupContext::builder()
//!     .clock(clock.clone())
//!     .config(WakeupConfig::manual_timers())
//!     .build()
//!     .unwrap();
//!
//! let ws = ctx.register("modem");
//! let count = ctx.poll_blocking(false, None).count;
//! assert!(ctx.save_baseline(count));
//!
//! ctx.wakeup_event(&ws, Duration::from_millis(100));
//! assert!(ctx.is_pending());
//!
//! clock.advance(Duration::from_millis(100));
//! assert_eq!(ctx.process_timers(), 1);
//! assert!(!ws.is_active());
//! ```

use super::counter::CounterSnapshot;
use super::device::{Device, WakeIrq};
use super::gate::{CancelSignal, SuspendGate, WakeupCount};
use super::registry::Registry;
use super::sink::AggregateSink;
use super::source::{IdAllocator, Lifecycle, SourceState, WakeupSource};
use super::stats::{DiagnosticsRow, DiagnosticsSnapshot, SourceStats};
use crate::config::WakeupConfig;
use crate::error::{Result, WakeupError};
use crate::time::{ExpiredBatch, TimeSource, TimerDriver, TimerThread, WallClock};
use crate::tracing_compat::{debug, trace, warn};
use crate::types::Time;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A pending auto-release, stamped with the epoch it was armed under.
#[derive(Debug)]
pub(crate) struct Expiry {
    source: Weak<WakeupSource>,
    epoch: u64,
}

/// Builder for [`WakeupContext`].
#[derive(Debug, Default)]
pub struct WakeupContextBuilder {
    clock: Option<Arc<dyn TimeSource>>,
    config: WakeupConfig,
}

impl WakeupContextBuilder {
    /// Uses `clock` instead of the wall clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn config(mut self, config: WakeupConfig) -> Self {
        self.config = config;
        self
    }

    /// Validates the configuration and builds the context.
    ///
    /// With `timer_thread` enabled this spawns the timer worker, which holds
    /// only a weak reference to the context.
    pub fn build(self) -> Result<Arc<WakeupContext>> {
        self.config.validate()?;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(WallClock::new()) as Arc<dyn TimeSource>);

        let ctx = Arc::new(WakeupContext {
            timers: Arc::new(TimerDriver::with_clock(clock)),
            registry: Registry::new(),
            gate: SuspendGate::new(),
            sink: AggregateSink::new(),
            ids: Mutex::new(IdAllocator::default()),
            autosleep: AtomicBool::new(false),
            worker: Mutex::new(None),
            config: self.config,
        });

        if ctx.config.timer_thread {
            let weak = Arc::downgrade(&ctx);
            let worker = TimerThread::spawn(
                &ctx.config.timer_thread_name,
                Arc::clone(&ctx.timers),
                move |batch| {
                    if let Some(ctx) = weak.upgrade() {
                        ctx.fire_expired(batch);
                    }
                },
            )
            .map_err(|e| WakeupError::TimerThread(e.to_string()))?;
            *ctx.worker.lock() = Some(worker);
        }

        debug!(
            timer_thread = ctx.config.timer_thread,
            "wakeup context created"
        );
        Ok(ctx)
    }
}

/// Wakeup-event accounting and suspend gating.
pub struct WakeupContext {
    config: WakeupConfig,
    timers: Arc<TimerDriver<Expiry>>,
    registry: Registry,
    gate: SuspendGate,
    sink: AggregateSink,
    ids: Mutex<IdAllocator>,
    autosleep: AtomicBool,
    worker: Mutex<Option<TimerThread<Expiry>>>,
}

impl WakeupContext {
    /// Starts building a context.
    #[must_use]
    pub fn builder() -> WakeupContextBuilder {
        WakeupContextBuilder::default()
    }

    /// Current time on the context clock.
    #[must_use]
    pub fn now(&self) -> Time {
        self.timers.now()
    }

    /// The configuration the context was built with.
    #[must_use]
    pub const fn config(&self) -> &WakeupConfig {
        &self.config
    }

    // ----------------------------------------------------------------
    // Source lifecycle
    // ----------------------------------------------------------------

    /// Prepares an unregistered source with a fresh identifier.
    pub fn create_source(&self, name: impl Into<Cow<'static, str>>) -> Arc<WakeupSource> {
        let id = self.ids.lock().alloc();
        Arc::new(WakeupSource::with_id(name.into(), Some(id)))
    }

    /// Registers a prepared (or previously removed) source.
    ///
    /// Returns false if the source is already registered or destroyed.
    pub fn add_source(&self, source: &Arc<WakeupSource>) -> bool {
        let _membership = source.membership();
        let now = self.now();
        {
            let mut state = source.lock();
            if !matches!(state.lifecycle, Lifecycle::Prepared | Lifecycle::Removed) {
                return false;
            }
            state.lifecycle = Lifecycle::Registered;
            state.active = false;
            state.last_time = now;
            state.autosleep_enabled = self.autosleep.load(Ordering::Acquire);
        }
        self.registry.insert(source);
        debug!(source = %source.name(), id = ?source.id(), "wakeup source registered");
        true
    }

    /// Creates and registers a source.
    pub fn register(&self, name: impl Into<Cow<'static, str>>) -> Arc<WakeupSource> {
        let source = self.create_source(name);
        self.add_source(&source);
        source
    }

    /// Unregisters a source.
    ///
    /// Cancels its timer, releases an outstanding activation and unlinks it
    /// from the registry. When this returns no registry traversal can see
    /// the source. Must not be called from inside a registry traversal.
    pub fn remove_source(&self, source: &Arc<WakeupSource>) -> bool {
        let _membership = source.membership();
        self.remove_member(source)
    }

    /// Unlinks a registered source. The caller holds its membership lock.
    fn remove_member(&self, source: &Arc<WakeupSource>) -> bool {
        let now = self.now();
        let released = {
            let mut state = source.lock();
            if state.lifecycle != Lifecycle::Registered {
                return false;
            }
            state.lifecycle = Lifecycle::Removed;
            self.disarm_locked(&mut state);
            if state.active {
                self.deactivate_locked(source, &mut state, now)
            } else {
                None
            }
        };
        if let Some(after) = released {
            self.gate.notify_if_quiescent(after);
        }
        self.registry.remove(source);
        debug!(source = %source.name(), "wakeup source removed");
        true
    }

    /// Removes a source and merges its final statistics into the aggregate.
    ///
    /// Destroying twice is a no-op. A destroy racing another destroy or a
    /// removal of the same source waits for it to finish unlinking.
    pub fn destroy_source(&self, source: &Arc<WakeupSource>) {
        let _membership = source.membership();
        self.remove_member(source);
        let stats = {
            let mut state = source.lock();
            if state.lifecycle == Lifecycle::Destroyed {
                return;
            }
            state.lifecycle = Lifecycle::Destroyed;
            SourceStats::capture(source.name(), &state)
        };
        self.sink.record(&stats);
        if let Some(id) = source.id() {
            self.ids.lock().release(id);
        }
    }

    /// Removes and destroys a registered source.
    pub fn unregister(&self, source: &Arc<WakeupSource>) {
        self.destroy_source(source);
    }

    // ----------------------------------------------------------------
    // Event reporting
    // ----------------------------------------------------------------

    /// Records one wakeup event, activating the source if it is inactive.
    ///
    /// A `hard` event also aborts any suspend in flight. An armed
    /// auto-release deadline is left as is.
    pub fn report_event(&self, source: &Arc<WakeupSource>, hard: bool) {
        let now = self.now();
        let mut state = source.lock();
        if self.accepts_events(source, &state) {
            self.report_locked(source, &mut state, now, hard);
        }
    }

    /// Reports an event and keeps the source active until [`relax`](Self::relax).
    pub fn stay_awake(&self, source: &Arc<WakeupSource>) {
        let now = self.now();
        let mut state = source.lock();
        if !self.accepts_events(source, &state) {
            return;
        }
        self.report_locked(source, &mut state, now, false);
        self.disarm_locked(&mut state);
    }

    /// Ends the source's activation. No-op when inactive.
    pub fn relax(&self, source: &Arc<WakeupSource>) {
        let now = self.now();
        let released = {
            let mut state = source.lock();
            if !state.active {
                return;
            }
            self.deactivate_locked(source, &mut state, now)
        };
        if let Some(after) = released {
            self.gate.notify_if_quiescent(after);
        }
    }

    /// Reports an event that releases itself after `duration`.
    ///
    /// A zero duration releases immediately. Otherwise the auto-release
    /// deadline becomes `now + duration`, unless a later deadline is already
    /// armed: a shorter follow-up never pulls the deadline earlier.
    pub fn wakeup_event(&self, source: &Arc<WakeupSource>, duration: Duration) {
        self.timed_event(source, duration, false);
    }

    /// Like [`wakeup_event`](Self::wakeup_event), and aborts any suspend in flight.
    pub fn wakeup_event_hard(&self, source: &Arc<WakeupSource>, duration: Duration) {
        self.timed_event(source, duration, true);
    }

    fn timed_event(&self, source: &Arc<WakeupSource>, duration: Duration, hard: bool) {
        let now = self.now();
        let released = {
            let mut state = source.lock();
            if !self.accepts_events(source, &state) {
                return;
            }
            self.report_locked(source, &mut state, now, hard);
            if duration.is_zero() {
                self.deactivate_locked(source, &mut state, now)
            } else {
                let deadline = now + duration;
                if let Some(epoch) = state.arm_timer(deadline) {
                    let expiry = Expiry {
                        source: Arc::downgrade(source),
                        epoch,
                    };
                    let previous = state.timer_key.take();
                    state.timer_key = Some(self.timers.rearm(previous, deadline, expiry));
                    trace!(source = %source.name(), %deadline, epoch, "auto-release armed");
                }
                None
            }
        };

        if let Some(after) = released {
            self.gate.notify_if_quiescent(after);
        }
    }

    /// Fires every auto-release whose deadline has passed.
    ///
    /// Returns the number of sources released. Contexts built without a
    /// timer thread call this to pump their timers.
    pub fn process_timers(&self) -> usize {
        let batch = self.timers.collect_expired();
        self.fire_expired(batch)
    }

    /// Number of queued auto-release entries; at most one per source.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.timers.pending_count()
    }

    fn fire_expired(&self, batch: ExpiredBatch<Expiry>) -> usize {
        let mut released = 0;
        for expiry in batch {
            let Some(source) = expiry.source.upgrade() else {
                continue;
            };
            let now = self.now();
            let after = {
                let mut state = source.lock();
                if !state.timer_due(expiry.epoch, now) {
                    trace!(source = %source.name(), epoch = expiry.epoch, "stale auto-release");
                    continue;
                }
                let after = self.deactivate_locked(&source, &mut state, now);
                if after.is_some() {
                    state.expire_count += 1;
                }
                after
            };
            if let Some(after) = after {
                released += 1;
                debug!(source = %source.name(), "wakeup source auto-released");
                self.gate.notify_if_quiescent(after);
            }
        }
        released
    }

    fn accepts_events(&self, source: &WakeupSource, state: &SourceState) -> bool {
        if state.lifecycle == Lifecycle::Registered {
            return true;
        }
        if source.first_warning() {
            warn!(
                source = %source.name(),
                lifecycle = ?state.lifecycle,
                "wakeup event on unregistered source ignored"
            );
        }
        false
    }

    fn report_locked(&self, source: &WakeupSource, state: &mut SourceState, now: Time, hard: bool) {
        state.event_count += 1;
        if self.gate.check_enabled() {
            state.wakeup_count += 1;
        }
        if !state.active {
            state.activate(now);
            let after = self.gate.begin_event();
            trace!(
                source = %source.name(),
                in_progress = after.in_progress,
                "wakeup source activated"
            );
        }
        if hard {
            self.gate.force_abort();
        }
    }

    /// Disarms the auto-release and drops its queued entry.
    fn disarm_locked(&self, state: &mut SourceState) {
        state.cancel_timer();
        if let Some(key) = state.timer_key.take() {
            self.timers.cancel(key);
        }
    }

    /// Deactivates under the source lock. Returns the counter state after
    /// committing, or `None` if a concurrent release already won.
    fn deactivate_locked(
        &self,
        source: &WakeupSource,
        state: &mut SourceState,
        now: Time,
    ) -> Option<CounterSnapshot> {
        if !state.deactivate(now) {
            trace!(source = %source.name(), "deactivation superseded");
            return None;
        }
        if let Some(key) = state.timer_key.take() {
            self.timers.cancel(key);
        }
        let after = self.gate.end_event();
        trace!(
            source = %source.name(),
            committed = after.committed,
            in_progress = after.in_progress,
            "wakeup source deactivated"
        );
        Some(after)
    }

    // ----------------------------------------------------------------
    // Suspend gate
    // ----------------------------------------------------------------

    /// Arms the gate if `count` is still the committed count and nothing is
    /// in progress. Returns whether the gate is armed.
    pub fn save_baseline(&self, count: u32) -> bool {
        self.gate.save_baseline(count)
    }

    /// Returns the committed count and whether nothing is in progress.
    ///
    /// With `block`, waits first until nothing is in progress or `signal`
    /// is raised, logging the active sources every straggler interval.
    pub fn poll_blocking(&self, block: bool, signal: Option<&CancelSignal>) -> WakeupCount {
        self.gate.poll(
            block,
            signal,
            self.config.straggler_log_interval,
            || self.log_active_sources(),
        )
    }

    /// Returns true if the suspend in preparation must be abandoned.
    ///
    /// Deviation from the armed baseline latches once and disarms the gate;
    /// a raised abort counter forces true until cleared.
    pub fn is_pending(&self) -> bool {
        let latched = self.gate.latch_pending();
        if latched && self.config.log_active_on_pending {
            self.log_active_sources();
        }
        latched || self.gate.abort_requested()
    }

    /// Raw committed and in-progress counts.
    #[must_use]
    pub fn counters(&self) -> CounterSnapshot {
        self.gate.counters()
    }

    /// Creates a signal that interrupts blocking polls on this context.
    #[must_use]
    pub fn cancel_signal(&self) -> CancelSignal {
        self.gate.cancel_signal()
    }

    /// Requests that any suspend in flight abort.
    pub fn force_abort(&self) {
        self.gate.force_abort();
    }

    /// Withdraws one abort request.
    pub fn cancel_abort(&self) {
        self.gate.cancel_abort();
    }

    /// Clears all abort requests and the recorded wakeup IRQ.
    pub fn clear_abort(&self) {
        self.gate.clear_wakeup(true);
    }

    /// Clears all abort requests, and the recorded wakeup IRQ if `reset_irq`.
    pub fn clear_wakeup(&self, reset_irq: bool) {
        self.gate.clear_wakeup(reset_irq);
    }

    /// Returns true while an abort request is outstanding.
    #[must_use]
    pub fn abort_requested(&self) -> bool {
        self.gate.abort_requested()
    }

    /// Marks the start of a suspend attempt.
    pub fn begin_suspend(&self) {
        self.gate.begin_suspend();
    }

    /// Marks the end of a suspend attempt.
    pub fn end_suspend(&self) {
        self.gate.end_suspend();
    }

    /// Records `irq` as the interrupt that woke a suspending system.
    ///
    /// Only the first IRQ of a suspend attempt is kept; it also aborts the
    /// suspend. Returns whether `irq` was recorded.
    pub fn system_irq_wakeup(&self, irq: u32) -> bool {
        self.gate.system_irq_wakeup(irq)
    }

    /// The recorded wakeup IRQ.
    #[must_use]
    pub fn wakeup_irq(&self) -> Option<u32> {
        self.gate.wakeup_irq()
    }

    // ----------------------------------------------------------------
    // Registry readers
    // ----------------------------------------------------------------

    /// Number of registered sources.
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.registry.len()
    }

    /// Returns true if `source` is registered with this context.
    #[must_use]
    pub fn contains(&self, source: &Arc<WakeupSource>) -> bool {
        self.registry.read().iter().any(|s| Arc::ptr_eq(s, source))
    }

    /// Names of the currently active sources.
    #[must_use]
    pub fn active_sources(&self) -> Vec<String> {
        self.registry
            .read()
            .iter()
            .filter(|s| s.is_active())
            .map(|s| s.name().to_owned())
            .collect()
    }

    /// Logs every active source, or the most recently active one when
    /// none is active.
    pub fn log_active_sources(&self) {
        let guard = self.registry.read();
        let mut any_active = false;
        let mut last: Option<(Time, &Arc<WakeupSource>)> = None;
        for source in guard.iter() {
            let state = source.lock();
            if state.active {
                any_active = true;
                debug!(
                    source = %source.name(),
                    since = %state.last_time,
                    "active wakeup source"
                );
            } else if !any_active && last.is_none_or(|(t, _)| state.last_time > t) {
                last = Some((state.last_time, source));
            }
        }
        if !any_active {
            if let Some((at, source)) = last {
                debug!(source = %source.name(), %at, "last active wakeup source");
            }
        }
    }

    /// Captures one diagnostics row per registered source plus the
    /// aggregate of destroyed sources.
    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let now = self.now();
        let sources = self
            .registry
            .read()
            .iter()
            .map(|s| DiagnosticsRow::from_stats(&s.stats(), now))
            .collect();
        DiagnosticsSnapshot {
            taken_at: now,
            sources,
            deleted: DiagnosticsRow::from_stats(&self.sink.totals(), now),
        }
    }

    /// Accumulated statistics of destroyed sources.
    #[must_use]
    pub fn deleted_stats(&self) -> SourceStats {
        self.sink.totals()
    }

    /// Arms the wake IRQ of every registered source. Returns the IRQs armed.
    pub fn arm_wake_irqs(&self) -> Vec<u32> {
        self.for_each_wake_irq(|irq| irq.arm())
    }

    /// Disarms the wake IRQ of every registered source. Returns the IRQs
    /// disarmed.
    pub fn disarm_wake_irqs(&self) -> Vec<u32> {
        self.for_each_wake_irq(|irq| irq.disarm())
    }

    fn for_each_wake_irq(&self, apply: impl Fn(&WakeIrq)) -> Vec<u32> {
        let guard = self.registry.read();
        let mut touched = Vec::new();
        for source in guard.iter() {
            if let Some(irq) = source.wake_irq() {
                apply(&irq);
                touched.push(irq.irq());
            }
        }
        touched
    }

    /// Turns prevent-sleep accounting on or off for every source.
    ///
    /// Active sources open their prevent window at the toggle; turning the
    /// accounting off folds open windows into `prevent_sleep_time`.
    pub fn set_autosleep(&self, enabled: bool) {
        self.autosleep.store(enabled, Ordering::Release);
        let now = self.now();
        let guard = self.registry.read();
        for source in guard.iter() {
            let mut state = source.lock();
            if state.active && state.autosleep_enabled != enabled {
                if enabled {
                    state.start_prevent_time = now;
                } else {
                    state.fold_prevent_time(now);
                }
            }
            state.autosleep_enabled = enabled;
        }
        debug!(enabled, sources = guard.len(), "autosleep accounting toggled");
    }

    // ----------------------------------------------------------------
    // Device helpers
    // ----------------------------------------------------------------

    /// Sets the device's wakeup capability. Clearing it also detaches and
    /// unregisters the device's source, whatever the capability was before.
    pub fn set_wakeup_capable(&self, device: &Device, capable: bool) {
        if !capable {
            self.release_device_source(device);
        }
        device.set_can_wakeup(capable);
    }

    fn release_device_source(&self, device: &Device) {
        if let Ok(source) = device.detach() {
            self.unregister(&source);
        }
    }

    /// Registers a source named after the device and attaches it.
    ///
    /// Fails with [`WakeupError::NotCapable`] for devices that cannot wake
    /// the system, and with [`WakeupError::AlreadyExists`] if wakeup is
    /// already enabled; the new source is unregistered in that case.
    pub fn enable_wakeup(&self, device: &Device) -> Result<Arc<WakeupSource>> {
        if !device.can_wakeup() {
            return Err(WakeupError::NotCapable {
                device: device.name().to_owned(),
            });
        }
        let source = self.register(device.name().to_owned());
        if let Err(err) = device.attach(&source) {
            self.unregister(&source);
            return Err(err);
        }
        Ok(source)
    }

    /// Detaches and unregisters the device's source, if any.
    pub fn disable_wakeup(&self, device: &Device) -> Result<()> {
        if !device.can_wakeup() {
            return Err(WakeupError::NotCapable {
                device: device.name().to_owned(),
            });
        }
        self.release_device_source(device);
        Ok(())
    }

    /// Initializes wakeup: marks the device capable and enables wakeup, or
    /// disables wakeup and clears the capability.
    pub fn init_wakeup(&self, device: &Device, enable: bool) -> Result<()> {
        if enable {
            device.set_can_wakeup(true);
            self.enable_wakeup(device).map(drop)
        } else {
            self.set_wakeup_capable(device, false);
            Ok(())
        }
    }

    /// Enables or disables wakeup on a capable device.
    pub fn set_wakeup_enable(&self, device: &Device, enable: bool) -> Result<()> {
        if enable {
            self.enable_wakeup(device).map(drop)
        } else {
            self.disable_wakeup(device)
        }
    }

    /// [`stay_awake`](Self::stay_awake) on the device's source, if any.
    pub fn device_stay_awake(&self, device: &Device) {
        if let Some(source) = device.wakeup_source() {
            self.stay_awake(&source);
        }
    }

    /// [`relax`](Self::relax) on the device's source, if any.
    pub fn device_relax(&self, device: &Device) {
        if let Some(source) = device.wakeup_source() {
            self.relax(&source);
        }
    }

    /// Timed wakeup event on the device's source, if any.
    pub fn device_wakeup_event(&self, device: &Device, duration: Duration, hard: bool) {
        if let Some(source) = device.wakeup_source() {
            self.timed_event(&source, duration, hard);
        }
    }
}

impl fmt::Debug for WakeupContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakeupContext")
            .field("sources", &self.registry.len())
            .field("counters", &self.gate.counters())
            .field("pending_timers", &self.timers.pending_count())
            .field("timer_thread", &self.worker.lock().is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::VirtualClock;
    use crate::test_utils::init_test_logging;
    use crate::{assert_with_log, test_complete, test_phase};

    fn manual() -> (Arc<VirtualClock>, Arc<WakeupContext>) {
        init_test_logging();
        let clock = Arc::new(VirtualClock::new());
        let ctx = WakeupContext::builder()
            .clock(clock.clone())
            .config(WakeupConfig::manual_timers())
            .build()
            .expect("build context");
        (clock, ctx)
    }

    #[test]
    fn lifecycle_scenario() {
        test_phase!("lifecycle_scenario");
        let (clock, ctx) = manual();
        let ws = ctx.register("S");
        assert!(ctx.contains(&ws));

        ctx.report_event(&ws, false);
        let stats = ws.stats();
        assert_with_log!(stats.active, "active after report", true, stats.active);
        assert_eq!(stats.active_count, 1);

        clock.advance(Duration::from_millis(5));
        ctx.relax(&ws);
        let stats = ws.stats();
        assert!(!stats.active);
        assert!(stats.total_time > Duration::ZERO);

        ctx.wakeup_event(&ws, Duration::from_millis(100));
        assert!(ws.timer_expires().is_some());
        ctx.relax(&ws);
        let stats = ws.stats();
        assert_eq!(stats.timer_expires, None);
        assert_eq!(stats.relax_count, stats.active_count);

        let final_events = stats.event_count;
        ctx.unregister(&ws);
        assert!(!ctx.contains(&ws));
        assert_eq!(ctx.deleted_stats().event_count, final_events);
        assert!(ctx.counters().is_quiescent());
        test_complete!("lifecycle_scenario");
    }

    #[test]
    fn zero_duration_event_releases_immediately() {
        let (_clock, ctx) = manual();
        let ws = ctx.register("instant");
        ctx.wakeup_event(&ws, Duration::ZERO);
        assert!(!ws.is_active());
        let snap = ctx.counters();
        assert_eq!((snap.committed, snap.in_progress), (1, 0));
        assert_eq!(ctx.pending_timers(), 0);
    }

    #[test]
    fn longest_deadline_wins() {
        let (clock, ctx) = manual();
        let ws = ctx.register("extend");
        ctx.wakeup_event(&ws, Duration::from_millis(100));
        ctx.wakeup_event(&ws, Duration::from_millis(10));

        clock.advance(Duration::from_millis(50));
        assert_eq!(ctx.process_timers(), 0);
        assert!(ws.is_active());

        clock.advance(Duration::from_millis(50));
        assert_eq!(ctx.process_timers(), 1);
        assert!(!ws.is_active());
        assert_eq!(ws.stats().expire_count, 1);
    }

    #[test]
    fn extension_replaces_queued_entry() {
        let (clock, ctx) = manual();
        let ws = ctx.register("extend");
        ctx.wakeup_event(&ws, Duration::from_millis(10));
        ctx.wakeup_event(&ws, Duration::from_millis(100));
        assert_eq!(ctx.pending_timers(), 1);

        clock.advance(Duration::from_millis(10));
        assert_eq!(ctx.process_timers(), 0, "earlier deadline must not release");
        assert!(ws.is_active());

        clock.advance(Duration::from_millis(90));
        assert_eq!(ctx.process_timers(), 1);
        assert_eq!(ctx.pending_timers(), 0);
    }

    #[test]
    fn rearming_keeps_one_queued_entry_per_source() {
        let (_clock, ctx) = manual();
        let ws = ctx.register("chatty");
        for _ in 0..100 {
            ctx.stay_awake(&ws);
            ctx.wakeup_event(&ws, Duration::from_secs(10));
            assert_eq!(ctx.pending_timers(), 1);
        }
        ctx.relax(&ws);
        assert_eq!(ctx.pending_timers(), 0);

        ctx.wakeup_event(&ws, Duration::from_secs(10));
        ctx.remove_source(&ws);
        assert_eq!(ctx.pending_timers(), 0);
    }

    #[test]
    fn popped_entry_rearmed_before_firing_is_stale() {
        let (clock, ctx) = manual();
        let ws = ctx.register("race");
        ctx.wakeup_event(&ws, Duration::from_millis(10));
        clock.advance(Duration::from_millis(10));
        let batch = ctx.timers.collect_expired();
        assert_eq!(batch.len(), 1);

        // Extended after the entry left the queue but before it fired.
        ctx.wakeup_event(&ws, Duration::from_millis(50));
        assert_eq!(ctx.fire_expired(batch), 0);
        assert!(ws.is_active());
        assert_eq!(ws.stats().expire_count, 0);
        ctx.relax(&ws);
    }

    #[test]
    fn stay_awake_cancels_timer() {
        let (clock, ctx) = manual();
        let ws = ctx.register("held");
        ctx.wakeup_event(&ws, Duration::from_millis(10));
        ctx.stay_awake(&ws);
        assert_eq!(ws.timer_expires(), None);

        clock.advance(Duration::from_millis(20));
        assert_eq!(ctx.process_timers(), 0);
        assert!(ws.is_active());
        ctx.relax(&ws);
        assert!(ctx.counters().is_quiescent());
    }

    #[test]
    fn events_on_unregistered_sources_are_ignored() {
        let (_clock, ctx) = manual();
        let prepared = ctx.create_source("never-added");
        ctx.stay_awake(&prepared);
        ctx.wakeup_event(&prepared, Duration::from_millis(5));
        assert!(!prepared.is_active());
        assert_eq!(prepared.stats().event_count, 0);

        let ws = ctx.register("gone");
        ctx.remove_source(&ws);
        ctx.report_event(&ws, true);
        assert!(!ws.is_active());
        assert!(!ctx.abort_requested());
        assert!(ctx.counters().is_quiescent());
    }

    #[test]
    fn removing_active_source_releases_it() {
        let (_clock, ctx) = manual();
        let ws = ctx.register("busy");
        ctx.wakeup_event(&ws, Duration::from_secs(10));
        assert_eq!(ctx.counters().in_progress, 1);

        assert!(ctx.remove_source(&ws));
        assert!(!ctx.remove_source(&ws));
        assert!(!ws.is_active());
        assert_eq!(ws.lifecycle(), Lifecycle::Removed);
        assert!(ctx.counters().is_quiescent());

        assert!(ctx.add_source(&ws));
        assert!(ctx.contains(&ws));
    }

    /// Spawns `op` on `source` and waits until it has started removing.
    fn spawn_removal(
        ctx: &Arc<WakeupContext>,
        source: &Arc<WakeupSource>,
        op: fn(&WakeupContext, &Arc<WakeupSource>),
    ) -> std::thread::JoinHandle<()> {
        let handle = {
            let ctx = Arc::clone(ctx);
            let source = Arc::clone(source);
            std::thread::spawn(move || op(&ctx, &source))
        };
        while source.lifecycle() == Lifecycle::Registered {
            std::thread::yield_now();
        }
        handle
    }

    #[test]
    fn concurrent_destroys_wait_for_the_unlink() {
        let (_clock, ctx) = manual();
        let victim = ctx.register("victim");
        ctx.report_event(&victim, false);
        ctx.relax(&victim);

        let pinned = ctx.registry.read();
        let first = spawn_removal(&ctx, &victim, WakeupContext::destroy_source);
        let second_done = Arc::new(AtomicBool::new(false));
        let second = {
            let ctx = Arc::clone(&ctx);
            let victim = Arc::clone(&victim);
            let done = Arc::clone(&second_done);
            std::thread::spawn(move || {
                ctx.destroy_source(&victim);
                done.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        assert!(!second_done.load(Ordering::SeqCst), "second destroy skipped the wait");
        assert_eq!(victim.lifecycle(), Lifecycle::Removed);
        assert_eq!(ctx.deleted_stats().event_count, 0);
        assert!(pinned.iter().any(|s| Arc::ptr_eq(s, &victim)));

        drop(pinned);
        first.join().expect("first destroy panicked");
        second.join().expect("second destroy panicked");
        assert_eq!(victim.lifecycle(), Lifecycle::Destroyed);
        assert_eq!(ctx.deleted_stats().event_count, 1, "merged once");
        assert!(!ctx.contains(&victim));
    }

    #[test]
    fn add_during_removal_waits_and_relinks() {
        let (_clock, ctx) = manual();
        let ws = ctx.register("flapping");

        let pinned = ctx.registry.read();
        let remover = spawn_removal(&ctx, &ws, |ctx, s| {
            ctx.remove_source(s);
        });
        let adder = {
            let ctx = Arc::clone(&ctx);
            let ws = Arc::clone(&ws);
            std::thread::spawn(move || ctx.add_source(&ws))
        };

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(ws.lifecycle(), Lifecycle::Removed);
        drop(pinned);

        remover.join().expect("remover panicked");
        assert!(adder.join().expect("adder panicked"));
        assert_eq!(ws.lifecycle(), Lifecycle::Registered);
        assert!(ctx.contains(&ws), "registered source must be linked");
        ctx.stay_awake(&ws);
        assert_eq!(ctx.active_sources(), ["flapping"]);
        ctx.relax(&ws);
    }

    #[test]
    fn destroy_is_idempotent_and_recycles_id() {
        let (_clock, ctx) = manual();
        let ws = ctx.register("once");
        let id = ws.id();
        ctx.report_event(&ws, false);
        ctx.relax(&ws);
        ctx.destroy_source(&ws);
        ctx.destroy_source(&ws);
        assert_eq!(ws.lifecycle(), Lifecycle::Destroyed);
        assert_eq!(ctx.deleted_stats().event_count, 1);
        assert!(!ctx.add_source(&ws));

        let next = ctx.register("reuse");
        assert_eq!(next.id(), id);
    }

    #[test]
    fn gate_detects_new_event() {
        let (_clock, ctx) = manual();
        let ws = ctx.register("gate");
        let count = ctx.poll_blocking(false, None);
        assert!(count.quiescent);
        assert!(ctx.save_baseline(count.count));
        assert!(!ctx.is_pending());

        ctx.stay_awake(&ws);
        assert_eq!(ws.stats().wakeup_count, 1);
        assert!(ctx.is_pending());
        // Latched and disarmed.
        assert!(!ctx.is_pending());

        ctx.relax(&ws);
        ctx.report_event(&ws, false);
        assert_eq!(ws.stats().wakeup_count, 1, "disarmed gate does not count wakeups");
        ctx.relax(&ws);
    }

    #[test]
    fn hard_event_forces_abort() {
        let (_clock, ctx) = manual();
        let ws = ctx.register("power-key");
        ctx.wakeup_event_hard(&ws, Duration::from_millis(5));
        assert!(ctx.abort_requested());
        assert!(ctx.is_pending());
        ctx.cancel_abort();
        assert!(!ctx.is_pending());

        ctx.force_abort();
        ctx.force_abort();
        ctx.clear_abort();
        assert!(!ctx.is_pending());
        ctx.relax(&ws);
    }

    #[test]
    fn irq_wakeup_recorded_during_suspend() {
        let (_clock, ctx) = manual();
        ctx.begin_suspend();
        assert!(ctx.system_irq_wakeup(33));
        ctx.end_suspend();
        assert_eq!(ctx.wakeup_irq(), Some(33));
        assert!(ctx.is_pending());
        ctx.clear_wakeup(false);
        assert_eq!(ctx.wakeup_irq(), Some(33));
        ctx.clear_abort();
        assert_eq!(ctx.wakeup_irq(), None);
    }

    #[test]
    fn active_sources_and_snapshot() {
        let (clock, ctx) = manual();
        let a = ctx.register("a");
        let b = ctx.register("b");
        ctx.stay_awake(&a);
        ctx.report_event(&b, false);
        ctx.relax(&b);
        clock.advance(Duration::from_millis(30));

        assert_eq!(ctx.active_sources(), ["a"]);
        ctx.log_active_sources();

        let snap = ctx.snapshot();
        let row = snap.row("a").expect("row for a");
        assert_eq!(row.active_since_ms, 30);
        assert_eq!(row.total_time_ms, 30);
        assert_eq!(snap.deleted.name, "deleted");
        assert_eq!(snap.sources.len(), 2);
        ctx.relax(&a);
    }

    #[test]
    fn autosleep_accounts_prevent_time() {
        let (clock, ctx) = manual();
        let ws = ctx.register("sync");
        ctx.stay_awake(&ws);
        clock.advance(Duration::from_millis(10));
        ctx.set_autosleep(true);
        clock.advance(Duration::from_millis(20));
        ctx.relax(&ws);
        assert_eq!(ws.stats().prevent_sleep_time, Duration::from_millis(20));

        ctx.stay_awake(&ws);
        clock.advance(Duration::from_millis(5));
        ctx.set_autosleep(false);
        clock.advance(Duration::from_millis(50));
        ctx.relax(&ws);
        assert_eq!(ws.stats().prevent_sleep_time, Duration::from_millis(25));

        let late = ctx.register("late");
        assert!(!late.stats().autosleep_enabled);
    }

    #[test]
    fn device_enable_disable() {
        let (_clock, ctx) = manual();
        let dev = Device::new("rtc0");
        let err = ctx.enable_wakeup(&dev).expect_err("not capable");
        assert!(matches!(err, WakeupError::NotCapable { .. }));

        ctx.init_wakeup(&dev, true).expect("init");
        assert!(dev.may_wakeup());
        assert_eq!(ctx.source_count(), 1);
        let err = ctx.enable_wakeup(&dev).expect_err("second enable");
        assert!(err.is_already_exists());
        assert_eq!(ctx.source_count(), 1, "failed enable must unregister");

        ctx.device_wakeup_event(&dev, Duration::from_millis(5), false);
        assert_eq!(ctx.active_sources(), ["rtc0"]);
        ctx.device_relax(&dev);
        ctx.device_stay_awake(&dev);
        ctx.device_relax(&dev);

        ctx.set_wakeup_enable(&dev, false).expect("disable");
        assert!(!dev.may_wakeup());
        assert_eq!(ctx.source_count(), 0);
        assert_eq!(ctx.deleted_stats().event_count, 2);

        ctx.init_wakeup(&dev, false).expect("deinit");
        assert!(!dev.can_wakeup());
        // No source: helpers do nothing.
        ctx.device_stay_awake(&dev);
        assert!(ctx.counters().is_quiescent());
    }

    #[test]
    fn clearing_capability_unregisters_even_when_already_cleared() {
        let (_clock, ctx) = manual();
        let dev = Device::new("lid");
        dev.set_can_wakeup(true);
        let ws = ctx.enable_wakeup(&dev).expect("enable");

        dev.set_can_wakeup(false);
        ctx.set_wakeup_capable(&dev, false);
        assert!(dev.wakeup_source().is_none());
        assert!(!ctx.contains(&ws));
        assert_eq!(ws.lifecycle(), Lifecycle::Destroyed);
        assert_eq!(ctx.source_count(), 0);
    }

    #[test]
    fn wake_irqs_follow_registered_sources() {
        let (_clock, ctx) = manual();
        let dev = Device::new("gpio-keys");
        let irq = WakeIrq::new(9);
        dev.set_wake_irq(Arc::clone(&irq));
        dev.set_can_wakeup(true);
        ctx.enable_wakeup(&dev).expect("enable");
        ctx.register("no-irq");

        assert_eq!(ctx.arm_wake_irqs(), [9]);
        assert!(irq.is_armed());
        assert_eq!(ctx.disarm_wake_irqs(), [9]);
        assert!(!irq.is_armed());

        ctx.disable_wakeup(&dev).expect("disable");
        assert!(ctx.arm_wake_irqs().is_empty());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = WakeupContext::builder()
            .config(WakeupConfig {
                straggler_log_interval: Duration::ZERO,
                ..WakeupConfig::manual_timers()
            })
            .build()
            .expect_err("zero interval");
        assert!(matches!(err, WakeupError::Config(_)));
    }
}
