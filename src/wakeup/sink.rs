//! Aggregate sink for the statistics of destroyed sources.

use super::stats::SourceStats;
use crate::tracing_compat::debug;
use crate::types::Time;
use parking_lot::Mutex;
use std::time::Duration;

/// Name reported for the aggregate row.
pub const DELETED_SOURCE_NAME: &str = "deleted";

/// Accumulates the final statistics of every destroyed source.
///
/// Destructions can race, so the running totals sit behind their own lock.
#[derive(Debug)]
pub(crate) struct AggregateSink {
    totals: Mutex<SourceStats>,
}

impl AggregateSink {
    pub(crate) fn new() -> Self {
        Self {
            totals: Mutex::new(SourceStats {
                name: DELETED_SOURCE_NAME.to_owned(),
                active: false,
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
                autosleep_enabled: false,
            }),
        }
    }

    /// Merges one destroyed source. Sources that never saw an event leave
    /// no trace.
    pub(crate) fn record(&self, source: &SourceStats) {
        if source.event_count == 0 {
            return;
        }
        let mut totals = self.totals.lock();
        totals.total_time += source.total_time;
        totals.max_time = totals.max_time.max(source.max_time);
        totals.prevent_sleep_time += source.prevent_sleep_time;
        totals.event_count += source.event_count;
        totals.active_count += source.active_count;
        totals.relax_count += source.relax_count;
        totals.expire_count += source.expire_count;
        totals.wakeup_count += source.wakeup_count;
        totals.last_time = totals.last_time.max(source.last_time);
        debug!(
            source = %source.name,
            events = source.event_count,
            total_events = totals.event_count,
            "merged destroyed wakeup source"
        );
    }

    pub(crate) fn totals(&self) -> SourceStats {
        self.totals.lock().clone()
    }
}
