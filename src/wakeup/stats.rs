//! Source statistics and the diagnostics snapshot.
//!
//! [`SourceStats`] is a raw copy of one source's counters. A
//! [`DiagnosticsSnapshot`] renders every registered source plus the
//! aggregate of destroyed sources as rows for an external reporting sink.

use super::source::SourceState;
use crate::types::Time;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Raw counters of one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStats {
    /// Source name.
    pub name: String,
    /// Whether an activation is outstanding.
    pub active: bool,
    /// Events reported.
    pub event_count: u64,
    /// Activations.
    pub active_count: u64,
    /// Deactivations.
    pub relax_count: u64,
    /// Deactivations performed by the auto-release timer.
    pub expire_count: u64,
    /// Events reported while a suspend baseline was armed.
    pub wakeup_count: u64,
    /// Time of the last activation or deactivation.
    pub last_time: Time,
    /// Start of the current prevent-sleep window.
    pub start_prevent_time: Time,
    /// Accumulated active time.
    pub total_time: Duration,
    /// Longest single activation.
    pub max_time: Duration,
    /// Accumulated time spent preventing autosleep.
    pub prevent_sleep_time: Duration,
    /// Armed auto-release deadline.
    pub timer_expires: Option<Time>,
    /// Whether autosleep accounting is on for this source.
    pub autosleep_enabled: bool,
}

impl SourceStats {
    pub(crate) fn capture(name: &str, state: &SourceState) -> Self {
        Self {
            name: name.to_owned(),
            active: state.active,
            event_count: state.event_count,
            active_count: state.active_count,
            relax_count: state.relax_count,
            expire_count: state.expire_count,
            wakeup_count: state.wakeup_count,
            last_time: state.last_time,
            start_prevent_time: state.start_prevent_time,
            total_time: state.total_time,
            max_time: state.max_time,
            prevent_sleep_time: state.prevent_sleep_time,
            timer_expires: state.timer_expires,
            autosleep_enabled: state.autosleep_enabled,
        }
    }
}

/// One rendered diagnostics line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsRow {
    /// Source name, or `deleted` for the aggregate line.
    pub name: String,
    /// Activations.
    pub active_count: u64,
    /// Events reported.
    pub event_count: u64,
    /// Events reported while a suspend baseline was armed.
    pub wakeup_count: u64,
    /// Timer-driven deactivations.
    pub expire_count: u64,
    /// Milliseconds since the current activation began; zero when inactive.
    pub active_since_ms: u64,
    /// Accumulated active time.
    pub total_time_ms: u64,
    /// Longest single activation.
    pub max_time_ms: u64,
    /// Time of the last state change, milliseconds since the clock origin.
    pub last_change_ms: u64,
    /// Accumulated time spent preventing autosleep.
    pub prevent_suspend_time_ms: u64,
}

impl DiagnosticsRow {
    /// Builds a row, folding an ongoing activation into the time columns.
    pub(crate) fn from_stats(stats: &SourceStats, now: Time) -> Self {
        let mut total = stats.total_time;
        let mut max = stats.max_time;
        let mut prevent = stats.prevent_sleep_time;
        let mut active_since = Duration::ZERO;

        if stats.active {
            active_since = now.duration_since(stats.last_time);
            total += active_since;
            max = max.max(active_since);
            if stats.autosleep_enabled {
                prevent += now.duration_since(stats.start_prevent_time);
            }
        }

        Self {
            name: stats.name.clone(),
            active_count: stats.active_count,
            event_count: stats.event_count,
            wakeup_count: stats.wakeup_count,
            expire_count: stats.expire_count,
            active_since_ms: millis(active_since),
            total_time_ms: millis(total),
            max_time_ms: millis(max),
            last_change_ms: stats.last_time.as_millis(),
            prevent_suspend_time_ms: millis(prevent),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Diagnostics for every registered source plus the destroyed aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsSnapshot {
    /// Capture time.
    pub taken_at: Time,
    /// One row per registered source, in registry order.
    pub sources: Vec<DiagnosticsRow>,
    /// Aggregate of destroyed sources.
    pub deleted: DiagnosticsRow,
}

impl DiagnosticsSnapshot {
    /// Looks up a source row by name.
    #[must_use]
    pub fn row(&self, name: &str) -> Option<&DiagnosticsRow> {
        self.sources.iter().find(|row| row.name == name)
    }

    /// Iterates the source rows followed by the aggregate row.
    pub fn rows(&self) -> impl Iterator<Item = &DiagnosticsRow> {
        self.sources.iter().chain(std::iter::once(&self.deleted))
    }

    /// Renders the snapshot as JSON for a structured reporting sink.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for DiagnosticsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<24}\tactive_count\tevent_count\twakeup_count\texpire_count\t\
             active_since\ttotal_time\tmax_time\tlast_change\tprevent_suspend_time",
            "name"
        )?;
        for row in self.rows() {
            writeln!(
                f,
                "{:<24}\t{}\t\t{}\t\t{}\t\t{}\t\t{}\t\t{}\t\t{}\t\t{}\t\t{}",
                row.name,
                row.active_count,
                row.event_count,
                row.wakeup_count,
                row.expire_count,
                row.active_since_ms,
                row.total_time_ms,
                row.max_time_ms,
                row.last_change_ms,
                row.prevent_suspend_time_ms,
            )?;
        }
        Ok(())
    }
}
