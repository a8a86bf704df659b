//! Packed committed/in-progress event counter.
//!
//! One `AtomicU64` holds two fields: the upper half counts *committed*
//! wakeup events (fully processed), the lower half counts events still *in
//! progress* (currently blocking suspend).
//!
//! ```text
//!  63                         32 31                          0
//! +-----------------------------+-----------------------------+
//! |          committed          |         in progress         |
//! +-----------------------------+-----------------------------+
//! ```
//!
//! Starting an event adds 1. Finishing one adds [`MAX_IN_PROGRESS`], which
//! carries into the committed half and leaves the in-progress half one lower:
//! both fields move in a single atomic step, so no reader ever sees the
//! event in neither or both halves.
//!
//! # Capacity
//!
//! At most [`MAX_IN_PROGRESS`] events may be in progress at once. The bound
//! is a fixed capacity of the encoding and is not checked at run time: one
//! more concurrent event would carry into the committed half. The committed
//! half wraps at 2^32, which only matters to callers comparing it for
//! equality, and they already treat it as an opaque token.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Width of the in-progress field.
pub const IN_PROGRESS_BITS: u32 = 32;

/// Largest representable number of simultaneously in-progress events.
pub const MAX_IN_PROGRESS: u64 = (1 << IN_PROGRESS_BITS) - 1;

/// Committed and in-progress counts observed in one atomic read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CounterSnapshot {
    /// Wakeup events fully processed since the counter was created.
    pub committed: u32,
    /// Wakeup events currently blocking suspend.
    pub in_progress: u32,
}

impl CounterSnapshot {
    #[inline]
    const fn split(combined: u64) -> Self {
        Self {
            committed: (combined >> IN_PROGRESS_BITS) as u32,
            in_progress: (combined & MAX_IN_PROGRESS) as u32,
        }
    }

    /// Returns true when no event is in progress.
    #[inline]
    #[must_use]
    pub const fn is_quiescent(self) -> bool {
        self.in_progress == 0
    }
}

/// The process-wide combined event counter.
#[derive(Debug, Default)]
pub struct CombinedCounter {
    combined: AtomicU64,
}

impl CombinedCounter {
    /// Creates a counter with both fields at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            combined: AtomicU64::new(0),
        }
    }

    /// Records the start of an event and returns the counts after it.
    #[inline]
    pub fn begin_event(&self) -> CounterSnapshot {
        let prev = self.combined.fetch_add(1, Ordering::SeqCst);
        CounterSnapshot::split(prev.wrapping_add(1))
    }

    /// Moves one event from in-progress to committed and returns the counts
    /// after the move.
    #[inline]
    pub fn end_event(&self) -> CounterSnapshot {
        let prev = self.combined.fetch_add(MAX_IN_PROGRESS, Ordering::SeqCst);
        CounterSnapshot::split(prev.wrapping_add(MAX_IN_PROGRESS))
    }

    /// Reads both fields atomically.
    #[inline]
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot::split(self.combined.load(Ordering::SeqCst))
    }
}
