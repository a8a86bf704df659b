//! Wakeup-event accounting and suspend gating.
//!
//! - [`WakeupSource`]: one origin of "do not suspend yet" events
//! - [`counter`]: the packed committed/in-progress counter
//! - [`WakeupContext`]: registry, gate, timers and aggregate sink in one
//!   explicit instance
//! - [`Device`]: capability glue for devices that wake the system
//! - [`DiagnosticsSnapshot`]: per-source statistics rows

pub mod counter;
mod context;
mod device;
mod gate;
mod registry;
mod sink;
mod source;
mod stats;

pub use context::{WakeupContext, WakeupContextBuilder};
pub use counter::{CombinedCounter, CounterSnapshot, IN_PROGRESS_BITS, MAX_IN_PROGRESS};
pub use device::{Device, WakeIrq};
pub use gate::{CancelSignal, WakeupCount};
pub use sink::DELETED_SOURCE_NAME;
pub use source::{Lifecycle, WakeupSource};
pub use stats::{DiagnosticsRow, DiagnosticsSnapshot, SourceStats};
