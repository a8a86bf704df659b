//! Wakegate: wakeup-event accounting and suspend gating.
//!
//! # Overview
//!
//! Asynchronous producers (interrupt handlers, background workers) report
//! "do not suspend yet" events on wakeup sources. A single suspend
//! orchestrator decides, without races, when all of them have quiesced and
//! the system may enter a low-power state.
//!
//! # Core Guarantees
//!
//! - **No global lock on the hot path**: event reports take only the
//!   per-source lock and one atomic add on the combined counter
//! - **No double release**: a timer firing and an explicit relax racing on
//!   the same activation commit it exactly once
//! - **Longest deadline wins**: a shorter follow-up timed event never pulls
//!   an armed auto-release earlier
//! - **Safe removal**: once a source is unregistered no registry traversal
//!   can observe it
//! - **Nothing forgotten**: destroyed sources leave their statistics in an
//!   aggregate row
//!
//! # Module Structure
//!
//! - [`wakeup`]: sources, the combined counter, the context and device glue
//! - [`time`]: clocks, the timer driver and its background worker
//! - [`types`]: identifiers and timestamps
//! - [`config`]: context configuration
//! - [`error`](mod@error): error types
//! - [`tracing_compat`]: optional tracing integration
//!
//! # Example
//!
//! ```
//! use wakegate::{WakeupConfig, WakeupContext};
//!
//! let ctx = WakeupContext::builder()
//!     .config(WakeupConfig::manual_timers())
//!     .build()
//!     .unwrap();
//! let ws = ctx.register("battery");
//!
//! ctx.stay_awake(&ws);
//! assert!(!ctx.poll_blocking(false, None).quiescent);
//! ctx.relax(&ws);
//! assert!(ctx.poll_blocking(false, None).quiescent);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod error;
pub mod time;
pub mod tracing_compat;
pub mod types;
pub mod wakeup;

#[cfg(any(test, feature = "test-internals"))]
pub mod test_utils;

pub use config::{ConfigError, WakeupConfig};
pub use error::{Result, WakeupError};
pub use types::{SourceId, Time};
pub use wakeup::{
    CancelSignal, CounterSnapshot, Device, DiagnosticsRow, DiagnosticsSnapshot, Lifecycle,
    SourceStats, WakeIrq, WakeupContext, WakeupContextBuilder, WakeupCount, WakeupSource,
};
