//! Clocks, the deadline heap and the timer driver.
//!
//! Every wakeup source owns at most one armed auto-release deadline. The
//! deadlines of all sources share one [`TimerDriver`]; it is either pumped
//! explicitly (tests, virtual time) or by a [`TimerThread`] in production.

pub mod driver;
pub mod heap;
pub mod worker;

pub use driver::{TimeSource, TimerDriver, VirtualClock, WallClock};
pub use heap::{ExpiredBatch, TimerHeap, TimerKey};
pub use worker::TimerThread;
