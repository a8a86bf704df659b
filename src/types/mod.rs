//! Core value types shared across the crate.
//!
//! - [`id`]: source identifiers and the monotonic [`Time`] type

pub mod id;

pub use id::{SourceId, Time};
