//! Optional `tracing` integration.
//!
//! With `tracing-integration` (or `test-internals`) enabled this re-exports
//! the `tracing` event macros. Without it the same names expand to nothing,
//! so call sites never need their own `cfg` attributes.

#[cfg(any(feature = "tracing-integration", feature = "test-internals"))]
pub use tracing::{debug, error, info, trace, warn};

#[cfg(not(any(feature = "tracing-integration", feature = "test-internals")))]
mod noop {
    #[doc(hidden)]
    #[macro_export]
    macro_rules! __wakegate_noop_event {
        ($($arg:tt)*) => {{}};
    }
}

#[cfg(not(any(feature = "tracing-integration", feature = "test-internals")))]
pub use crate::{
    __wakegate_noop_event as debug, __wakegate_noop_event as error,
    __wakegate_noop_event as info, __wakegate_noop_event as trace,
    __wakegate_noop_event as warn,
};
