//! Test helpers: logging setup and logged assertions.
//!
//! Available to unit tests and, through the `test-internals` feature, to
//! integration tests.

use std::sync::Once;

static INIT_LOGGING: Once = Once::new();

/// Installs a test-friendly `tracing` subscriber once per process.
///
/// The filter defaults to `wakegate=debug` and honours `RUST_LOG`.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("wakegate=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Logs the start of a named test phase.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        ::tracing::info!(phase = %$name, "test phase start");
    };
}

/// Logs the successful end of a named test.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        ::tracing::info!(test = %$name, "test complete");
    };
}

/// Asserts `cond`, logging expected and actual values either way.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {{
        let ok = $cond;
        ::tracing::debug!(
            check = %$msg,
            expected = ?$expected,
            actual = ?$actual,
            ok,
            "assertion"
        );
        assert!(
            ok,
            "{}: expected {:?}, got {:?}",
            $msg, $expected, $actual
        );
    }};
}
