//! Auto-release through the background timer worker on the wall clock.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use wakegate::test_utils::init_test_logging;
use wakegate::{WakeupConfig, WakeupContext, WakeupSource, test_complete, test_phase};

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    done()
}

fn threaded_context() -> Arc<WakeupContext> {
    init_test_logging();
    WakeupContext::builder()
        .config(WakeupConfig::default())
        .build()
        .expect("build context")
}

#[test]
fn worker_releases_timed_event() {
    test_phase!("worker_releases_timed_event");
    let ctx = threaded_context();
    let ws = ctx.register("alarm");
    ctx.wakeup_event(&ws, Duration::from_millis(20));
    assert!(ws.is_active());

    assert!(
        wait_until(Duration::from_secs(5), || !ws.is_active()),
        "worker never released the source"
    );
    assert_eq!(ws.stats().expire_count, 1);
    assert!(ctx.counters().is_quiescent());
    test_complete!("worker_releases_timed_event");
}

#[test]
fn blocking_poll_returns_after_auto_release() {
    let ctx = threaded_context();
    let ws = ctx.register("sensor");
    ctx.wakeup_event(&ws, Duration::from_millis(30));
    let count = ctx.poll_blocking(true, None);
    assert!(count.quiescent);
    assert_eq!(count.count, 1);
}

#[test]
fn earlier_deadline_wakes_idle_worker() {
    let ctx = threaded_context();
    let slow = ctx.register("slow");
    let fast = ctx.register("fast");
    ctx.wakeup_event(&slow, Duration::from_secs(30));
    ctx.wakeup_event(&fast, Duration::from_millis(10));

    assert!(wait_until(Duration::from_secs(5), || !fast.is_active()));
    assert!(slow.is_active());
    ctx.relax(&slow);
}

#[test]
fn dropping_context_stops_worker() {
    let ctx = threaded_context();
    let ws: Arc<WakeupSource> = ctx.register("orphan");
    ctx.wakeup_event(&ws, Duration::from_secs(60));
    drop(ctx);
    // The source outlives the context; its timer is simply never fired.
    assert!(ws.is_active());
}
