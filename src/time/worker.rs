//! Background worker that fires due timers against a wall clock.

use super::driver::TimerDriver;
use super::heap::ExpiredBatch;
use crate::tracing_compat::{debug, warn};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

/// Upper bound on how long the worker parks when no timer is armed.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Handle to a timer worker thread.
///
/// The worker sleeps until the driver's earliest deadline (or until an
/// earlier one is registered), collects every due registration and hands
/// the batch to its firing callback. Dropping the handle shuts the driver
/// down and joins the worker.
#[derive(Debug)]
pub struct TimerThread<T: Send + 'static> {
    driver: Arc<TimerDriver<T>>,
    handle: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl<T: Send + 'static> TimerThread<T> {
    /// Spawns a named worker for `driver`, firing batches through `fire`.
    pub fn spawn<F>(name: &str, driver: Arc<TimerDriver<T>>, fire: F) -> io::Result<Self>
    where
        F: Fn(ExpiredBatch<T>) + Send + 'static,
    {
        let worker_driver = Arc::clone(&driver);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                while worker_driver.wait_for_work(IDLE_WAIT) {
                    let batch = worker_driver.collect_expired();
                    if !batch.is_empty() {
                        fire(batch);
                    }
                }
                debug!("timer worker exiting");
            })?;
        let thread_id = handle.thread().id();
        Ok(Self {
            driver,
            handle: Some(handle),
            thread_id,
        })
    }
}

impl<T: Send + 'static> Drop for TimerThread<T> {
    fn drop(&mut self) {
        self.driver.shutdown();
        let Some(handle) = self.handle.take() else {
            return;
        };
        // The last owner may be the worker itself while it fires a batch.
        if thread::current().id() == self.thread_id {
            return;
        }
        if handle.join().is_err() {
            warn!("timer worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::WallClock;
    use crate::types::Time;
    use std::sync::mpsc;

    #[test]
    fn worker_fires_due_registrations() {
        crate::test_utils::init_test_logging();
        let driver = Arc::new(TimerDriver::with_clock(Arc::new(WallClock::new())));
        let (tx, rx) = mpsc::channel();
        let worker = TimerThread::spawn("timer-test", Arc::clone(&driver), move |batch| {
            for value in batch {
                let _ = tx.send(value);
            }
        })
        .expect("spawn worker");

        let deadline = driver.now() + Duration::from_millis(5);
        driver.register(deadline, 42_u32);

        let fired = rx.recv_timeout(Duration::from_secs(5)).expect("timer fired");
        assert_eq!(fired, 42);
        assert!(driver.now() >= deadline);
        drop(worker);
        assert!(driver.is_shutdown());
    }

    #[test]
    fn drop_joins_idle_worker() {
        let driver: Arc<TimerDriver<u32>> =
            Arc::new(TimerDriver::with_clock(Arc::new(WallClock::new())));
        let worker = TimerThread::spawn("timer-idle", Arc::clone(&driver), |_| {})
            .expect("spawn worker");
        drop(worker);
        assert!(driver.is_shutdown());
        assert_eq!(driver.next_deadline(), None::<Time>);
    }
}
