//! Registry of live wakeup sources.
//!
//! Readers traverse an immutable snapshot without blocking writers or each
//! other. Writers serialize on a writer lock, build a new snapshot and
//! publish it; every replaced snapshot is remembered weakly. A removal then
//! waits until no reader pins any remembered snapshot that still lists the
//! source, however many publications ago it was taken. After
//! [`Registry::remove`] returns, no traversal can observe the removed source.
//!
//! Removing a source from inside a traversal of the same registry deadlocks:
//! the grace wait cannot finish while the caller still holds a snapshot.

use super::source::WakeupSource;
use crate::tracing_compat::trace;
use parking_lot::{Mutex, RwLock};
use std::mem;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

/// Maximum sleep between grace-period checks.
const GRACE_BACKOFF_CAP: Duration = Duration::from_millis(1);

/// Spins before the grace wait starts sleeping.
const GRACE_SPIN_LIMIT: u32 = 64;

#[derive(Debug, Default)]
struct Snapshot {
    entries: Vec<Arc<WakeupSource>>,
}

impl Snapshot {
    fn contains(&self, source: &Arc<WakeupSource>) -> bool {
        self.entries.iter().any(|s| Arc::ptr_eq(s, source))
    }
}

/// Copy-on-write list of registered sources.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    /// Writer lock; guards the replaced snapshots that may still be pinned.
    writer: Mutex<Vec<Weak<Snapshot>>>,
    current: RwLock<Arc<Snapshot>>,
}

/// A pinned registry snapshot.
///
/// While a guard is alive the sources it lists stay linked from the
/// snapshot, and removing any of them waits for the guard to drop.
#[derive(Debug)]
pub(crate) struct ReadGuard {
    snapshot: Arc<Snapshot>,
}

impl ReadGuard {
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<WakeupSource>> {
        self.snapshot.entries.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.snapshot.entries.len()
    }
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Pins the current snapshot for traversal.
    pub(crate) fn read(&self) -> ReadGuard {
        ReadGuard {
            snapshot: Arc::clone(&*self.current.read()),
        }
    }

    /// Links a source. Returns false if it is already linked.
    pub(crate) fn insert(&self, source: &Arc<WakeupSource>) -> bool {
        let mut retired = self.writer.lock();
        let current = Arc::clone(&*self.current.read());
        if current.contains(source) {
            return false;
        }
        let mut entries = Vec::with_capacity(current.entries.len() + 1);
        entries.extend(current.entries.iter().cloned());
        entries.push(Arc::clone(source));
        self.publish(&mut retired, Snapshot { entries });
        true
    }

    /// Unlinks a source and waits out every reader that can still see it.
    ///
    /// Returns false if the source was not linked.
    pub(crate) fn remove(&self, source: &Arc<WakeupSource>) -> bool {
        let pinned = {
            let mut retired = self.writer.lock();
            let current = Arc::clone(&*self.current.read());
            if !current.contains(source) {
                return false;
            }
            let entries = current
                .entries
                .iter()
                .filter(|s| !Arc::ptr_eq(s, source))
                .cloned()
                .collect();
            drop(current);
            self.publish(&mut retired, Snapshot { entries });
            retired
                .iter()
                .filter(|old| old.upgrade().is_some_and(|snap| snap.contains(source)))
                .cloned()
                .collect::<Vec<_>>()
        };
        Self::wait_for_readers(pinned);
        trace!(source = %source.name(), "registry grace period complete");
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.current.read().entries.len()
    }

    /// Swaps in `next` and remembers the replaced snapshot while a reader
    /// may still pin it. The caller holds the writer lock.
    fn publish(&self, retired: &mut Vec<Weak<Snapshot>>, next: Snapshot) {
        let old = mem::replace(&mut *self.current.write(), Arc::new(next));
        retired.retain(|w| w.strong_count() > 0);
        retired.push(Arc::downgrade(&old));
    }

    /// Blocks until none of `pinned` is held by a reader.
    fn wait_for_readers(mut pinned: Vec<Weak<Snapshot>>) {
        let mut spins = 0u32;
        let mut backoff = Duration::from_micros(10);
        loop {
            pinned.retain(|w| w.strong_count() > 0);
            if pinned.is_empty() {
                break;
            }
            if spins < GRACE_SPIN_LIMIT {
                spins += 1;
                thread::yield_now();
            } else {
                thread::sleep(backoff);
                backoff = (backoff * 2).min(GRACE_BACKOFF_CAP);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;

    #[test]
    fn insert_and_remove_are_idempotent() {
        let registry = Registry::new();
        let a = WakeupSource::new("a");
        assert!(registry.insert(&a));
        assert!(!registry.insert(&a));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(&a));
        assert!(!registry.remove(&a));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn traversal_keeps_its_snapshot() {
        let registry = Registry::new();
        let a = WakeupSource::new("a");
        let b = WakeupSource::new("b");
        registry.insert(&a);
        let guard = registry.read();
        registry.insert(&b);

        let names: Vec<_> = guard.iter().map(|s| s.name().to_owned()).collect();
        assert_eq!(names, ["a"]);
        assert_eq!(guard.len(), 1);
        assert_eq!(registry.read().len(), 2);
    }

    #[test]
    fn remove_waits_for_pinned_readers() {
        let registry = Arc::new(Registry::new());
        let a = WakeupSource::new("a");
        registry.insert(&a);

        let guard = registry.read();
        let done = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let remover = {
            let registry = Arc::clone(&registry);
            let done = Arc::clone(&done);
            let a = Arc::clone(&a);
            thread::spawn(move || {
                tx.send(()).expect("send");
                registry.remove(&a);
                done.store(true, Ordering::SeqCst);
            })
        };

        rx.recv().expect("remover started");
        thread::sleep(Duration::from_millis(20));
        assert!(!done.load(Ordering::SeqCst), "removal finished early");
        assert!(guard.iter().any(|s| Arc::ptr_eq(s, &a)));

        drop(guard);
        remover.join().expect("remover panicked");
        assert!(done.load(Ordering::SeqCst));
        assert!(registry.read().iter().all(|s| !Arc::ptr_eq(s, &a)));
    }

    #[test]
    fn remove_waits_for_readers_pinned_before_later_inserts() {
        let registry = Arc::new(Registry::new());
        let a = WakeupSource::new("a");
        let b = WakeupSource::new("b");
        let c = WakeupSource::new("c");
        registry.insert(&a);
        let old = registry.read();
        registry.insert(&b);
        registry.insert(&c);

        let done = Arc::new(AtomicBool::new(false));
        let remover = {
            let registry = Arc::clone(&registry);
            let done = Arc::clone(&done);
            let a = Arc::clone(&a);
            thread::spawn(move || {
                assert!(registry.remove(&a));
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(
            !done.load(Ordering::SeqCst),
            "removal returned while an older snapshot still lists the source"
        );
        assert!(old.iter().any(|s| Arc::ptr_eq(s, &a)));

        drop(old);
        remover.join().expect("remover panicked");
        assert!(done.load(Ordering::SeqCst));
        let names: Vec<_> = registry.read().iter().map(|s| s.name().to_owned()).collect();
        assert_eq!(names, ["b", "c"]);
    }

    #[test]
    fn remove_ignores_readers_that_cannot_see_the_source() {
        let registry = Registry::new();
        let a = WakeupSource::new("a");
        let b = WakeupSource::new("b");
        registry.insert(&a);
        let before_b = registry.read();
        registry.insert(&b);

        // The pinned snapshot predates `b`, so removing `b` must not wait.
        assert!(registry.remove(&b));
        assert_eq!(before_b.len(), 1);
        assert_eq!(registry.len(), 1);
    }
}
