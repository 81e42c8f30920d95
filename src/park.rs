use std::time::Duration;

/// Bound on every blocking park in the crate. A wakeup that races with
/// sleep registration is recovered on the next timeout, so neither shutdown
/// nor freshly pushed work can be lost for longer than this.
pub(crate) const PARK_TIMEOUT: Duration = Duration::from_millis(50);

#[cfg(not(feature = "loom"))]
mod imp {
    use crate::sync::{AtomicBool, Ordering};
    use parking_lot::{Condvar, Mutex};
    use std::time::Duration;

    /// One-shot completion event. Set exactly once; any number of threads
    /// may observe and wait on it.
    #[derive(Debug)]
    pub(crate) struct Latch {
        set: AtomicBool,
        lock: Mutex<()>,
        cond: Condvar,
    }

    impl Latch {
        pub(crate) fn new() -> Self {
            Self {
                set: AtomicBool::new(false),
                lock: Mutex::new(()),
                cond: Condvar::new(),
            }
        }

        pub(crate) fn is_set(&self) -> bool {
            self.set.load(Ordering::Acquire)
        }

        pub(crate) fn set(&self) {
            {
                let _guard = self.lock.lock();
                self.set.store(true, Ordering::Release);
            }
            self.cond.notify_all();
        }

        /// Parks until the latch is set or the timeout elapses. Callers
        /// re-check `is_set` in a loop; spurious returns are fine.
        pub(crate) fn wait_timeout(&self, timeout: Duration) {
            if self.is_set() {
                return;
            }
            let mut guard = self.lock.lock();
            if self.is_set() {
                return;
            }
            let _ = self.cond.wait_for(&mut guard, timeout);
        }
    }

    /// Parking spot for idle workers.
    #[derive(Debug)]
    pub(crate) struct SleepGate {
        sleepers: Mutex<usize>,
        cond: Condvar,
    }

    impl SleepGate {
        pub(crate) fn new() -> Self {
            Self {
                sleepers: Mutex::new(0),
                cond: Condvar::new(),
            }
        }

        pub(crate) fn park(&self, timeout: Duration) {
            let mut sleepers = self.sleepers.lock();
            *sleepers += 1;
            let _ = self.cond.wait_for(&mut sleepers, timeout);
            *sleepers -= 1;
        }

        /// Wakes one parked worker, if any. A worker that is past its empty
        /// queue check but not yet registered misses this and recovers on
        /// its park timeout.
        pub(crate) fn wake_one(&self) {
            let sleepers = self.sleepers.lock();
            if *sleepers > 0 {
                self.cond.notify_one();
            }
        }

        pub(crate) fn wake_all(&self) {
            let _sleepers = self.sleepers.lock();
            self.cond.notify_all();
        }
    }
}

#[cfg(feature = "loom")]
mod imp {
    use crate::sync::{yield_now, AtomicBool, Ordering};
    use std::time::Duration;

    /// Model-build latch: parking degrades to a yield so loom explorations
    /// stay finite.
    #[derive(Debug)]
    pub(crate) struct Latch {
        set: AtomicBool,
    }

    impl Latch {
        pub(crate) fn new() -> Self {
            Self {
                set: AtomicBool::new(false),
            }
        }

        pub(crate) fn is_set(&self) -> bool {
            self.set.load(Ordering::Acquire)
        }

        pub(crate) fn set(&self) {
            self.set.store(true, Ordering::Release);
        }

        pub(crate) fn wait_timeout(&self, _timeout: Duration) {
            yield_now();
        }
    }

    #[derive(Debug)]
    pub(crate) struct SleepGate;

    impl SleepGate {
        pub(crate) fn new() -> Self {
            Self
        }

        pub(crate) fn park(&self, _timeout: Duration) {
            yield_now();
        }

        pub(crate) fn wake_one(&self) {}

        pub(crate) fn wake_all(&self) {}
    }
}

pub(crate) use imp::{Latch, SleepGate};
