use crate::sync::{spin_loop, yield_now};
use derive_more::{Deref, DerefMut};

/// Pads and aligns a value to the length of a cache line.
///
/// The queue keeps its `head`, `tail` and freelist words in separate cache
/// lines so that a producer hammering `tail` does not invalidate the line a
/// consumer is spinning on. The alignment is a guess that covers the
/// architectures we care about: modern x86-64 prefetches cache lines in
/// pairs, hence 128 bytes there.
#[derive(Debug, Default, Deref, DerefMut)]
#[cfg_attr(
    any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "powerpc64"),
    repr(align(128))
)]
#[cfg_attr(
    not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "powerpc64")),
    repr(align(64))
)]
pub(crate) struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self { value }
    }
}

const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;

/// Adaptive backoff for contended CAS loops and the worker idle path.
///
/// Escalates from busy spins of doubling length to `yield_now`; once
/// `is_completed` reports true the caller is expected to park instead.
#[derive(Debug)]
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    pub(crate) const fn new() -> Self {
        Self { step: 0 }
    }

    pub(crate) fn reset(&mut self) {
        self.step = 0;
    }

    /// One step of the spin → yield chain.
    pub(crate) fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..1u32 << self.step {
                spin_loop();
            }
        } else {
            yield_now();
        }
        if self.step <= YIELD_LIMIT {
            self.step += 1;
        }
    }

    /// True once spinning has stopped paying off and the caller should park.
    pub(crate) fn is_completed(&self) -> bool {
        self.step > YIELD_LIMIT
    }
}
