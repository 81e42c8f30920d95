#[cfg(feature = "loom")]
mod imp {
    pub(crate) use loom::hint::spin_loop;
    pub(crate) use loom::sync::atomic::{
        AtomicBool, AtomicPtr, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering,
    };
    pub(crate) use loom::thread::yield_now;

    /// `loom::cell::UnsafeCell` already exposes the `with`/`with_mut` access
    /// protocol; re-export it unchanged.
    pub(crate) use loom::cell::UnsafeCell;

    /// Thin wrapper giving `loom::sync::Mutex` the poison-free `lock()`
    /// signature the rest of the crate is written against.
    pub(crate) struct Mutex<T>(loom::sync::Mutex<T>);

    impl<T> Mutex<T> {
        pub(crate) fn new(value: T) -> Self {
            Self(loom::sync::Mutex::new(value))
        }

        pub(crate) fn lock(&self) -> loom::sync::MutexGuard<'_, T> {
            self.0.lock().unwrap()
        }
    }

    impl<T> core::fmt::Debug for Mutex<T> {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            f.pad("Mutex { .. }")
        }
    }
}

#[cfg(not(feature = "loom"))]
mod imp {
    pub(crate) use core::hint::spin_loop;
    pub(crate) use core::sync::atomic::{
        AtomicBool, AtomicPtr, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering,
    };
    pub(crate) use parking_lot::Mutex;
    pub(crate) use std::thread::yield_now;

    /// Mirror of `loom::cell::UnsafeCell`: every access goes through a
    /// closure receiving the raw pointer, so the exact same call sites
    /// compile under both the real and the model build.
    #[derive(Debug)]
    #[repr(transparent)]
    pub(crate) struct UnsafeCell<T>(core::cell::UnsafeCell<T>);

    impl<T> UnsafeCell<T> {
        pub(crate) const fn new(value: T) -> Self {
            Self(core::cell::UnsafeCell::new(value))
        }

        pub(crate) fn with<R>(&self, f: impl FnOnce(*const T) -> R) -> R {
            f(self.0.get())
        }

        pub(crate) fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
            f(self.0.get())
        }
    }

    // The scheduler upholds the access discipline for each cell; `Sync` is
    // what a bare `core::cell::UnsafeCell` is missing for that to compile.
    unsafe impl<T: Send> Sync for UnsafeCell<T> {}
}

pub(crate) use imp::*;
