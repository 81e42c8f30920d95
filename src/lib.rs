//! Task-parallel execution engine with a fixed worker pool.
//!
//! This crate schedules short, CPU-bound parallel loops and small task DAGs
//! embedded in a larger compute-intensive program. Each submitted *task*
//! fans out into a known number of independently schedulable *work units*
//! (one callback invocation per unit index) and may declare *parent* tasks
//! that must complete first. It:
//! - Shares one lock-free FIFO of ready tasks between all workers, with
//!   node recycling guarded by generation tags instead of a garbage
//!   collector.
//! - Resolves dependencies with a per-task atomic counter: the thread that
//!   resolves the last parent owns the child's ready transition.
//! - Waits cooperatively: a thread blocked on a task drains the ready
//!   queue exactly like a worker, so a pool of size zero still makes
//!   progress and nested waits from inside callbacks cannot deadlock.
//! - Captures the first panic of any work unit and re-raises it at every
//!   waiter; descendants of a failed task complete immediately without
//!   running their callbacks.
//! - Executes single-unit, dependency-free synchronous submissions inline
//!   on the submitting thread, without touching the queue.
//!
//! Key modules:
//! - `pool`: the worker set, its lifecycle, the process-wide default pool
//!   and `thread_id`.
//! - `task`: the task object and the `TaskHandle` returned by submission.
//! - `scheduler`: submission, dependency wiring, the completion cascade
//!   and the cooperative waiter.
//! - `queue`: the lock-free multi-producer multi-consumer ready queue.
//! - `parallel`: the blocked-range adapter turning a ranged loop body into
//!   work units.
//! - `error`: the error captured from failing work units.
//!
//! Quick start:
//! 1. Create a [`Pool`] (or use [`global`]).
//! 2. Chop a loop into blocks with [`BlockedRange`] and run it with
//!    [`parallel_for`], or submit tasks directly with [`Pool::spawn`] /
//!    [`Pool::spawn_after`].
//! 3. Wait on the returned [`TaskHandle`]; errors captured from failing
//!    units surface there.
//!
//! ```
//! use fanout::{parallel_for, BlockedRange, Pool};
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! let pool = Pool::with_threads(4);
//! let sums: Vec<AtomicU64> = (0..8).map(|_| AtomicU64::new(0)).collect();
//! parallel_for(&pool, BlockedRange::new(0, 8_000, 1_000), |range| {
//!     let slot = (range.start / 1_000) as usize;
//!     let sum: u64 = (range.start..range.end).map(u64::from).sum();
//!     sums[slot].store(sum, Ordering::Relaxed);
//! });
//! let total: u64 = sums.iter().map(|s| s.load(Ordering::Relaxed)).sum();
//! assert_eq!(total, (0..8_000u64).sum());
//! ```

/// Error type carried from failing work units to waiting threads.
pub mod error;
/// The blocked-range adapter: `BlockedRange`, `parallel_for` and
/// `parallel_for_async`.
pub mod parallel;
mod park;
/// Worker pools, the process-wide default pool and thread identity.
pub mod pool;
mod queue;
mod scheduler;
mod sync;
/// Task objects and the handles that pin them.
pub mod task;
mod utils;

pub use crate::error::TaskError;
pub use crate::parallel::{parallel_for, parallel_for_async, BlockedRange};
pub use crate::pool::{global, thread_id, Pool};
pub use crate::task::TaskHandle;
