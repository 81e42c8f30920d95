use crate::error::TaskError;
use crate::park::{SleepGate, PARK_TIMEOUT};
use crate::queue::Queue;
use crate::scheduler;
use crate::sync::{AtomicBool, AtomicU64, AtomicUsize, Mutex, Ordering};
use crate::task::{Task, TaskHandle, UnitFn};
use crate::utils::Backoff;
use derive_more::Debug;
use std::cell::Cell;
use std::sync::{Arc, OnceLock};
use std::thread;
use tracing::debug;

thread_local! {
    static WORKER_INDEX: Cell<usize> = const { Cell::new(0) };
}

/// Identity of the calling thread with respect to worker pools: `0` for
/// any non-worker thread (including cooperative waiters executing work),
/// `1..=N` for the pool workers.
pub fn thread_id() -> usize {
    WORKER_INDEX.with(Cell::get)
}

/// Scheduler internals shared by the pool, its workers and every task it
/// owns.
#[derive(Debug)]
pub(crate) struct Inner {
    #[debug(skip)]
    pub(crate) queue: Queue<Task>,
    pub(crate) gate: SleepGate,
    shutdown: AtomicBool,
    /// Intended worker count; workers with a higher index exit on their
    /// next idle check.
    target_size: AtomicUsize,
    next_task_id: AtomicU64,
}

impl Inner {
    pub(crate) fn next_task_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct WorkerHandle {
    index: usize,
    handle: thread::JoinHandle<()>,
}

/// Fixed-size worker pool executing submitted tasks.
///
/// Tasks fan out into `units` independently schedulable invocations of
/// their callback and may name parent tasks that must complete first.
/// Submission and waiting are allowed from any thread, including from
/// inside a callback.
///
/// A pool with zero workers is legal: all work then executes inside
/// cooperative waits ([`TaskHandle::wait`], [`Pool::run`],
/// [`parallel_for`](crate::parallel_for)).
///
/// Dropping the pool sets shutdown, wakes every worker and joins them;
/// workers drain the ready queue before exiting.
#[derive(Debug)]
pub struct Pool {
    inner: Arc<Inner>,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl Pool {
    /// Creates a pool sized to the hardware parallelism of the host.
    pub fn new() -> Self {
        let threads = thread::available_parallelism().map_or(1, usize::from);
        Self::with_threads(threads)
    }

    /// Creates a pool with exactly `threads` workers (`0` is allowed).
    ///
    /// # Panics
    /// If the operating system refuses to spawn a worker thread.
    pub fn with_threads(threads: usize) -> Self {
        let inner = Arc::new(Inner {
            queue: Queue::new(),
            gate: SleepGate::new(),
            shutdown: AtomicBool::new(false),
            target_size: AtomicUsize::new(threads),
            next_task_id: AtomicU64::new(1),
        });
        let pool = Self {
            inner,
            workers: Mutex::new(Vec::with_capacity(threads)),
        };
        spawn_workers(&pool.inner, &mut pool.workers.lock(), threads);
        debug!(threads, "pool created");
        pool
    }

    /// Current worker count target.
    pub fn size(&self) -> usize {
        self.inner.target_size.load(Ordering::Acquire)
    }

    /// Resizes the worker set. Growing spawns workers immediately;
    /// shrinking waits for the excess workers to go idle and joins them,
    /// so in-flight tasks are never disturbed.
    ///
    /// # Panics
    /// If the operating system refuses to spawn a worker thread.
    pub fn set_size(&self, threads: usize) {
        let mut workers = self.workers.lock();
        self.inner.target_size.store(threads, Ordering::Release);
        if threads < workers.len() {
            self.inner.gate.wake_all();
            for worker in workers.split_off(threads) {
                debug!(index = worker.index, "joining worker after shrink");
                worker.handle.join().expect("worker thread panicked");
            }
        } else {
            spawn_workers(&self.inner, &mut workers, threads);
        }
    }

    /// Submits a task of `units` work units; the callback receives each
    /// unit index in `[0, units)`. The returned handle pins the task until
    /// dropped.
    pub fn spawn<F>(&self, units: u32, callback: F) -> TaskHandle
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        scheduler::submit(&self.inner, units, Box::new(callback), &[], true)
    }

    /// Like [`spawn`](Self::spawn), but the task becomes ready only after
    /// every parent has completed. If any parent fails, the callback never
    /// runs and the task inherits the parent's error.
    pub fn spawn_after<F>(&self, parents: &[&TaskHandle], units: u32, callback: F) -> TaskHandle
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        scheduler::submit(&self.inner, units, Box::new(callback), parents, true)
    }

    /// Submits synchronously and waits. A single-unit submission executes
    /// inline on the calling thread; anything larger is shared with the
    /// workers while the calling thread helps drain the queue. The
    /// callback may borrow from the caller's stack.
    ///
    /// # Errors
    /// Returns the first error captured from a failing work unit.
    pub fn run<F>(&self, units: u32, callback: F) -> Result<(), TaskError>
    where
        F: Fn(u32) + Send + Sync,
    {
        let callback: Box<dyn Fn(u32) + Send + Sync + '_> = Box::new(callback);
        // SAFETY: the callback is dropped at task completion, and
        // `join` below returns strictly after completion, so the erased
        // borrows outlive every use.
        let callback: UnitFn = unsafe { core::mem::transmute(callback) };
        scheduler::submit(&self.inner, units, callback, &[], false).join()
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.gate.wake_all();
        let workers = core::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.handle.join();
        }
        debug!("pool shut down");
    }
}

fn spawn_workers(inner: &Arc<Inner>, workers: &mut Vec<WorkerHandle>, target: usize) {
    while workers.len() < target {
        let index = workers.len() + 1;
        let inner = Arc::clone(inner);
        let handle = thread::Builder::new()
            .name(format!("fanout-worker-{index}"))
            .spawn(move || worker_loop(&inner, index))
            .expect("failed to spawn worker thread");
        workers.push(WorkerHandle { index, handle });
    }
}

/// Pop, execute, back off, park; exit once shut down (queue drained) or
/// resized away.
fn worker_loop(inner: &Arc<Inner>, index: usize) {
    WORKER_INDEX.with(|cell| cell.set(index));
    debug!(index, "worker started");
    let mut backoff = Backoff::new();
    loop {
        match inner.queue.pop() {
            Some(task) => {
                backoff.reset();
                scheduler::execute(&task, None);
            }
            None => {
                if inner.shutdown.load(Ordering::Acquire) {
                    break;
                }
                if index > inner.target_size.load(Ordering::Acquire) {
                    break;
                }
                if backoff.is_completed() {
                    inner.gate.park(PARK_TIMEOUT);
                } else {
                    backoff.snooze();
                }
            }
        }
    }
    debug!(index, "worker exited");
}

static GLOBAL: OnceLock<Pool> = OnceLock::new();

/// Process-wide default pool, lazily created with hardware-parallelism
/// size on first use.
///
/// Rust runs no destructors for statics, so the default pool lives for the
/// rest of the process; its workers park with bounded timeouts and hold
/// nothing that blocks process exit. Use an explicit [`Pool`] where
/// deterministic teardown matters.
pub fn global() -> &'static Pool {
    GLOBAL.get_or_init(Pool::new)
}
