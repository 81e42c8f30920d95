use crate::error::TaskError;
use crate::park::Latch;
use crate::pool::Inner;
use crate::scheduler;
use crate::sync::{AtomicPtr, AtomicU8, AtomicU32, Mutex, Ordering, UnsafeCell};
use derive_more::Debug;
use smallvec::SmallVec;
use std::sync::Arc;

/// Work-unit callback: invoked once per unit with the unit index. The
/// closure's captures are the task payload; dropping the closure at
/// completion is the payload destructor.
pub(crate) type UnitFn = Box<dyn Fn(u32) + Send + Sync + 'static>;

/// Not yet ready: waiting on unresolved parents.
pub(crate) const PENDING: u8 = 0;
/// In (or through) the ready queue. Running is implicit: it begins with the
/// first successful unit claim and is never tracked explicitly.
pub(crate) const READY: u8 = 1;
/// `remaining_units` reached zero. Final.
pub(crate) const DONE: u8 = 2;

/// A successfully claimed work unit.
#[derive(Debug, Clone, Copy)]
pub(crate) struct UnitClaim {
    pub(crate) index: u32,
    /// Whether this claim took the task's last unit.
    pub(crate) last: bool,
}

/// Outcome of registering a child under a prospective parent.
pub(crate) enum AddChild {
    /// The parent was live; it will resolve the child's dependency when it
    /// completes.
    Registered,
    /// The parent had already completed; the caller must resolve the
    /// dependency itself, inheriting the parent's error if it failed.
    ParentDone(Option<TaskError>),
}

#[derive(Debug, Default)]
struct Links {
    children: SmallVec<[Arc<Task>; 4]>,
}

/// A submitted task: `total_units` schedulable work units plus the
/// dependency, completion and error machinery around them.
///
/// Shared exclusively through `Arc`; handles, parent→child links, queue
/// entries and executing threads each hold a strong reference, so storage
/// lives exactly as long as something can still reach the task.
#[derive(Debug)]
pub(crate) struct Task {
    pub(crate) id: u64,
    pub(crate) total_units: u32,
    /// Next unit index to hand out. Monotone; claims beyond
    /// `total_units` fail.
    next_unit: AtomicU32,
    /// Unfinished units; the thread that zeroes this performs completion.
    /// Initialized to `max(total_units, 1)`: a zero-unit task carries one
    /// phantom unit retired at its ready transition, keeping the zero
    /// crossing unique.
    remaining_units: AtomicU32,
    /// Parents that have not completed yet; zero means ready.
    unresolved_parents: AtomicU32,
    state: AtomicU8,
    /// Children registered through `add_child`, guarded by the task's
    /// short-held lock. Snapshot and sealed at completion.
    links: Mutex<Links>,
    #[debug(skip)]
    callback: UnsafeCell<Option<UnitFn>>,
    error: ErrorSlot,
    /// Completion event: set exactly once, after the children have been
    /// resolved and the callback dropped.
    pub(crate) latch: Latch,
    /// Scheduler internals of the owning pool.
    #[debug(skip)]
    pub(crate) sched: Arc<Inner>,
}

// SAFETY: every field is either immutable after construction or
// synchronized: atomics, the links mutex, the latch, and the callback cell
// whose access discipline is documented on `invoke`/`take_callback`.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    pub(crate) fn new(
        sched: Arc<Inner>,
        id: u64,
        total_units: u32,
        callback: UnitFn,
        parents: u32,
    ) -> Self {
        Self {
            id,
            total_units,
            next_unit: AtomicU32::new(0),
            remaining_units: AtomicU32::new(total_units.max(1)),
            unresolved_parents: AtomicU32::new(parents),
            state: AtomicU8::new(PENDING),
            links: Mutex::new(Links::default()),
            callback: UnsafeCell::new(Some(callback)),
            error: ErrorSlot::new(),
            latch: Latch::new(),
            sched,
        }
    }

    /// Claims the next work unit. Wait-free; `None` once all units are
    /// handed out.
    pub(crate) fn claim_unit(&self) -> Option<UnitClaim> {
        let index = self.next_unit.fetch_add(1, Ordering::Relaxed);
        (index < self.total_units).then(|| UnitClaim {
            index,
            last: index + 1 == self.total_units,
        })
    }

    /// Whether unclaimed units remain. Exact when the caller holds the
    /// task's only queue entry.
    pub(crate) fn has_units(&self) -> bool {
        self.next_unit.load(Ordering::Relaxed) < self.total_units
    }

    /// Forbids any further unit claims. Used when an error makes the
    /// callback moot; the task was never enqueued at that point, so no
    /// claim can be in flight.
    pub(crate) fn exhaust_units(&self) {
        self.next_unit.store(self.total_units, Ordering::Relaxed);
    }

    /// Retires one unit; true when this was the zero crossing, which
    /// obliges the caller to run completion.
    pub(crate) fn finish_unit(&self) -> bool {
        let previous = self.remaining_units.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "work-unit counter underflow");
        previous == 1
    }

    /// Zeroes `remaining_units` wholesale; true for the unique caller that
    /// performed the crossing. Used for error completion of tasks that
    /// never ran.
    pub(crate) fn take_remaining(&self) -> bool {
        self.remaining_units.swap(0, Ordering::AcqRel) != 0
    }

    /// Resolves one parent dependency; true when this was the last one,
    /// which makes the caller the owner of the ready transition.
    pub(crate) fn resolve_parent(&self) -> bool {
        let previous = self.unresolved_parents.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "parent counter underflow");
        previous == 1
    }

    /// First error wins; later captures are dropped.
    pub(crate) fn capture_error(&self, error: TaskError) -> bool {
        self.error.set(error)
    }

    pub(crate) fn error(&self) -> Option<TaskError> {
        self.error.get()
    }

    pub(crate) fn has_error(&self) -> bool {
        self.error.is_set()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }

    pub(crate) fn mark_ready(&self) {
        self.state.store(READY, Ordering::Release);
    }

    /// Registers `child` to be resolved at this task's completion, or
    /// reports that completion has already happened.
    pub(crate) fn add_child(&self, child: &Arc<Task>) -> AddChild {
        {
            let mut links = self.links.lock();
            // The state is written under this lock, so the check and the
            // registration are atomic against `seal`.
            if self.state.load(Ordering::Relaxed) != DONE {
                links.children.push(Arc::clone(child));
                return AddChild::Registered;
            }
        }
        AddChild::ParentDone(self.error())
    }

    /// Marks the task done and takes its children. Called exactly once, by
    /// the thread that performed the zero crossing of `remaining_units`.
    pub(crate) fn seal(&self) -> SmallVec<[Arc<Task>; 4]> {
        let mut links = self.links.lock();
        assert_ne!(self.state.load(Ordering::Relaxed), DONE, "double completion");
        self.state.store(DONE, Ordering::Release);
        core::mem::take(&mut links.children)
    }

    /// Runs the callback for a claimed unit.
    pub(crate) fn invoke(&self, index: u32) {
        self.callback.with(|callback| {
            // SAFETY: shared reads of the callback are data-race-free: the
            // slot is only written by `take_callback`, which runs strictly
            // after the last unit finished, and a successful claim implies
            // its unit has not finished yet.
            match unsafe { (*callback).as_ref() } {
                Some(callback) => callback(index),
                None => unreachable!("callback taken while claims were outstanding"),
            }
        });
    }

    /// Drops the callback, releasing its captures (the payload destructor).
    pub(crate) fn take_callback(&self) {
        self.callback.with_mut(|callback| {
            // SAFETY: only the completing thread reaches this, and every
            // `invoke` on this task has returned by then (their units were
            // finished before the zero crossing that elected us).
            drop(unsafe { (*callback).take() });
        });
    }
}

/// Owning reference to a submitted task.
///
/// Cloning retains the task; dropping releases it (constant-time,
/// non-blocking). Dropping every handle without waiting discards any
/// captured error silently.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub(crate) task: Arc<Task>,
}

impl TaskHandle {
    /// Blocks until the task completes, executing queued work from the
    /// owning pool in the meantime, exactly as a worker would.
    ///
    /// # Errors
    /// Returns the task's captured error: its own first failing work unit,
    /// or the failure inherited from a parent.
    pub fn wait(&self) -> Result<(), TaskError> {
        scheduler::wait_for(&self.task)
    }

    /// [`wait`](Self::wait), releasing the handle afterwards.
    ///
    /// # Errors
    /// As for [`wait`](Self::wait).
    pub fn join(self) -> Result<(), TaskError> {
        self.wait()
    }

    /// Whether the task has completed (successfully or not). A task
    /// observes all of its parents done from inside its callback.
    pub fn is_done(&self) -> bool {
        self.task.is_done()
    }
}

/// At-most-one error per task, installed by CAS: the first capture wins and
/// every later one is dropped.
#[derive(Debug)]
struct ErrorSlot {
    ptr: AtomicPtr<TaskError>,
}

impl ErrorSlot {
    fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    fn set(&self, error: TaskError) -> bool {
        let boxed = Box::into_raw(Box::new(error));
        match self.ptr.compare_exchange(
            core::ptr::null_mut(),
            boxed,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(_) => {
                // Lost the race; this capture is discarded.
                // SAFETY: `boxed` was created above and never published.
                drop(unsafe { Box::from_raw(boxed) });
                false
            }
        }
    }

    fn get(&self) -> Option<TaskError> {
        let ptr = self.ptr.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: a published error is never mutated or freed before
            // the slot itself drops.
            Some(unsafe { (*ptr).clone() })
        }
    }

    fn is_set(&self) -> bool {
        !self.ptr.load(Ordering::Acquire).is_null()
    }
}

impl Drop for ErrorSlot {
    fn drop(&mut self) {
        let ptr = self.ptr.load(Ordering::Relaxed);
        if !ptr.is_null() {
            // SAFETY: exclusive access; the pointer came from
            // `Box::into_raw` in `set`.
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}
