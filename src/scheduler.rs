use crate::error::TaskError;
use crate::park::{Latch, PARK_TIMEOUT};
use crate::pool::Inner;
use crate::task::{AddChild, Task, TaskHandle, UnitFn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, trace};

/// Builds a task, wires its dependencies and hands it to the pool.
///
/// The ready transition belongs to whoever resolves the last parent: the
/// submitting thread when every parent was already done (or there were
/// none), otherwise the thread completing the last parent. With
/// `force_async` unset, a single-unit task that is ready and error-free
/// executes inline on the submitting thread without touching the queue.
pub(crate) fn submit(
    sched: &Arc<Inner>,
    units: u32,
    callback: UnitFn,
    parents: &[&TaskHandle],
    force_async: bool,
) -> TaskHandle {
    let id = sched.next_task_id();
    let task = Arc::new(Task::new(
        Arc::clone(sched),
        id,
        units,
        callback,
        parents.len() as u32,
    ));
    trace!(id, units, parents = parents.len(), "task submitted");

    let mut ready_here = parents.is_empty();
    for parent in parents {
        match parent.task.add_child(&task) {
            AddChild::Registered => {}
            AddChild::ParentDone(error) => {
                if let Some(error) = error {
                    task.capture_error(error);
                }
                if task.resolve_parent() {
                    ready_here = true;
                }
            }
        }
    }

    if ready_here {
        if task.has_error() {
            // A parent had already failed; the task completes without
            // running.
            complete_with_error(&task);
        } else if !force_async && task.total_units == 1 {
            run_inline(&task);
        } else {
            enqueue_ready(&task);
        }
    }

    TaskHandle { task }
}

/// Publishes a task whose dependencies are all resolved. Zero-unit tasks
/// have nothing to dispatch and complete on the spot by retiring their
/// phantom unit.
fn enqueue_ready(task: &Arc<Task>) {
    if task.total_units == 0 {
        if task.finish_unit() {
            complete(task);
        }
        return;
    }
    task.mark_ready();
    task.sched.queue.push(Arc::clone(task));
    task.sched.gate.wake_one();
}

/// Inline fast path: the single unit runs on the submitting thread and the
/// task never visits the queue.
fn run_inline(task: &Arc<Task>) {
    match task.claim_unit() {
        Some(claim) => {
            run_unit(task, claim.index);
            if task.finish_unit() {
                complete(task);
            }
        }
        None => unreachable!("fresh single-unit task had no unit to claim"),
    }
}

/// Completes a task that inherited an error before ever becoming ready.
/// The `remaining_units` swap elects a unique completer even when several
/// failed parents race to bury the same child.
fn complete_with_error(task: &Arc<Task>) {
    task.exhaust_units();
    if task.take_remaining() {
        complete(task);
    }
}

/// Runs one claimed unit, converting a panic into the task's error.
/// Returns whether the unit failed.
fn run_unit(task: &Arc<Task>, index: u32) -> bool {
    match catch_unwind(AssertUnwindSafe(|| task.invoke(index))) {
        Ok(()) => false,
        Err(payload) => {
            let error = TaskError::from_panic(payload);
            debug!(id = task.id, %error, "work unit failed");
            task.capture_error(error);
            true
        }
    }
}

/// Claims and runs units of a popped task until they run out.
///
/// The caller holds the task's only queue entry. Before running the first
/// unit the task is re-published once, so other workers can claim the
/// remaining units concurrently while the task still occupies at most one
/// queue slot; entries for exhausted tasks die benignly on a failed claim.
///
/// A unit that panics ends this thread's claim slice: units already
/// claimed elsewhere run to completion and only the first capture wins.
/// With `stop` set, the latch is checked between units and the slice is
/// handed back on interruption; this is the cooperative waiter's exit
/// path.
pub(crate) fn execute(task: &Arc<Task>, stop: Option<&Latch>) {
    let mut republished = false;
    loop {
        if stop.is_some_and(Latch::is_set) {
            if !republished && task.has_units() {
                republish(task);
            }
            return;
        }
        let Some(claim) = task.claim_unit() else {
            return;
        };
        if !republished && !claim.last {
            republish(task);
            republished = true;
        }
        let failed = run_unit(task, claim.index);
        if task.finish_unit() {
            complete(task);
            return;
        }
        if failed {
            return;
        }
    }
}

fn republish(task: &Arc<Task>) {
    task.sched.queue.push(Arc::clone(task));
    task.sched.gate.wake_one();
}

/// Completion cascade, run by the thread that retired the last unit.
///
/// Iterative on an explicit worklist: burying a failed task's descendants
/// would otherwise recurse as deep as the DAG. Per task: seal (publish the
/// Done state and take the children), resolve or bury each child, drop the
/// callback, signal the latch.
fn complete(task: &Arc<Task>) {
    let mut worklist: Vec<Arc<Task>> = vec![Arc::clone(task)];
    while let Some(task) = worklist.pop() {
        let children = task.seal();
        let error = task.error();
        for child in children {
            if let Some(error) = &error {
                // Invariant: a failed parent buries the child immediately,
                // without waiting for the child's other parents.
                child.capture_error(error.clone());
                child.exhaust_units();
                if child.take_remaining() {
                    worklist.push(child);
                }
            } else if child.resolve_parent() {
                if child.has_error() {
                    // Inherited from a parent that was already done at
                    // submission; nobody else will complete it.
                    child.exhaust_units();
                    if child.take_remaining() {
                        worklist.push(child);
                    }
                } else {
                    enqueue_ready(&child);
                }
            }
        }
        task.take_callback();
        task.latch.set();
        trace!(id = task.id, failed = error.is_some(), "task completed");
    }
}

/// Cooperative wait: drains the pool's queue like a worker, re-checking
/// the target's latch between units, and parks briefly when idle. Safe
/// with zero workers (all progress happens here) and reentrant from inside
/// a callback (the nested wait pumps the queue too).
pub(crate) fn wait_for(task: &Arc<Task>) -> Result<(), TaskError> {
    while !task.latch.is_set() {
        match task.sched.queue.pop() {
            Some(other) => execute(&other, Some(&task.latch)),
            None => task.latch.wait_timeout(PARK_TIMEOUT),
        }
    }
    match task.error() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
