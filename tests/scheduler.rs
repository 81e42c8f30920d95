#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

use fanout::{global, parallel_for, parallel_for_async, thread_id, BlockedRange, Pool};
use std::any::Any;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::Duration;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Message of a caught panic payload, whether it unwound with the original
/// `&str` or was re-raised as a `String`.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string payload>")
}

#[test]
fn failing_parallel_for_rethrows_at_the_caller() {
    init_tracing();
    let pool = Pool::new();
    let invocations = AtomicU32::new(0);
    let payload = catch_unwind(AssertUnwindSafe(|| {
        parallel_for(&pool, BlockedRange::new(0, 1000, 5), |_range| {
            invocations.fetch_add(1, Ordering::Relaxed);
            panic!("Hello world!");
        });
    }))
    .unwrap_err();
    assert_eq!(panic_message(payload.as_ref()), "Hello world!");
    let invocations = invocations.load(Ordering::Relaxed);
    assert!(invocations >= 1 && invocations <= 200);
}

#[test]
fn parent_failure_before_submission_buries_the_child() {
    init_tracing();
    let pool = Pool::new();
    let parent = parallel_for_async(&pool, BlockedRange::new(0, 10, 1), &[], |_range| {
        thread::sleep(Duration::from_millis(10));
        panic!("Hello world!");
    });
    // Let the parent finish (and fail) before the child is submitted.
    thread::sleep(Duration::from_millis(100));

    let ran = Arc::new(AtomicBool::new(false));
    let child = {
        let ran = Arc::clone(&ran);
        parallel_for_async(&pool, BlockedRange::new(0, 10, 1), &[&parent], move |_range| {
            ran.store(true, Ordering::Relaxed);
        })
    };
    drop(parent);

    let error = child.join().unwrap_err();
    assert_eq!(error.message(), "Hello world!");
    assert!(!ran.load(Ordering::Relaxed), "buried callback ran");
}

#[test]
fn parent_failure_after_submission_buries_the_child() {
    init_tracing();
    let pool = Pool::new();
    let parent = parallel_for_async(&pool, BlockedRange::new(0, 10, 1), &[], |_range| {
        thread::sleep(Duration::from_millis(10));
        panic!("Hello world!");
    });

    // The child is submitted while the parent is still running.
    let ran = Arc::new(AtomicBool::new(false));
    let child = {
        let ran = Arc::clone(&ran);
        parallel_for_async(&pool, BlockedRange::new(0, 10, 1), &[&parent], move |_range| {
            ran.store(true, Ordering::Relaxed);
        })
    };
    drop(parent);

    let error = child.join().unwrap_err();
    assert_eq!(error.message(), "Hello world!");
    assert!(!ran.load(Ordering::Relaxed), "buried callback ran");
}

fn run_fan_out_fan_in(pool: &Pool) {
    let slots: Arc<Vec<AtomicU64>> = Arc::new((0..200).map(|_| AtomicU64::new(0)).collect());
    let left = {
        let slots = Arc::clone(&slots);
        pool.spawn(100, move |i| {
            slots[i as usize].store(u64::from(i) + 1, Ordering::Relaxed);
        })
    };
    let right = {
        let slots = Arc::clone(&slots);
        pool.spawn(100, move |i| {
            slots[100 + i as usize].store(u64::from(i) + 1, Ordering::Relaxed);
        })
    };
    let total = Arc::new(AtomicU64::new(0));
    let join = {
        let slots = Arc::clone(&slots);
        let total = Arc::clone(&total);
        pool.spawn_after(&[&left, &right], 1, move |_| {
            let sum = slots.iter().map(|slot| slot.load(Ordering::Relaxed)).sum();
            total.store(sum, Ordering::Relaxed);
        })
    };
    drop(left);
    drop(right);
    join.join().unwrap();
    assert_eq!(total.load(Ordering::Relaxed), 2 * (1..=100u64).sum::<u64>());
}

#[test]
fn fan_out_fan_in_sums() {
    init_tracing();
    run_fan_out_fan_in(&Pool::new());
}

#[test]
fn zero_worker_pool_runs_under_the_waiter() {
    init_tracing();
    let pool = Pool::with_threads(0);
    assert_eq!(pool.size(), 0);
    run_fan_out_fan_in(&pool);
}

#[test]
fn first_error_wins_and_every_wait_rethrows() {
    init_tracing();
    let pool = Pool::new();
    let handle = pool.spawn(100, |i| panic!("unit {i} failed"));

    let first = handle.wait().unwrap_err();
    assert!(first.message().starts_with("unit "));
    assert!(handle.is_done());

    // Property: no wait on a failed task returns normally, and all of them
    // observe the same capture.
    let second = handle.wait().unwrap_err();
    assert_eq!(first.message(), second.message());
    let third = handle.join().unwrap_err();
    assert_eq!(first.message(), third.message());
}

#[test]
fn failing_task_still_retires_every_unit() {
    init_tracing();
    let pool = Pool::new();
    let invocations = Arc::new(AtomicU32::new(0));
    let handle = {
        let invocations = Arc::clone(&invocations);
        pool.spawn(200, move |_| {
            invocations.fetch_add(1, Ordering::Relaxed);
            panic!("boom");
        })
    };
    handle.wait().unwrap_err();
    assert!(handle.is_done());
    let invocations = invocations.load(Ordering::Relaxed);
    assert!(invocations >= 1 && invocations <= 200);
}

#[test]
fn every_unit_runs_exactly_once() {
    init_tracing();
    let pool = Pool::new();
    let seen: Arc<Vec<AtomicU32>> = Arc::new((0..500).map(|_| AtomicU32::new(0)).collect());
    let handle = {
        let seen = Arc::clone(&seen);
        pool.spawn(500, move |i| {
            seen[i as usize].fetch_add(1, Ordering::Relaxed);
        })
    };
    handle.join().unwrap();
    for (index, slot) in seen.iter().enumerate() {
        assert_eq!(slot.load(Ordering::Relaxed), 1, "unit {index}");
    }
}

#[test]
fn single_unit_sync_submission_runs_inline() {
    init_tracing();
    let pool = Pool::new();
    let caller = thread::current().id();
    let seen = Mutex::new(None);
    pool.run(1, |index| {
        assert_eq!(index, 0);
        *seen.lock().unwrap() = Some((thread::current().id(), thread_id()));
    })
    .unwrap();
    let (executed_on, worker_id) = seen.lock().unwrap().take().unwrap();
    assert_eq!(executed_on, caller);
    assert_eq!(worker_id, 0);
}

#[test]
fn children_observe_parents_done() {
    init_tracing();
    let pool = Pool::new();
    let parent = pool.spawn(8, |_| {});
    let probe = parent.clone();
    let observed_done = Arc::new(AtomicBool::new(false));
    let child = {
        let observed_done = Arc::clone(&observed_done);
        pool.spawn_after(&[&parent], 1, move |_| {
            observed_done.store(probe.is_done(), Ordering::Relaxed);
        })
    };
    drop(parent);
    child.join().unwrap();
    assert!(observed_done.load(Ordering::Relaxed));
}

#[test]
fn payload_drops_exactly_once_at_completion() {
    init_tracing();
    let pool = Pool::new();
    let payload = Arc::new(());
    let probe = Arc::downgrade(&payload);
    let handle = {
        let payload = Arc::clone(&payload);
        pool.spawn(4, move |_| {
            let _ = &payload;
        })
    };
    drop(payload);
    handle.wait().unwrap();
    // The handle is still alive, but completion already dropped the
    // callback and with it the captured payload.
    assert!(probe.upgrade().is_none());
    drop(handle);
    assert!(probe.upgrade().is_none());
}

#[test]
fn ready_queue_drains_in_fifo_order() {
    init_tracing();
    // With zero workers the waiting thread is the only executor, so the
    // drain order is exactly the enqueue order.
    let pool = Pool::with_threads(0);
    let order = Arc::new(Mutex::new(Vec::new()));
    let handles: Vec<_> = (0..10)
        .map(|n| {
            let order = Arc::clone(&order);
            pool.spawn(1, move |_| order.lock().unwrap().push(n))
        })
        .collect();
    handles.last().unwrap().wait().unwrap();
    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn nested_wait_inside_a_callback() {
    init_tracing();
    // Zero workers: the outer and the nested wait both have to pump the
    // queue themselves.
    let pool = Pool::with_threads(0);
    let inner_runs = AtomicU32::new(0);
    pool.run(2, |_| {
        pool.run(2, |_| {
            inner_runs.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    })
    .unwrap();
    assert_eq!(inner_runs.load(Ordering::Relaxed), 4);
}

#[test]
fn resizing_the_pool() {
    init_tracing();
    let pool = Pool::with_threads(2);
    assert_eq!(pool.size(), 2);

    pool.set_size(4);
    assert_eq!(pool.size(), 4);
    let counter = Arc::new(AtomicU32::new(0));
    let handle = {
        let counter = Arc::clone(&counter);
        pool.spawn(64, move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    };
    handle.join().unwrap();
    assert_eq!(counter.load(Ordering::Relaxed), 64);

    pool.set_size(1);
    assert_eq!(pool.size(), 1);
    pool.run(8, |_| {}).unwrap();

    pool.set_size(0);
    assert_eq!(pool.size(), 0);
    pool.run(4, |_| {}).unwrap();
}

#[test]
fn empty_ranges_and_zero_unit_tasks() {
    init_tracing();
    let pool = Pool::new();
    parallel_for(&pool, BlockedRange::new(0, 0, 8), |_| unreachable!());
    parallel_for(&pool, BlockedRange::new(5, 5, 1), |_| unreachable!());

    let ran = AtomicBool::new(false);
    pool.run(0, |_| ran.store(true, Ordering::Relaxed)).unwrap();
    assert!(!ran.load(Ordering::Relaxed));

    let handle = pool.spawn(0, |_| unreachable!());
    handle.join().unwrap();

    // Zero-unit tasks still participate in the DAG.
    let parent = pool.spawn(0, |_| unreachable!());
    let child = pool.spawn_after(&[&parent], 1, |_| {});
    drop(parent);
    child.join().unwrap();
}

#[test]
fn worker_thread_identity() {
    init_tracing();
    assert_eq!(thread_id(), 0);
    let pool = Pool::with_threads(3);
    let ids = Arc::new(Mutex::new(HashSet::new()));
    let handle = {
        let ids = Arc::clone(&ids);
        pool.spawn(64, move |_| {
            ids.lock().unwrap().insert(thread_id());
            thread::sleep(Duration::from_micros(50));
        })
    };
    handle.join().unwrap();
    let ids = ids.lock().unwrap();
    assert!(!ids.is_empty());
    // Workers are 1..=3; the waiting thread may have helped as 0.
    assert!(ids.iter().all(|&id| id <= 3));
    assert_eq!(thread_id(), 0);
}

#[test]
fn dropping_the_pool_drains_pending_work() {
    init_tracing();
    let counter = Arc::new(AtomicU32::new(0));
    let handle;
    {
        let pool = Pool::with_threads(2);
        handle = {
            let counter = Arc::clone(&counter);
            pool.spawn(64, move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            })
        };
        // The pool is dropped here: workers drain the queue before exiting.
    }
    handle.wait().unwrap();
    assert_eq!(counter.load(Ordering::Relaxed), 64);
}

#[test]
fn unrelated_submissions_survive_a_failure() {
    init_tracing();
    let pool = Pool::new();
    pool.spawn(10, |_| panic!("poison attempt")).wait().unwrap_err();
    let counter = Arc::new(AtomicU32::new(0));
    let handle = {
        let counter = Arc::clone(&counter);
        pool.spawn(10, move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    };
    handle.join().unwrap();
    assert_eq!(counter.load(Ordering::Relaxed), 10);
}

#[test]
fn global_pool_is_usable() {
    init_tracing();
    assert!(global().size() >= 1);
    let sum = AtomicU64::new(0);
    parallel_for(global(), BlockedRange::new(0, 100, 7), |range| {
        sum.fetch_add(range.map(u64::from).sum(), Ordering::Relaxed);
    });
    assert_eq!(sum.load(Ordering::Relaxed), (0..100u64).sum());
    global().spawn(1, |_| {}).join().unwrap();
}

#[test]
fn dependencies_across_pools() {
    init_tracing();
    let a = Pool::with_threads(1);
    let b = Pool::with_threads(1);
    let flag = Arc::new(AtomicBool::new(false));
    let parent = {
        let flag = Arc::clone(&flag);
        a.spawn(4, move |_| {
            flag.store(true, Ordering::Release);
        })
    };
    let child = {
        let flag = Arc::clone(&flag);
        b.spawn_after(&[&parent], 1, move |_| {
            assert!(flag.load(Ordering::Acquire));
        })
    };
    drop(parent);
    child.join().unwrap();
}

#[test]
fn deep_failure_cascade_completes_iteratively() {
    init_tracing();
    // A long dependency chain behind a failing root: completion must bury
    // the whole chain without recursing per link. Zero workers keep the
    // root queued until the final join, so the chain is fully built before
    // the cascade runs.
    let pool = Pool::with_threads(0);
    let root = pool.spawn(1, |_| panic!("root failed"));
    let mut tail = root.clone();
    let ran = Arc::new(AtomicU32::new(0));
    for _ in 0..10_000 {
        let ran = Arc::clone(&ran);
        tail = pool.spawn_after(&[&tail], 1, move |_| {
            ran.fetch_add(1, Ordering::Relaxed);
        });
    }
    drop(root);
    let error = tail.join().unwrap_err();
    assert_eq!(error.message(), "root failed");
    assert_eq!(ran.load(Ordering::Relaxed), 0);
}
