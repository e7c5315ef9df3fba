//! Synchronous submission under load, and self-deadlock detection.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strand::test_utils::{init_test_logging, wait_until};
use strand::{Pool, PoolConfig, Queue, Width};

fn test_pool() -> Pool {
    Pool::new(PoolConfig {
        min_threads: 0,
        max_threads: 4,
        thread_name_prefix: "strand-sync-it".to_string(),
        idle_timeout: Duration::from_millis(200),
        ..PoolConfig::default()
    })
}

#[test]
fn sync_calls_interleave_with_async_work() {
    init_test_logging();
    let pool = test_pool();
    let queue = pool.queue("sync.mixed", Width::Serial);
    let counter = Arc::new(AtomicUsize::new(0));

    for round in 0..50 {
        let task_counter = Arc::clone(&counter);
        queue.submit_async(move || {
            task_counter.fetch_add(1, Ordering::SeqCst);
        });
        // FIFO: the sync call sees every async item submitted before it.
        let seen = queue.submit_sync(|| counter.load(Ordering::SeqCst));
        assert_eq!(seen, round + 1);
    }
}

#[test]
fn sync_round_trips_under_contention() {
    init_test_logging();
    let pool = test_pool();
    let queue = pool.queue("sync.storm", Width::concurrent(4));
    let executed = Arc::new(AtomicUsize::new(0));

    const THREADS: usize = 8;
    const CALLS: usize = 1_250;

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let queue = queue.clone();
            let executed = Arc::clone(&executed);
            std::thread::spawn(move || {
                for i in 0..CALLS {
                    let value = queue.submit_sync(|| {
                        executed.fetch_add(1, Ordering::SeqCst);
                        t * CALLS + i
                    });
                    assert_eq!(value, t * CALLS + i);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("sync caller panicked");
    }
    assert_eq!(executed.load(Ordering::SeqCst), THREADS * CALLS);
}

#[test]
fn async_submitted_during_sync_hold_is_never_stranded() {
    init_test_logging();
    let pool = test_pool();
    let queue = pool.queue("sync.window", Width::Serial);
    let done = Arc::new(AtomicUsize::new(0));

    // Each round parks a fast-path sync caller on the barrier while an
    // async item lands and a drain pass fails admission against it; the
    // barrier release races the drain unlock. A lost wakeup strands the
    // async item and trips the bounded wait.
    for round in 0..300 {
        let holder = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                queue.submit_sync(|| std::thread::sleep(Duration::from_micros(50)));
            })
        };
        let counter = Arc::clone(&done);
        queue.submit_async(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        holder.join().expect("sync holder panicked");
        wait_until(Duration::from_secs(2), || {
            done.load(Ordering::SeqCst) == round + 1
        });
    }
}

#[test]
fn sync_panic_propagates_to_caller() {
    init_test_logging();
    let pool = test_pool();
    let queue = pool.queue("sync.panic", Width::Serial);

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        queue.submit_sync(|| panic!("boom"));
    }));
    assert!(result.is_err());

    // The queue stays usable: the admission was released on unwind.
    let value = queue.submit_sync(|| 11);
    assert_eq!(value, 11);
}

#[test]
fn sync_onto_own_serial_queue_panics_fast() {
    init_test_logging();
    let pool = test_pool();
    let queue = pool.queue("sync.self", Width::Serial);
    let outcome = Arc::new(AtomicUsize::new(0));

    let inner = queue.clone();
    let observed = Arc::clone(&outcome);
    queue.submit_async(move || {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            inner.submit_sync(|| ());
        }));
        observed.store(if result.is_err() { 1 } else { 2 }, Ordering::SeqCst);
    });

    wait_until(Duration::from_secs(2), || outcome.load(Ordering::SeqCst) != 0);
    assert_eq!(
        outcome.load(Ordering::SeqCst),
        1,
        "self-submission must panic, not hang"
    );
}

#[test]
fn sync_barrier_onto_own_concurrent_queue_panics_fast() {
    init_test_logging();
    let pool = test_pool();
    let queue = pool.queue("sync.self-barrier", Width::concurrent(2));
    let outcome = Arc::new(AtomicUsize::new(0));

    // The running item occupies one width slot; a barrier needs all of
    // them and this thread can never give its own slot back.
    let inner = queue.clone();
    let observed = Arc::clone(&outcome);
    queue.submit_async(move || {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            inner.submit_sync_barrier(|| ());
        }));
        observed.store(if result.is_err() { 1 } else { 2 }, Ordering::SeqCst);
    });

    wait_until(Duration::from_secs(2), || outcome.load(Ordering::SeqCst) != 0);
    assert_eq!(
        outcome.load(Ordering::SeqCst),
        1,
        "barrier submission over a held slot must panic, not hang"
    );
}

#[test]
fn sync_onto_own_width_one_queue_panics_fast() {
    init_test_logging();
    let pool = test_pool();
    let queue = pool.queue("sync.self-narrow", Width::concurrent(1));
    let outcome = Arc::new(AtomicUsize::new(0));

    let inner = queue.clone();
    let observed = Arc::clone(&outcome);
    queue.submit_async(move || {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            inner.submit_sync(|| ());
        }));
        observed.store(if result.is_err() { 1 } else { 2 }, Ordering::SeqCst);
    });

    wait_until(Duration::from_secs(2), || outcome.load(Ordering::SeqCst) != 0);
    assert_eq!(
        outcome.load(Ordering::SeqCst),
        1,
        "the only slot is held by the caller; this must panic, not hang"
    );
}

#[test]
fn sync_within_wider_concurrent_queue_is_allowed() {
    init_test_logging();
    let pool = test_pool();
    let queue = pool.queue("sync.self-wide", Width::concurrent(4));
    let value = Arc::new(AtomicUsize::new(0));

    // Three slots remain free, so a nested synchronous call can admit.
    let inner = queue.clone();
    let observed = Arc::clone(&value);
    queue.submit_async(move || {
        let v = inner.submit_sync(|| 77);
        observed.store(v, Ordering::SeqCst);
    });

    wait_until(Duration::from_secs(2), || value.load(Ordering::SeqCst) == 77);
}

#[test]
fn sync_onto_ancestor_queue_panics_fast() {
    init_test_logging();
    let pool = test_pool();
    let hub = pool.queue("sync.hub", Width::Serial);
    let child = Queue::with_target("sync.child", Width::Serial, &hub);
    let outcome = Arc::new(AtomicUsize::new(0));

    let target = hub.clone();
    let observed = Arc::clone(&outcome);
    child.submit_async(move || {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            target.submit_sync(|| ());
        }));
        observed.store(if result.is_err() { 1 } else { 2 }, Ordering::SeqCst);
    });

    wait_until(Duration::from_secs(2), || outcome.load(Ordering::SeqCst) != 0);
    assert_eq!(
        outcome.load(Ordering::SeqCst),
        1,
        "submission through a held ancestor must panic, not hang"
    );
}

#[test]
fn sync_to_sibling_queue_is_allowed() {
    init_test_logging();
    let pool = test_pool();
    let a = pool.queue("sync.a", Width::Serial);
    let b = pool.queue("sync.b", Width::Serial);
    let value = Arc::new(AtomicUsize::new(0));

    let sibling = b.clone();
    let observed = Arc::clone(&value);
    a.submit_async(move || {
        let v = sibling.submit_sync(|| 99);
        observed.store(v, Ordering::SeqCst);
    });
    wait_until(Duration::from_secs(2), || value.load(Ordering::SeqCst) == 99);
}
