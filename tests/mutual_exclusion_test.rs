//! Mutual exclusion and queue-ordering guarantees.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use session_jobs::{
    FutureFilter, JobInput, JobManager, JobManagerConfig, MutexKey,
};

fn manager(workers: usize) -> JobManager {
    session_jobs::util::telemetry::init_tracing();
    JobManager::new(JobManagerConfig::new().with_worker_count(workers)).unwrap()
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let until = Instant::now() + deadline;
    while Instant::now() < until {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    check()
}

#[test]
fn test_mutexed_jobs_never_overlap_and_run_fifo() {
    let manager = manager(4);
    let mutex = MutexKey::new("m");
    let active = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut futures = Vec::new();
    for i in 0..5 {
        let active = Arc::clone(&active);
        let order = Arc::clone(&order);
        let future = manager
            .schedule(
                JobInput::new(format!("job-{i}")).with_mutex(mutex.clone()),
                move |_ctx| {
                    let overlap = active.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(overlap, 0, "two jobs held the permit at once");
                    std::thread::sleep(Duration::from_millis(10));
                    order.lock().push(i);
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .unwrap();
        futures.push(future);
    }
    for future in &futures {
        future.await_done_and_get().unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    manager.shutdown();
}

#[test]
fn test_capacity_two_runs_two_at_once() {
    let manager = manager(4);
    let mutex = MutexKey::with_capacity("m2", 2);
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut futures = Vec::new();
    for i in 0..4 {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        futures.push(
            manager
                .schedule(
                    JobInput::new(format!("job-{i}")).with_mutex(mutex.clone()),
                    move |_ctx| {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        assert!(now <= 2, "capacity exceeded");
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    },
                )
                .unwrap(),
        );
    }
    for future in &futures {
        future.await_done_and_get().unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    manager.shutdown();
}

#[test]
fn test_jobs_without_mutex_run_concurrently() {
    let manager = manager(2);
    let started = Arc::new(AtomicUsize::new(0));

    let mut futures = Vec::new();
    for i in 0..2 {
        let started = Arc::clone(&started);
        futures.push(
            manager
                .schedule(JobInput::new(format!("free-{i}")), move |_ctx| {
                    started.fetch_add(1, Ordering::SeqCst);
                    // Hold the worker until both jobs are in flight.
                    let until = Instant::now() + Duration::from_secs(2);
                    while started.load(Ordering::SeqCst) < 2 && Instant::now() < until {
                        std::thread::sleep(Duration::from_millis(2));
                    }
                    Ok(started.load(Ordering::SeqCst))
                })
                .unwrap(),
        );
    }
    for future in &futures {
        assert_eq!(future.await_done_and_get().unwrap(), 2);
    }
    manager.shutdown();
}

#[test]
fn test_await_on_own_mutex_fails_fast() {
    let manager_handle = manager(2);
    let mutex = MutexKey::new("deadlock");

    let inner_mutex = mutex.clone();
    let outer = manager_handle
        .schedule(
            JobInput::new("outer").with_mutex(mutex),
            move |ctx| {
                // Schedule a sibling on the same mutex and wait for it while
                // still holding the permit: this could never complete.
                let sibling = ctx.manager().schedule(
                    JobInput::new("sibling").with_mutex(inner_mutex),
                    |_ctx| Ok(()),
                )?;
                let err = sibling.await_done().unwrap_err();
                let is_assertion = !err.is_cancellation()
                    && !err.is_interruption()
                    && !err.is_timeout()
                    && !err.is_rejection();
                assert!(is_assertion, "expected an assertion failure, got {err}");
                sibling.cancel(false);
                Ok(())
            },
        )
        .unwrap();
    outer.await_done_and_get().unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        manager_handle.is_done(&FutureFilter::Any)
    }));
    manager_handle.shutdown();
}

#[test]
fn test_permit_is_granted_on_release_without_gap() {
    // A chain of short mutexed jobs: if release-and-grant were not atomic,
    // some job would observe the permit still taken after its predecessor
    // finished and the chain would stall past the await_done deadline.
    let manager = manager(4);
    let mutex = MutexKey::new("relay");
    let hops = Arc::new(AtomicUsize::new(0));

    for i in 0..20 {
        let hops = Arc::clone(&hops);
        manager
            .schedule(
                JobInput::new(format!("hop-{i}")).with_mutex(mutex.clone()),
                move |_ctx| {
                    hops.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .unwrap();
    }
    manager
        .await_done(&FutureFilter::Any, Duration::from_secs(5))
        .unwrap();
    assert_eq!(hops.load(Ordering::SeqCst), 20);
    manager.shutdown();
}
