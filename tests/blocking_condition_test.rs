//! Blocking-condition round trips: release, park, resume at the back of
//! the queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use session_jobs::{
    FutureFilter, JobEventFilter, JobEventType, DeliveryMode, JobInput, JobManager,
    JobManagerConfig, MutexKey,
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
fn test_blocked_job_frees_permit_and_resumes_at_tail() {
    let manager = manager(3);
    let mutex = MutexKey::new("session");
    let condition = manager.create_blocking_condition("answer", true);
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let cond1 = condition.clone();
    let order1 = Arc::clone(&order);
    let job1 = manager
        .schedule(
            JobInput::new("waiter").with_mutex(mutex.clone()),
            move |ctx| {
                order1.lock().push("j1-start");
                cond1.wait_for(ctx)?;
                order1.lock().push("j1-resumed");
                Ok(())
            },
        )
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || manager.is_blocked(job1.id())),
        "job1 never parked on the condition"
    );

    // While job1 is parked, another job of the same mutex can run.
    let order2 = Arc::clone(&order);
    let job2 = manager
        .schedule(
            JobInput::new("interleaved").with_mutex(mutex.clone()),
            move |_ctx| {
                order2.lock().push("j2");
                std::thread::sleep(Duration::from_millis(30));
                Ok(())
            },
        )
        .unwrap();
    let order3 = Arc::clone(&order);
    let job3 = manager
        .schedule(
            JobInput::new("queued").with_mutex(mutex),
            move |_ctx| {
                order3.lock().push("j3");
                Ok(())
            },
        )
        .unwrap();

    // job3 took its queue position at schedule time; the resuming job1
    // re-enters behind it.
    condition.set_blocking(false);

    job1.await_done_and_get().unwrap();
    job2.await_done_and_get().unwrap();
    job3.await_done_and_get().unwrap();
    assert_eq!(*order.lock(), vec!["j1-start", "j2", "j3", "j1-resumed"]);
    manager.shutdown();
}

#[test]
fn test_unarmed_condition_is_a_no_op() {
    let manager = manager(2);
    let condition = manager.create_blocking_condition("open", false);
    let blocked_events = Arc::new(Mutex::new(0_usize));
    let counter = Arc::clone(&blocked_events);
    manager.add_listener(
        Some(JobEventFilter::new().with_types([JobEventType::Blocked])),
        DeliveryMode::Sync,
        move |_event| {
            *counter.lock() += 1;
        },
    );

    let future = manager
        .schedule(
            JobInput::new("through").with_mutex(MutexKey::new("m")),
            move |ctx| {
                condition.wait_for(ctx)?;
                Ok("passed")
            },
        )
        .unwrap();
    assert_eq!(future.await_done_and_get().unwrap(), "passed");
    assert_eq!(*blocked_events.lock(), 0, "no blocked event for an open gate");
    manager.shutdown();
}

#[test]
fn test_wait_timeout_reacquires_permit_and_raises_timeout() {
    let manager = manager(2);
    let mutex = MutexKey::new("m");
    let condition = manager.create_blocking_condition("slow-answer", true);

    let cond = condition.clone();
    let future = manager
        .schedule(
            JobInput::new("impatient").with_mutex(mutex.clone()),
            move |ctx| {
                let err = cond
                    .wait_for_timeout(ctx, Duration::from_millis(40))
                    .unwrap_err();
                assert!(err.is_timeout(), "expected timeout, got {err}");
                // The permit was re-acquired: mutexed work continues.
                Ok("continued")
            },
        )
        .unwrap();
    assert_eq!(future.await_done_and_get().unwrap(), "continued");
    assert!(condition.is_blocking(), "timeout must not disarm the gate");

    // The permit really is free again for the next competitor.
    let follow_up = manager
        .schedule(JobInput::new("next").with_mutex(mutex), |_ctx| Ok(()))
        .unwrap();
    follow_up.await_done_and_get().unwrap();
    manager.shutdown();
}

#[test]
fn test_condition_is_reusable_after_rearming() {
    let manager = manager(2);
    let condition = manager.create_blocking_condition("gate", true);

    for round in 0..2 {
        let cond = condition.clone();
        let future = manager
            .schedule(JobInput::new(format!("round-{round}")), move |ctx| {
                cond.wait_for(ctx)?;
                Ok(round)
            })
            .unwrap();
        assert!(
            wait_until(Duration::from_secs(2), || condition.waiting_count() == 1),
            "job never parked in round {round}"
        );
        condition.set_blocking(false);
        assert_eq!(future.await_done_and_get().unwrap(), round);
        condition.set_blocking(true);
    }
    manager.shutdown();
}

#[test]
fn test_disarming_wakes_every_waiter() {
    let manager = manager(4);
    let condition = manager.create_blocking_condition("broadcast", true);

    let mut futures = Vec::new();
    for i in 0..3 {
        let cond = condition.clone();
        futures.push(
            manager
                .schedule(JobInput::new(format!("waiter-{i}")), move |ctx| {
                    cond.wait_for(ctx)?;
                    Ok(i)
                })
                .unwrap(),
        );
    }
    assert!(wait_until(Duration::from_secs(2), || {
        condition.waiting_count() == 3
    }));
    condition.set_blocking(false);
    for (i, future) in futures.iter().enumerate() {
        assert_eq!(future.await_done_and_get().unwrap(), i);
    }
    assert!(manager.is_done(&FutureFilter::Any));
    manager.shutdown();
}
