//! Client and model job managers: session requirements, per-session
//! serialization and the model-thread rule.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use session_jobs::{
    ClientJobManager, FutureFilter, JobInput, JobManagerConfig, ModelJobManager, Session,
};

fn config(workers: usize) -> JobManagerConfig {
    session_jobs::util::telemetry::init_tracing();
    JobManagerConfig::new().with_worker_count(workers)
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let until = Instant::now() + deadline;
    while Instant::now() < until {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    check()
}

#[test]
fn test_client_job_requires_a_session() {
    let manager = ClientJobManager::new(config(2)).unwrap();
    let err = manager
        .schedule(JobInput::new("no-session"), |_ctx| Ok(()))
        .unwrap_err();
    assert!(
        !err.is_cancellation() && !err.is_timeout() && !err.is_rejection(),
        "expected an assertion failure, got {err}"
    );
    assert!(manager.is_done(&FutureFilter::Any), "no future was created");
    manager.shutdown();
}

#[test]
fn test_client_job_sees_its_session() {
    let manager = ClientJobManager::new(config(2)).unwrap();
    let session = Session::new("alice");
    let expected = session.id();
    let future = manager
        .schedule(
            JobInput::new("with-session").with_session(session),
            move |ctx| {
                let installed = ctx
                    .session()
                    .ok_or_else(|| anyhow::anyhow!("session not installed"))?;
                Ok(installed.id() == expected)
            },
        )
        .unwrap();
    assert!(future.await_done_and_get().unwrap());
    manager.shutdown();
}

#[test]
fn test_client_jobs_of_one_session_run_concurrently() {
    let manager = ClientJobManager::new(config(2)).unwrap();
    let session = Session::new("alice");
    let started = Arc::new(AtomicUsize::new(0));

    let mut futures = Vec::new();
    for i in 0..2 {
        let started = Arc::clone(&started);
        futures.push(
            manager
                .schedule(
                    JobInput::new(format!("client-{i}")).with_session(Arc::clone(&session)),
                    move |_ctx| {
                        started.fetch_add(1, Ordering::SeqCst);
                        let until = Instant::now() + Duration::from_secs(2);
                        while started.load(Ordering::SeqCst) < 2 && Instant::now() < until {
                            thread::sleep(Duration::from_millis(2));
                        }
                        Ok(started.load(Ordering::SeqCst))
                    },
                )
                .unwrap(),
        );
    }
    for future in &futures {
        assert_eq!(future.await_done_and_get().unwrap(), 2);
    }
    manager.shutdown();
}

#[test]
fn test_model_jobs_serialize_per_session() {
    let manager = ModelJobManager::new(config(4)).unwrap();
    let session = Session::new("alice");
    let active = Arc::new(AtomicUsize::new(0));

    let mut futures = Vec::new();
    for i in 0..4 {
        let active = Arc::clone(&active);
        futures.push(
            manager
                .schedule(
                    JobInput::new(format!("model-{i}")).with_session(Arc::clone(&session)),
                    move |_ctx| {
                        let overlap = active.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(overlap, 0, "two model jobs of one session overlapped");
                        thread::sleep(Duration::from_millis(10));
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    },
                )
                .unwrap(),
        );
    }
    for future in &futures {
        assert_eq!(future.input().mutex(), Some(&session.model_job_mutex()));
        future.await_done_and_get().unwrap();
    }
    manager.shutdown();
}

#[test]
fn test_model_jobs_of_distinct_sessions_are_independent() {
    let manager = ModelJobManager::new(config(4)).unwrap();
    let alice = Session::new("alice");
    let bob = Session::new("bob");
    let started = Arc::new(AtomicUsize::new(0));

    let mut futures = Vec::new();
    for session in [alice, bob] {
        let started = Arc::clone(&started);
        futures.push(
            manager
                .schedule(
                    JobInput::new(format!("model[{}]", session.name()))
                        .with_session(Arc::clone(&session)),
                    move |_ctx| {
                        started.fetch_add(1, Ordering::SeqCst);
                        let until = Instant::now() + Duration::from_secs(2);
                        while started.load(Ordering::SeqCst) < 2 && Instant::now() < until {
                            thread::sleep(Duration::from_millis(2));
                        }
                        Ok(started.load(Ordering::SeqCst))
                    },
                )
                .unwrap(),
        );
    }
    for future in &futures {
        assert_eq!(future.await_done_and_get().unwrap(), 2, "sessions blocked each other");
    }
    manager.shutdown();
}

#[test]
fn test_model_job_rejects_a_foreign_mutex() {
    let manager = ModelJobManager::new(config(2)).unwrap();
    let session = Session::new("alice");
    let err = manager
        .schedule(
            JobInput::new("wrong-mutex")
                .with_session(session)
                .with_mutex(session_jobs::MutexKey::new("not-the-model-mutex")),
            |_ctx| Ok(()),
        )
        .unwrap_err();
    assert!(
        !err.is_cancellation() && !err.is_timeout() && !err.is_rejection(),
        "expected an assertion failure, got {err}"
    );
    manager.shutdown();
}

#[test]
fn test_inline_model_job_only_from_the_model_thread() {
    let manager = ModelJobManager::new(config(2)).unwrap();
    let session = Session::new("alice");

    // The test thread does not hold the session's model mutex.
    let err = manager
        .run_now(
            JobInput::new("inline-from-outside").with_session(Arc::clone(&session)),
            |_ctx| Ok(()),
        )
        .unwrap_err();
    assert!(
        !err.is_cancellation() && !err.is_timeout() && !err.is_rejection(),
        "expected an assertion failure, got {err}"
    );

    // From inside a model job the calling thread *is* the model thread, so
    // the inline unit nests on the held permit.
    let nested_session = Arc::clone(&session);
    let future = manager
        .schedule(
            JobInput::new("outer").with_session(Arc::clone(&session)),
            move |ctx| {
                let value = ctx.run_now(
                    JobInput::new("inline-nested").with_session(Arc::clone(&nested_session)),
                    |_ctx| Ok(21),
                )?;
                Ok(value * 2)
            },
        )
        .unwrap();
    assert_eq!(future.await_done_and_get().unwrap(), 42);
    manager.shutdown();
}

#[test]
fn test_is_model_thread_tracks_the_permit() {
    let manager = ModelJobManager::new(config(2)).unwrap();
    let session = Session::new("alice");
    assert!(!manager.is_model_thread(&session));

    let probe_session = Arc::clone(&session);
    let future = manager
        .schedule(
            JobInput::new("probe").with_session(Arc::clone(&session)),
            move |ctx| {
                let Some(installed) = ctx.session() else {
                    anyhow::bail!("session not installed");
                };
                Ok(ctx.manager().current_thread_holds(&probe_session.model_job_mutex())
                    && installed.id() == probe_session.id())
            },
        )
        .unwrap();
    assert!(future.await_done_and_get().unwrap());
    assert!(wait_until(Duration::from_secs(2), || {
        !manager.is_model_thread(&session)
    }));
    manager.shutdown();
}
