//! # Session Jobs
//!
//! A cooperative job scheduler with per-session mutual exclusion, built for
//! interactive applications whose per-session state must only ever be
//! touched by one job at a time.
//!
//! ## Core Problem Solved
//!
//! A stateful session (think: one connected client with a UI model) cannot
//! tolerate concurrent mutation, yet its jobs must be able to pause mid-way
//! to wait for an external answer without freezing the whole session.
//! This crate provides:
//!
//! - **Mutex semaphores**: at most one job (configurable capacity) per
//!   mutex key runs at a time; competitors queue strictly first-come,
//!   first-served, and a released permit is granted to the next competitor
//!   atomically.
//! - **Blocking conditions**: a running job can park on a condition and
//!   give its permit up, letting other jobs of the same session run; once
//!   the condition clears it re-enters the queue and resumes where it left
//!   off.
//! - **Cancellation**: soft (flag only) or forced (additionally wakes the
//!   job's current park point), with the flag observable from the job's
//!   execution context.
//! - **Lifecycle events**: scheduled / about-to-run / blocked / unblocked /
//!   done / shutdown, delivered synchronously or via a dispatcher thread.
//!
//! ## Quick Start
//!
//! ```
//! use session_jobs::{JobInput, JobManager, JobManagerConfig, MutexKey};
//!
//! let manager = JobManager::new(JobManagerConfig::new().with_worker_count(2)).unwrap();
//! let mutex = MutexKey::new("session-42");
//!
//! let future = manager
//!     .schedule(JobInput::new("load-form").with_mutex(mutex), |_ctx| Ok(21 * 2))
//!     .unwrap();
//! assert_eq!(future.await_done_and_get().unwrap(), 42);
//! manager.shutdown();
//! ```
//!
//! For the client/model specializations see [`ClientJobManager`] and
//! [`ModelJobManager`]; for a waiting job that must survive a round trip to
//! an external party see [`BlockingCondition`].

/// Scheduler core: manager, futures, mutual exclusion, conditions, events.
pub mod core;
/// Configuration models for the worker pool.
pub mod config;
/// Builders to construct managers from configuration.
pub mod builders;
/// Shared utilities.
pub mod util;

pub use crate::builders::JobManagerBuilder;
pub use crate::config::JobManagerConfig;
pub use crate::core::{
    AnyFuture, BlockingCondition, Cancellation, ChainStep, ClientJobManager, ClientPolicy,
    ContextChain, ContextDecorator, DefaultPolicy, DeliveryMode, FutureFilter,
    FutureFilterBuilder, JobContext, JobError, JobEvent, JobEventFilter, JobEventType, JobFuture,
    JobId, JobInput, JobManager, JobState, ListenerHandle, ModelJobManager, ModelPolicy,
    MutexKey, MutexSemaphore, RunContext, SchedulingPolicy, Session,
};
