//! Blocking conditions: gates that park a running job without holding its
//! mutex permit.
//!
//! The protocol is the asymmetric release/re-acquire dance that makes
//! client/UI round trips possible: a model job waiting on a condition gives
//! its permit up so other model jobs can run, and when the condition clears
//! it re-enters the mutex queue at the tail like any new competitor.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::core::context::JobContext;
use crate::core::error::JobError;
use crate::core::events::JobEventType;
use crate::core::future::{Cancellation, JobId, JobState, ParkWaker};

struct CondState {
    blocking: bool,
    waiters: HashSet<JobId>,
}

struct CondInner {
    name: String,
    state: Mutex<CondState>,
    cond: Condvar,
}

impl ParkWaker for CondInner {
    fn wake_parked(&self) {
        self.cond.notify_all();
    }
}

/// A reusable gate jobs can park on.
///
/// While armed (`blocking == true`), [`wait_for`](Self::wait_for) parks the
/// calling job; disarming wakes every parked job. The condition can be
/// re-armed and reused any number of times.
#[derive(Clone)]
pub struct BlockingCondition {
    inner: Arc<CondInner>,
}

impl BlockingCondition {
    /// Create a condition, initially armed or not.
    #[must_use]
    pub fn new(name: impl Into<String>, blocking: bool) -> Self {
        Self {
            inner: Arc::new(CondInner {
                name: name.into(),
                state: Mutex::new(CondState {
                    blocking,
                    waiters: HashSet::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Diagnostic name of this condition.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// `true` while the condition is armed.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.inner.state.lock().blocking
    }

    /// Arm or disarm the condition. Disarming wakes every parked job; each
    /// re-enters its mutex queue before resuming. Arming never affects jobs
    /// already past the gate.
    pub fn set_blocking(&self, blocking: bool) {
        let mut state = self.inner.state.lock();
        if state.blocking == blocking {
            return;
        }
        state.blocking = blocking;
        if !blocking {
            debug!(condition = %self.inner.name, waiters = state.waiters.len(), "condition released");
            self.inner.cond.notify_all();
        }
    }

    /// Number of jobs currently parked on this condition.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    /// Park the calling job until the condition is disarmed.
    ///
    /// If the job holds a mutex permit, the permit is released before
    /// parking and re-acquired (tail of the queue) before this call
    /// returns. Returns immediately if the condition is not armed.
    ///
    /// # Errors
    ///
    /// [`JobError::Assertion`] if the job competes on a mutex but does not
    /// currently hold its permit; [`JobError::Interrupted`] if a forced
    /// cancellation woke the wait.
    pub fn wait_for(&self, ctx: &JobContext) -> Result<(), JobError> {
        self.wait_until(ctx, None)
    }

    /// Like [`wait_for`](Self::wait_for), but gives up after `timeout`.
    ///
    /// On timeout the mutex permit is re-acquired first (tail of the
    /// queue), then [`JobError::Timeout`] is raised; the condition itself
    /// stays armed.
    ///
    /// # Errors
    ///
    /// As [`wait_for`](Self::wait_for), plus [`JobError::Timeout`].
    pub fn wait_for_timeout(&self, ctx: &JobContext, timeout: Duration) -> Result<(), JobError> {
        self.wait_until(ctx, Some(Instant::now() + timeout))
    }

    fn wait_until(&self, ctx: &JobContext, deadline: Option<Instant>) -> Result<(), JobError> {
        let future = Arc::clone(ctx.future());

        // Fast path: nothing to wait for, permit stays held.
        if !self.is_blocking() {
            return Ok(());
        }

        let sem = future.semaphore();
        if let Some(sem) = &sem {
            if !sem.is_permit_owner(future.id()) {
                return Err(JobError::Assertion(format!(
                    "job '{}' must hold the permit of mutex '{}' to wait on condition '{}'",
                    future.input().name(),
                    sem.key().name(),
                    self.inner.name,
                )));
            }
        }

        // Forced cancellation must be able to wake this park point.
        let waker: Arc<dyn ParkWaker> = self.inner.clone();
        future.set_parked(waker);
        future.set_state(JobState::WaitingForBlockingCondition);
        ctx.manager()
            .fire_job_event(JobEventType::Blocked, Some(Arc::clone(&future)));
        if let Some(sem) = &sem {
            sem.release(future.id());
        }

        let mut timed_out = false;
        {
            let mut state = self.inner.state.lock();
            state.waiters.insert(future.id());
            while state.blocking && future.cancellation() != Some(Cancellation::Forced) {
                match deadline {
                    Some(deadline) => {
                        if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                            timed_out = true;
                            break;
                        }
                    }
                    None => self.inner.cond.wait(&mut state),
                }
            }
            state.waiters.remove(&future.id());
        }
        future.clear_parked();
        ctx.manager()
            .fire_job_event(JobEventType::Unblocked, Some(Arc::clone(&future)));

        if future.cancellation() == Some(Cancellation::Forced) {
            // The worker unwinds; completion withdraws any queue position.
            return Err(JobError::Interrupted(format!(
                "blocking condition '{}'",
                self.inner.name
            )));
        }

        // Back of the queue, like any new competitor.
        if let Some(sem) = &sem {
            future.set_state(JobState::WaitingForPermit);
            sem.enqueue(future.id());
            let fut = Arc::clone(&future);
            sem.await_permit(future.id(), future.input().name(), || {
                fut.cancellation() == Some(Cancellation::Forced)
            })
            .map_err(|_| {
                JobError::Interrupted(format!("blocking condition '{}'", self.inner.name))
            })?;
        }
        future.set_state(JobState::Running);

        if timed_out && self.is_blocking() {
            return Err(JobError::Timeout(format!(
                "blocking condition '{}'",
                self.inner.name
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for BlockingCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("BlockingCondition")
            .field("name", &self.inner.name)
            .field("blocking", &state.blocking)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}
