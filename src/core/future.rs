//! Job futures: typed handles onto scheduled work.
//!
//! A [`JobFuture`] is the caller-facing handle for one scheduled unit of
//! work. All mutable lifecycle state lives in a single `parking_lot` mutex
//! per future, with a condvar for done-waiters, the same completion-slot
//! shape used for worker results elsewhere in this crate. The type-erased
//! [`AnyFuture`] view is what the live-future registry, filters, visitors
//! and events operate on.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::core::error::JobError;
use crate::core::input::JobInput;
use crate::core::semaphore::MutexSemaphore;

/// Process-wide unique identity of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(u64);

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

impl JobId {
    /// Allocate the next id from the process-wide counter.
    pub(crate) fn next() -> Self {
        Self(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Numeric value of this id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job.
///
/// Transitions follow the fixed order new → scheduled → waiting-for-permit →
/// running, with an excursion to waiting-for-blocking-condition and back via
/// waiting-for-permit. `Done` is absorbing. Periodic jobs return to
/// `Scheduled` after each completed round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created, not yet accepted by the manager.
    New,
    /// Accepted and waiting to be picked up (or for its next periodic round).
    Scheduled,
    /// Competing for a mutex permit.
    WaitingForPermit,
    /// User work is executing.
    Running,
    /// Parked on an armed blocking condition.
    WaitingForBlockingCondition,
    /// Terminal; the outcome is available.
    Done,
}

/// How a cancellation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancellation {
    /// Cooperative: only the flag is set; running work decides when to stop.
    Soft,
    /// The flag is set and the job's current park point is woken.
    Forced,
}

/// A park point that a forced cancellation can wake.
#[doc(hidden)]
pub trait ParkWaker: Send + Sync {
    /// Wake every thread parked on this point so it re-checks its predicate.
    fn wake_parked(&self);
}

/// Receives completion notifications; implemented by the manager to
/// unregister the future, fire the done event and wake `await_done` callers.
pub(crate) trait CompletionObserver: Send + Sync {
    fn on_done(&self, id: JobId);
}

type DoneHandler<T> = Box<dyn FnOnce(&Result<T, JobError>) + Send>;

/// Mutable lifecycle state, guarded by one mutex.
struct FutureCore<T> {
    state: JobState,
    cancellation: Option<Cancellation>,
    /// Set once user work has started at least once; gates the expiration
    /// check.
    started: bool,
    outcome: Option<Arc<Result<T, JobError>>>,
    handlers: Vec<DoneHandler<T>>,
    parked_on: Option<Arc<dyn ParkWaker>>,
}

/// Shared state behind every [`JobFuture`] clone.
pub(crate) struct FutureInner<T> {
    id: JobId,
    input: JobInput,
    /// The semaphore this job competes on; the future keeps the `Arc` alive
    /// for its whole lifetime so the manager's weak registry cannot swap the
    /// semaphore out from under a parked job.
    sem: Option<Arc<MutexSemaphore>>,
    expires_at: Option<Instant>,
    hints: Mutex<HashSet<String>>,
    core: Mutex<FutureCore<T>>,
    done: Condvar,
    observer: Weak<dyn CompletionObserver>,
}

impl<T: Send + Sync + 'static> FutureInner<T> {
    pub(crate) fn new(
        input: JobInput,
        sem: Option<Arc<MutexSemaphore>>,
        observer: Weak<dyn CompletionObserver>,
    ) -> Arc<Self> {
        let expires_at = input.expiration().map(|ttl| Instant::now() + ttl);
        let hints = input.execution_hints().iter().cloned().collect();
        Arc::new(Self {
            id: JobId::next(),
            input,
            sem,
            expires_at,
            hints: Mutex::new(hints),
            core: Mutex::new(FutureCore {
                state: JobState::New,
                cancellation: None,
                started: false,
                outcome: None,
                handlers: Vec::new(),
                parked_on: None,
            }),
            done: Condvar::new(),
            observer,
        })
    }

    /// Store the outcome, flip to `Done` exactly once, run done handlers and
    /// release any permit or queue position.
    ///
    /// A pending cancellation wins over any captured result: cancellation and
    /// interruption failures pass through unchanged, everything else is
    /// replaced by a cancellation failure.
    pub(crate) fn complete(&self, result: Result<T, JobError>) {
        let (outcome, handlers) = {
            let mut core = self.core.lock();
            if core.outcome.is_some() {
                return;
            }
            let result = if core.cancellation.is_some() {
                match result {
                    Err(e) if e.is_cancellation() || e.is_interruption() => Err(e),
                    _ => Err(JobError::Cancelled(self.input.name().to_owned())),
                }
            } else {
                result
            };
            let outcome = Arc::new(result);
            core.outcome = Some(Arc::clone(&outcome));
            core.state = JobState::Done;
            core.parked_on = None;
            (outcome, std::mem::take(&mut core.handlers))
        };
        self.done.notify_all();
        for handler in handlers {
            handler(&outcome);
        }
        if let Some(sem) = &self.sem {
            sem.release(self.id);
        }
        if let Some(observer) = self.observer.upgrade() {
            observer.on_done(self.id);
        }
    }

    /// Request cancellation. Returns `false` if the job is already done or
    /// a cancellation was already recorded.
    fn request_cancel(&self, kind: Cancellation) -> bool {
        let (state, waker) = {
            let mut core = self.core.lock();
            if core.state == JobState::Done || core.cancellation.is_some() {
                return false;
            }
            core.cancellation = Some(kind);
            let waker = if kind == Cancellation::Forced {
                core.parked_on.clone()
            } else {
                None
            };
            (core.state, waker)
        };
        match state {
            // Never ran: complete right away. `complete` withdraws the job
            // from its semaphore queue and promotes the next competitor.
            JobState::New | JobState::Scheduled => {
                self.complete(Err(JobError::Cancelled(self.input.name().to_owned())));
            }
            // The parked worker owns the completion; wake it so it observes
            // the flag and gives up its queue position.
            JobState::WaitingForPermit => {
                if let Some(sem) = &self.sem {
                    sem.notify_waiters();
                }
            }
            JobState::Running | JobState::WaitingForBlockingCondition => {
                if let Some(waker) = waker {
                    waker.wake_parked();
                }
            }
            JobState::Done => {}
        }
        true
    }

    fn wait_done_until(&self, deadline: Option<Instant>) -> Result<Arc<Result<T, JobError>>, JobError> {
        self.check_waiter_deadlock()?;
        let mut core = self.core.lock();
        loop {
            if let Some(outcome) = &core.outcome {
                return Ok(Arc::clone(outcome));
            }
            match deadline {
                Some(deadline) => {
                    if self.done.wait_until(&mut core, deadline).timed_out() {
                        return match &core.outcome {
                            Some(outcome) => Ok(Arc::clone(outcome)),
                            None => Err(JobError::Timeout(self.input.name().to_owned())),
                        };
                    }
                }
                None => self.done.wait(&mut core),
            }
        }
    }

    /// Fail fast if the calling thread holds a permit on this job's
    /// semaphore: the awaited job could then never acquire it, so the wait
    /// would deadlock.
    fn check_waiter_deadlock(&self) -> Result<(), JobError> {
        if let Some(sem) = &self.sem {
            if let Some(holder) = sem.held_by_thread(thread::current().id()) {
                return Err(JobError::Assertion(format!(
                    "await on job '{}' would deadlock: the calling thread holds the permit of mutex '{}' (job {})",
                    self.input.name(),
                    sem.key().name(),
                    holder,
                )));
            }
        }
        Ok(())
    }
}

impl<T: Send + Sync + 'static> AnyFuture for FutureInner<T> {
    fn id(&self) -> JobId {
        self.id
    }

    fn input(&self) -> &JobInput {
        &self.input
    }

    fn state(&self) -> JobState {
        self.core.lock().state
    }

    fn is_done(&self) -> bool {
        self.state() == JobState::Done
    }

    fn cancellation(&self) -> Option<Cancellation> {
        self.core.lock().cancellation
    }

    fn cancel(&self, force: bool) -> bool {
        let kind = if force {
            Cancellation::Forced
        } else {
            Cancellation::Soft
        };
        self.request_cancel(kind)
    }

    fn contains_execution_hint(&self, hint: &str) -> bool {
        self.hints.lock().contains(hint)
    }

    fn add_execution_hint(&self, hint: &str) -> bool {
        self.hints.lock().insert(hint.to_owned())
    }

    fn remove_execution_hint(&self, hint: &str) -> bool {
        self.hints.lock().remove(hint)
    }

    fn await_done_until(&self, deadline: Option<Instant>) -> Result<(), JobError> {
        self.wait_done_until(deadline).map(|_| ())
    }

    fn semaphore(&self) -> Option<Arc<MutexSemaphore>> {
        self.sem.clone()
    }

    fn set_state(&self, state: JobState) {
        let mut core = self.core.lock();
        if core.state != JobState::Done {
            core.state = state;
        }
    }

    fn try_start(&self) -> bool {
        let mut core = self.core.lock();
        if core.state == JobState::Done || core.cancellation.is_some() {
            return false;
        }
        core.state = JobState::Running;
        core.started = true;
        true
    }

    fn has_started(&self) -> bool {
        self.core.lock().started
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    fn set_parked(&self, waker: Arc<dyn ParkWaker>) {
        self.core.lock().parked_on = Some(waker);
    }

    fn clear_parked(&self) {
        self.core.lock().parked_on = None;
    }
}

/// Type-erased view of a job future.
///
/// This is the currency of the live-future registry, filters, visitors and
/// job events; the typed [`JobFuture`] wrapper adds result extraction on
/// top.
pub trait AnyFuture: Send + Sync {
    /// Unique id of this job.
    fn id(&self) -> JobId;

    /// The input this job was scheduled with.
    fn input(&self) -> &JobInput;

    /// Current lifecycle state.
    fn state(&self) -> JobState;

    /// `true` once the job reached its terminal state.
    fn is_done(&self) -> bool;

    /// The recorded cancellation, if any.
    fn cancellation(&self) -> Option<Cancellation>;

    /// Request cancellation; `force` additionally wakes the job's current
    /// park point. Returns `false` if the job was already done or already
    /// cancelled.
    fn cancel(&self, force: bool) -> bool;

    /// `true` if the given execution hint is currently associated.
    fn contains_execution_hint(&self, hint: &str) -> bool;

    /// Associate an execution hint; returns `false` if it was already set.
    fn add_execution_hint(&self, hint: &str) -> bool;

    /// Remove an execution hint; returns `false` if it was not set.
    fn remove_execution_hint(&self, hint: &str) -> bool;

    /// Block until done, or until the deadline elapses (`None` waits
    /// forever).
    ///
    /// # Errors
    ///
    /// [`JobError::Timeout`] if the deadline elapsed first, or
    /// [`JobError::Assertion`] if waiting would self-deadlock because the
    /// calling thread holds this job's mutex permit.
    fn await_done_until(&self, deadline: Option<Instant>) -> Result<(), JobError>;

    #[doc(hidden)]
    fn semaphore(&self) -> Option<Arc<MutexSemaphore>>;

    #[doc(hidden)]
    fn set_state(&self, state: JobState);

    #[doc(hidden)]
    fn try_start(&self) -> bool;

    #[doc(hidden)]
    fn has_started(&self) -> bool;

    #[doc(hidden)]
    fn is_expired(&self) -> bool;

    #[doc(hidden)]
    fn set_parked(&self, waker: Arc<dyn ParkWaker>);

    #[doc(hidden)]
    fn clear_parked(&self);
}

/// Typed handle onto a scheduled job.
///
/// Cheap to clone; every clone observes the same lifecycle state and
/// outcome.
pub struct JobFuture<T> {
    inner: Arc<FutureInner<T>>,
}

impl<T> Clone for JobFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> JobFuture<T> {
    pub(crate) fn from_inner(inner: Arc<FutureInner<T>>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<FutureInner<T>> {
        &self.inner
    }

    /// Type-erased view of this future.
    #[must_use]
    pub fn as_any(&self) -> Arc<dyn AnyFuture> {
        self.inner.clone()
    }

    /// Unique id of this job.
    #[must_use]
    pub fn id(&self) -> JobId {
        self.inner.id
    }

    /// Diagnostic name of this job.
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.input.name()
    }

    /// The input this job was scheduled with.
    #[must_use]
    pub fn input(&self) -> &JobInput {
        &self.inner.input
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> JobState {
        AnyFuture::state(&*self.inner)
    }

    /// `true` once the job reached its terminal state.
    #[must_use]
    pub fn is_done(&self) -> bool {
        AnyFuture::is_done(&*self.inner)
    }

    /// `true` once a cancellation has been recorded.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation().is_some()
    }

    /// The recorded cancellation, if any.
    #[must_use]
    pub fn cancellation(&self) -> Option<Cancellation> {
        AnyFuture::cancellation(&*self.inner)
    }

    /// Request cancellation of this job.
    ///
    /// `force` additionally wakes the job out of a permit wait or a blocking
    /// condition; a plain (soft) cancellation only raises the flag for
    /// running work to observe. Returns `false` if the job was already done
    /// or already cancelled.
    pub fn cancel(&self, force: bool) -> bool {
        AnyFuture::cancel(&*self.inner, force)
    }

    /// `true` if the given execution hint is currently associated.
    #[must_use]
    pub fn contains_execution_hint(&self, hint: &str) -> bool {
        AnyFuture::contains_execution_hint(&*self.inner, hint)
    }

    /// Associate an execution hint; returns `false` if it was already set.
    pub fn add_execution_hint(&self, hint: &str) -> bool {
        AnyFuture::add_execution_hint(&*self.inner, hint)
    }

    /// Remove an execution hint; returns `false` if it was not set.
    pub fn remove_execution_hint(&self, hint: &str) -> bool {
        AnyFuture::remove_execution_hint(&*self.inner, hint)
    }

    /// Register a handler to run once the job is done.
    ///
    /// If the job is already done the handler runs immediately on the
    /// calling thread; otherwise it runs on the thread that completes the
    /// job.
    pub fn when_done<F>(&self, handler: F)
    where
        F: FnOnce(&Result<T, JobError>) + Send + 'static,
    {
        let outcome = {
            let mut core = self.inner.core.lock();
            match &core.outcome {
                Some(outcome) => Arc::clone(outcome),
                None => {
                    core.handlers.push(Box::new(handler));
                    return;
                }
            }
        };
        handler(&outcome);
    }

    /// Block until the job is done.
    ///
    /// # Errors
    ///
    /// [`JobError::Assertion`] if waiting would self-deadlock because the
    /// calling thread holds this job's mutex permit.
    pub fn await_done(&self) -> Result<(), JobError> {
        self.inner.wait_done_until(None).map(|_| ())
    }

    /// Block until the job is done, at most for `timeout`.
    ///
    /// A timeout raises [`JobError::Timeout`] and leaves the job untouched.
    ///
    /// # Errors
    ///
    /// [`JobError::Timeout`] or [`JobError::Assertion`] as for
    /// [`Self::await_done`].
    pub fn await_done_for(&self, timeout: std::time::Duration) -> Result<(), JobError> {
        self.inner
            .wait_done_until(Some(Instant::now() + timeout))
            .map(|_| ())
    }
}

impl<T: Clone + Send + Sync + 'static> JobFuture<T> {
    /// Block until done and return the job's result.
    ///
    /// # Errors
    ///
    /// The job's failure, or [`JobError::Assertion`] on self-deadlock.
    pub fn await_done_and_get(&self) -> Result<T, JobError> {
        let outcome = self.inner.wait_done_until(None)?;
        outcome.as_ref().clone()
    }

    /// Block until done (at most `timeout`) and return the job's result.
    ///
    /// # Errors
    ///
    /// [`JobError::Timeout`] if the job did not complete in time, otherwise
    /// as [`Self::await_done_and_get`].
    pub fn await_done_and_get_for(&self, timeout: std::time::Duration) -> Result<T, JobError> {
        let outcome = self.inner.wait_done_until(Some(Instant::now() + timeout))?;
        outcome.as_ref().clone()
    }

    /// Alias for [`Self::await_done_and_get`].
    ///
    /// # Errors
    ///
    /// As [`Self::await_done_and_get`].
    pub fn get(&self) -> Result<T, JobError> {
        self.await_done_and_get()
    }
}

impl<T> fmt::Debug for JobFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobFuture")
            .field("id", &self.inner.id)
            .field("name", &self.inner.input.name())
            .finish_non_exhaustive()
    }
}
