//! The job manager: accepts work, runs it on a worker pool and enforces
//! per-mutex serialization.
//!
//! Workers are plain OS threads fed by a bounded channel; a saturated
//! channel rejects the submission instead of blocking the caller. Delayed
//! and periodic jobs go through a single timekeeper thread that moves them
//! onto the worker pool when they come due. Shutdown drops the channel
//! sender, which drains the queue and lets the workers exit.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::config::JobManagerConfig;
use crate::core::condition::BlockingCondition;
use crate::core::context::JobContext;
use crate::core::error::JobError;
use crate::core::events::{DeliveryMode, JobEvent, JobEventBus, JobEventType, ListenerHandle};
use crate::core::filter::{FutureFilter, JobEventFilter};
use crate::core::future::{
    AnyFuture, CompletionObserver, FutureInner, JobFuture, JobId, JobState,
};
use crate::core::input::JobInput;
use crate::core::policy::{DefaultPolicy, SchedulingPolicy};
use crate::core::semaphore::{MutexKey, MutexSemaphore};

type Task = Box<dyn FnOnce() + Send + 'static>;
type PeriodicWork = Arc<dyn Fn(&JobContext) -> anyhow::Result<()> + Send + Sync>;

/// Repeat cadence of a periodic job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeriodicMode {
    /// Rounds start a fixed period after the previous round *started*.
    FixedRate,
    /// Rounds start a fixed period after the previous round *finished*.
    FixedDelay,
}

/// Worker pool: bounded queue, named threads, try-send rejection.
struct Executor {
    sender: Mutex<Option<Sender<Task>>>,
    /// Detached on drop; workers exit once the sender is gone and the
    /// queue drains.
    _workers: Vec<JoinHandle<()>>,
}

impl Executor {
    fn start(config: &JobManagerConfig) -> Result<Self, JobError> {
        let (tx, rx) = bounded::<Task>(config.max_queue_depth);
        let mut workers = Vec::with_capacity(config.worker_count);
        for i in 0..config.worker_count {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{i}", config.thread_name_prefix))
                .stack_size(config.thread_stack_size)
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        task();
                    }
                    trace!("worker exiting");
                })
                .map_err(|err| {
                    JobError::failed(anyhow::anyhow!("failed to spawn worker thread: {err}"))
                })?;
            workers.push(handle);
        }
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            _workers: workers,
        })
    }

    fn submit(&self, task: Task) -> Result<(), JobError> {
        let guard = self.sender.lock();
        match guard.as_ref() {
            Some(sender) => sender
                .try_send(task)
                .map_err(|_| JobError::Rejected("executor queue saturated".to_owned())),
            None => Err(JobError::Rejected("executor is shut down".to_owned())),
        }
    }

    fn shutdown(&self) {
        *self.sender.lock() = None;
    }
}

/// One pending timekeeper entry; min-ordered by due time, FIFO within the
/// same instant.
struct TimerEntry {
    at: Instant,
    seq: u64,
    action: Task,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest entry on
        // top.
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerQueue {
    entries: BinaryHeap<TimerEntry>,
    next_seq: u64,
    shutdown: bool,
}

struct TimerShared {
    queue: Mutex<TimerQueue>,
    cond: Condvar,
}

/// Single timekeeper thread for delayed and periodic scheduling.
struct Timer {
    shared: Arc<TimerShared>,
}

impl Timer {
    fn start() -> Result<Self, JobError> {
        let shared = Arc::new(TimerShared {
            queue: Mutex::new(TimerQueue {
                entries: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let loop_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("sj-timer".to_owned())
            .spawn(move || timer_loop(&loop_shared))
            .map_err(|err| {
                JobError::failed(anyhow::anyhow!("failed to spawn timer thread: {err}"))
            })?;
        Ok(Self { shared })
    }

    fn submit(&self, at: Instant, action: Task) {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            // The affected futures were already force-cancelled.
            return;
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.entries.push(TimerEntry { at, seq, action });
        self.shared.cond.notify_one();
    }

    fn shutdown(&self) {
        let mut queue = self.shared.queue.lock();
        queue.shutdown = true;
        queue.entries.clear();
        self.shared.cond.notify_one();
    }
}

fn timer_loop(shared: &Arc<TimerShared>) {
    loop {
        let action = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.shutdown {
                    return;
                }
                match queue.entries.peek().map(|entry| entry.at) {
                    None => shared.cond.wait(&mut queue),
                    Some(at) if at > Instant::now() => {
                        let _ = shared.cond.wait_until(&mut queue, at);
                    }
                    Some(_) => break,
                }
            }
            queue.entries.pop().map(|entry| entry.action)
        };
        if let Some(action) = action {
            action();
        }
    }
}

/// Everything shared between manager handles, futures and worker tasks.
pub(crate) struct ManagerShared {
    config: JobManagerConfig,
    policy: Arc<dyn SchedulingPolicy>,
    semaphores: Mutex<HashMap<MutexKey, Weak<MutexSemaphore>>>,
    futures: Mutex<HashMap<JobId, Arc<dyn AnyFuture>>>,
    done_sync: Mutex<()>,
    done_cond: Condvar,
    events: JobEventBus,
    executor: Executor,
    timer: Timer,
    shutdown: AtomicBool,
}

impl CompletionObserver for ManagerShared {
    fn on_done(&self, id: JobId) {
        let future = self.futures.lock().remove(&id);
        if let Some(future) = future {
            debug!(job = %id, name = %future.input().name(), "job done");
            self.events.fire(JobEvent::new(JobEventType::Done, Some(future)));
        }
        // Pair the notification with the waiters' predicate check.
        let _sync = self.done_sync.lock();
        self.done_cond.notify_all();
    }
}

/// The scheduler facade.
///
/// Cheap to clone; all clones share the same worker pool, futures registry
/// and event bus. See the crate docs for a usage walk-through.
pub struct JobManager {
    shared: Arc<ManagerShared>,
}

impl Clone for JobManager {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl fmt::Debug for JobManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobManager")
            .field("policy", &self.shared.policy.name())
            .field("workers", &self.shared.config.worker_count)
            .finish_non_exhaustive()
    }
}

impl JobManager {
    /// Create a manager with the default scheduling policy.
    ///
    /// # Errors
    ///
    /// [`JobError::Assertion`] if the configuration is invalid, or a
    /// failure spawning the worker threads.
    pub fn new(config: JobManagerConfig) -> Result<Self, JobError> {
        Self::with_policy(config, Arc::new(DefaultPolicy))
    }

    /// Create a manager with an explicit scheduling policy.
    ///
    /// # Errors
    ///
    /// As [`Self::new`].
    pub fn with_policy(
        config: JobManagerConfig,
        policy: Arc<dyn SchedulingPolicy>,
    ) -> Result<Self, JobError> {
        config.validate().map_err(JobError::Assertion)?;
        let executor = Executor::start(&config)?;
        let timer = Timer::start()?;
        let shared = Arc::new(ManagerShared {
            config,
            policy,
            semaphores: Mutex::new(HashMap::new()),
            futures: Mutex::new(HashMap::new()),
            done_sync: Mutex::new(()),
            done_cond: Condvar::new(),
            events: JobEventBus::start(),
            executor,
            timer,
            shutdown: AtomicBool::new(false),
        });
        info!(
            policy = shared.policy.name(),
            workers = shared.config.worker_count,
            "job manager started"
        );
        Ok(Self { shared })
    }

    /// The configuration this manager was built with.
    #[must_use]
    pub fn config(&self) -> &JobManagerConfig {
        &self.shared.config
    }

    /// `true` once [`Self::shutdown`] has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Schedule `work` for asynchronous execution.
    ///
    /// The returned future is already completed (cancelled) if the manager
    /// is shut down, and completed rejected if the worker queue is
    /// saturated.
    ///
    /// # Errors
    ///
    /// [`JobError::Assertion`] if the policy rejects the input; no future
    /// exists in that case.
    pub fn schedule<T, F>(&self, input: JobInput, work: F) -> Result<JobFuture<T>, JobError>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&JobContext) -> anyhow::Result<T> + Send + 'static,
    {
        let input = self.shared.policy.prepare(input)?;
        let (inner, sem) = self.make_future::<T>(input);
        let future = JobFuture::from_inner(Arc::clone(&inner));
        if self.is_shutdown() {
            debug!(job = %future.id(), "manager is down, completing as cancelled");
            inner.complete(Err(JobError::Cancelled(future.name().to_owned())));
            return Ok(future);
        }
        inner.set_state(JobState::Scheduled);
        // Queue position is taken before the future becomes visible to
        // filters, so a racing cancel always finds a withdrawable entry.
        if let Some(sem) = &sem {
            sem.enqueue(future.id());
        }
        self.register(inner.clone());
        self.fire_job_event(JobEventType::Scheduled, Some(future.as_any()));
        self.submit_run(inner, work);
        Ok(future)
    }

    /// Schedule `work` to start after `delay`.
    ///
    /// The job takes its mutex queue position when the delay elapses, not
    /// at submission; an expiration budget, however, counts from now.
    ///
    /// # Errors
    ///
    /// As [`Self::schedule`].
    pub fn schedule_delayed<T, F>(
        &self,
        input: JobInput,
        delay: Duration,
        work: F,
    ) -> Result<JobFuture<T>, JobError>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&JobContext) -> anyhow::Result<T> + Send + 'static,
    {
        let input = self.shared.policy.prepare(input)?;
        let (inner, _sem) = self.make_future::<T>(input);
        let future = JobFuture::from_inner(Arc::clone(&inner));
        if self.is_shutdown() {
            inner.complete(Err(JobError::Cancelled(future.name().to_owned())));
            return Ok(future);
        }
        inner.set_state(JobState::Scheduled);
        self.register(inner.clone());
        self.fire_job_event(JobEventType::Scheduled, Some(future.as_any()));

        let manager = self.clone();
        let task_inner = Arc::clone(&inner);
        self.shared.timer.submit(
            Instant::now() + delay,
            Box::new(move || {
                if task_inner.is_done() {
                    return;
                }
                if let Some(sem) = task_inner.semaphore() {
                    sem.enqueue(task_inner.id());
                    if task_inner.is_done() {
                        // Lost the race against a concurrent cancellation;
                        // scrub the queue entry.
                        sem.release(task_inner.id());
                        return;
                    }
                }
                manager.submit_run(task_inner, work);
            }),
        );
        Ok(future)
    }

    /// Schedule `work` to repeat, each round starting `period` after the
    /// previous round started.
    ///
    /// Each round competes for the mutex anew; the future completes only
    /// through cancellation, shutdown or a failing round.
    ///
    /// # Errors
    ///
    /// As [`Self::schedule`].
    pub fn schedule_at_fixed_rate<F>(
        &self,
        input: JobInput,
        initial_delay: Duration,
        period: Duration,
        work: F,
    ) -> Result<JobFuture<()>, JobError>
    where
        F: Fn(&JobContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.schedule_periodic(input, initial_delay, period, PeriodicMode::FixedRate, Arc::new(work))
    }

    /// Schedule `work` to repeat, each round starting `period` after the
    /// previous round finished.
    ///
    /// # Errors
    ///
    /// As [`Self::schedule`].
    pub fn schedule_with_fixed_delay<F>(
        &self,
        input: JobInput,
        initial_delay: Duration,
        period: Duration,
        work: F,
    ) -> Result<JobFuture<()>, JobError>
    where
        F: Fn(&JobContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.schedule_periodic(input, initial_delay, period, PeriodicMode::FixedDelay, Arc::new(work))
    }

    fn schedule_periodic(
        &self,
        input: JobInput,
        initial_delay: Duration,
        period: Duration,
        mode: PeriodicMode,
        work: PeriodicWork,
    ) -> Result<JobFuture<()>, JobError> {
        let input = self.shared.policy.prepare(input)?;
        let (inner, _sem) = self.make_future::<()>(input);
        let future = JobFuture::from_inner(Arc::clone(&inner));
        if self.is_shutdown() {
            inner.complete(Err(JobError::Cancelled(future.name().to_owned())));
            return Ok(future);
        }
        inner.set_state(JobState::Scheduled);
        self.register(inner.clone());
        self.fire_job_event(JobEventType::Scheduled, Some(future.as_any()));
        arm_periodic(
            Arc::clone(&self.shared),
            inner,
            work,
            mode,
            period,
            Instant::now() + initial_delay,
        );
        Ok(future)
    }

    /// Execute `work` inline on the calling thread and return its result.
    ///
    /// The calling thread competes for the mutex like any scheduled job.
    /// If it already holds the input's mutex, the work runs as a nested
    /// unit on behalf of the permit-holding job: no new future is created
    /// and the nested unit cannot be cancelled independently.
    ///
    /// # Errors
    ///
    /// The work's failure, a policy assertion, or a cancellation raised
    /// while waiting for the permit.
    pub fn run_now<T, F>(&self, input: JobInput, work: F) -> Result<T, JobError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(&JobContext) -> anyhow::Result<T> + Send + 'static,
    {
        let input = self.shared.policy.prepare(input)?;
        self.shared.policy.validate_run_now(&input, self)?;

        if let Some(key) = input.mutex() {
            let held = self
                .upgrade_semaphore(key)
                .and_then(|sem| sem.held_by_thread(thread::current().id()));
            if let Some(holder) = held {
                let holder_future = self.shared.futures.lock().get(&holder).cloned();
                if let Some(holder_future) = holder_future {
                    return self.run_nested(holder_future, &input, Box::new(work));
                }
            }
        }

        if self.is_shutdown() {
            return Err(JobError::Cancelled(input.name().to_owned()));
        }

        let (inner, sem) = self.make_future::<T>(input);
        let future = JobFuture::from_inner(Arc::clone(&inner));
        inner.set_state(JobState::Scheduled);
        if let Some(sem) = &sem {
            sem.enqueue(future.id());
        }
        self.register(inner.clone());
        self.fire_job_event(JobEventType::Scheduled, Some(future.as_any()));

        if let Some(sem) = &sem {
            inner.set_state(JobState::WaitingForPermit);
            let guard = Arc::clone(&inner);
            if let Err(err) = sem.await_permit(future.id(), future.name(), || {
                guard.cancellation().is_some()
            }) {
                inner.complete(Err(err));
                return future.await_done_and_get();
            }
        }
        if !inner.has_started() && inner.is_expired() {
            inner.complete(Err(JobError::Cancelled(format!(
                "{} [expired]",
                future.name()
            ))));
            return future.await_done_and_get();
        }

        if !inner.try_start() {
            inner.complete(Err(JobError::Cancelled(future.name().to_owned())));
            return future.await_done_and_get();
        }
        self.fire_job_event(JobEventType::AboutToRun, Some(future.as_any()));
        let chain = self.shared.policy.context_chain(inner.input());
        let mut ctx = JobContext::new(future.as_any(), self.clone());
        let result = chain.invoke(&mut ctx, inner.input(), Box::new(work));
        inner.complete(result);
        future.await_done_and_get()
    }

    fn run_nested<T>(
        &self,
        holder: Arc<dyn AnyFuture>,
        input: &JobInput,
        work: Box<dyn FnOnce(&JobContext) -> anyhow::Result<T> + Send + '_>,
    ) -> Result<T, JobError> {
        debug!(outer = %holder.id(), job = %input.name(), "running nested inline unit");
        let chain = self.shared.policy.context_chain(input);
        let mut ctx = JobContext::new(holder, self.clone());
        chain.invoke(&mut ctx, input, work)
    }

    /// Cancel every live future matching the filter.
    ///
    /// Returns `true` if at least one future matched and every matched
    /// future accepted the cancellation.
    pub fn cancel(&self, filter: &FutureFilter, force: bool) -> bool {
        let targets = self.snapshot(filter);
        if targets.is_empty() {
            return false;
        }
        let mut all = true;
        for future in targets {
            all &= future.cancel(force);
        }
        all
    }

    /// Visit a snapshot of the live futures matching the filter, in job-id
    /// order. The visitor returns `false` to stop early.
    pub fn visit<V>(&self, filter: &FutureFilter, mut visitor: V)
    where
        V: FnMut(&Arc<dyn AnyFuture>) -> bool,
    {
        for future in self.snapshot(filter) {
            if !visitor(&future) {
                break;
            }
        }
    }

    /// A snapshot of the live futures matching the filter, in job-id order.
    #[must_use]
    pub fn futures(&self, filter: &FutureFilter) -> Vec<Arc<dyn AnyFuture>> {
        self.snapshot(filter)
    }

    /// `true` if no live future matches the filter.
    #[must_use]
    pub fn is_done(&self, filter: &FutureFilter) -> bool {
        let futures = self.shared.futures.lock();
        !futures
            .values()
            .any(|future| !future.is_done() && filter.accept(future.as_ref()))
    }

    /// Block until no live future matches the filter, at most for
    /// `timeout`.
    ///
    /// # Errors
    ///
    /// [`JobError::Timeout`] if matching futures were still live when the
    /// timeout elapsed.
    pub fn await_done(&self, filter: &FutureFilter, timeout: Duration) -> Result<(), JobError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.done_sync.lock();
        loop {
            if self.is_done(filter) {
                return Ok(());
            }
            if self
                .shared
                .done_cond
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                return if self.is_done(filter) {
                    Ok(())
                } else {
                    Err(JobError::Timeout("matching jobs to complete".to_owned()))
                };
            }
        }
    }

    /// `true` if the given job is currently parked on a blocking condition.
    #[must_use]
    pub fn is_blocked(&self, id: JobId) -> bool {
        self.shared
            .futures
            .lock()
            .get(&id)
            .map_or(false, |future| {
                future.state() == JobState::WaitingForBlockingCondition
            })
    }

    /// Create a blocking condition managed alongside this manager's jobs.
    #[must_use]
    pub fn create_blocking_condition(
        &self,
        name: impl Into<String>,
        blocking: bool,
    ) -> BlockingCondition {
        BlockingCondition::new(name, blocking)
    }

    /// Register a job event listener.
    ///
    /// `filter: None` receives every event. Disposal is explicit via the
    /// returned handle.
    pub fn add_listener<F>(
        &self,
        filter: Option<JobEventFilter>,
        mode: DeliveryMode,
        callback: F,
    ) -> ListenerHandle
    where
        F: Fn(&JobEvent) + Send + Sync + 'static,
    {
        self.shared.events.add_listener(filter, mode, Box::new(callback))
    }

    /// `true` if the calling thread currently holds a permit of the given
    /// mutex key.
    #[must_use]
    pub fn current_thread_holds(&self, key: &MutexKey) -> bool {
        self.upgrade_semaphore(key)
            .and_then(|sem| sem.held_by_thread(thread::current().id()))
            .is_some()
    }

    /// Shut the manager down. Idempotent; never waits for running jobs.
    ///
    /// Live futures are force-cancelled, later submissions complete as
    /// already cancelled, and a synchronous shutdown event is delivered to
    /// every listener on the calling thread.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("job manager shutting down");
        let live: Vec<_> = self.shared.futures.lock().values().cloned().collect();
        for future in live {
            future.cancel(true);
        }
        self.shared.timer.shutdown();
        self.shared.executor.shutdown();
        self.shared
            .events
            .fire_sync_to_all(&JobEvent::new(JobEventType::Shutdown, None));
        self.shared.events.shutdown();
    }

    pub(crate) fn fire_job_event(&self, event_type: JobEventType, future: Option<Arc<dyn AnyFuture>>) {
        self.shared.events.fire(JobEvent::new(event_type, future));
    }

    fn make_future<T: Send + Sync + 'static>(
        &self,
        input: JobInput,
    ) -> (Arc<FutureInner<T>>, Option<Arc<MutexSemaphore>>) {
        let sem = input.mutex().map(|key| self.semaphore_for(key));
        let observer = Arc::downgrade(&self.shared);
        let inner = FutureInner::new(input, sem.clone(), observer);
        (inner, sem)
    }

    fn register(&self, future: Arc<dyn AnyFuture>) {
        self.shared.futures.lock().insert(future.id(), future);
    }

    fn snapshot(&self, filter: &FutureFilter) -> Vec<Arc<dyn AnyFuture>> {
        let mut matching: Vec<_> = self
            .shared
            .futures
            .lock()
            .values()
            .filter(|future| filter.accept(future.as_ref()))
            .cloned()
            .collect();
        matching.sort_by_key(|future| future.id());
        matching
    }

    /// Get or lazily create the semaphore for a mutex key. Dead weak
    /// entries are pruned on the way.
    fn semaphore_for(&self, key: &MutexKey) -> Arc<MutexSemaphore> {
        let mut map = self.shared.semaphores.lock();
        map.retain(|_, weak| weak.strong_count() > 0);
        if let Some(sem) = map.get(key).and_then(Weak::upgrade) {
            return sem;
        }
        let sem = Arc::new(MutexSemaphore::new(key.clone()));
        map.insert(key.clone(), Arc::downgrade(&sem));
        sem
    }

    fn upgrade_semaphore(&self, key: &MutexKey) -> Option<Arc<MutexSemaphore>> {
        self.shared.semaphores.lock().get(key).and_then(Weak::upgrade)
    }

    fn submit_run<T, F>(&self, inner: Arc<FutureInner<T>>, work: F)
    where
        T: Send + Sync + 'static,
        F: FnOnce(&JobContext) -> anyhow::Result<T> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let task_inner = Arc::clone(&inner);
        let submitted = self.shared.executor.submit(Box::new(move || {
            run_task(&shared, &task_inner, Box::new(work));
        }));
        if submitted.is_err() {
            warn!(job = %inner.id(), name = %inner.input().name(), "executor rejected job");
            inner.complete(Err(JobError::Rejected(inner.input().name().to_owned())));
        }
    }
}

/// Body of one worker task for a single-shot job.
fn run_task<T: Send + Sync + 'static>(
    shared: &Arc<ManagerShared>,
    inner: &Arc<FutureInner<T>>,
    work: Box<dyn FnOnce(&JobContext) -> anyhow::Result<T> + Send>,
) {
    // Cancelled or rejected before any worker picked it up.
    if inner.is_done() {
        return;
    }
    let name = inner.input().name().to_owned();
    if let Some(sem) = inner.semaphore() {
        if !sem.is_permit_owner(inner.id()) {
            inner.set_state(JobState::WaitingForPermit);
        }
        let guard = Arc::clone(inner);
        if let Err(err) = sem.await_permit(inner.id(), &name, || guard.cancellation().is_some()) {
            inner.complete(Err(err));
            return;
        }
    }
    // The expiration gate applies only before the work first starts.
    if !inner.has_started() && inner.is_expired() {
        debug!(job = %inner.id(), name = %name, "job expired before start");
        inner.complete(Err(JobError::Cancelled(format!("{name} [expired]"))));
        return;
    }
    // Claim the job: flipping to running and setting the started gate
    // happen in one critical section with the cancellation check, so a
    // concurrent cancel either lands before the claim (the body never
    // runs, the permit is withdrawn here) or after it (flag only, the
    // permit stays held until completion).
    if !inner.try_start() {
        inner.complete(Err(JobError::Cancelled(name)));
        return;
    }

    let any: Arc<dyn AnyFuture> = inner.clone();
    shared
        .events
        .fire(JobEvent::new(JobEventType::AboutToRun, Some(Arc::clone(&any))));

    let manager = JobManager {
        shared: Arc::clone(shared),
    };
    let chain = shared.policy.context_chain(inner.input());
    let mut ctx = JobContext::new(any, manager);
    let result = chain.invoke(&mut ctx, inner.input(), work);
    inner.complete(result);
}

/// Put the next round of a periodic job onto the timekeeper.
fn arm_periodic(
    shared: Arc<ManagerShared>,
    inner: Arc<FutureInner<()>>,
    work: PeriodicWork,
    mode: PeriodicMode,
    period: Duration,
    at: Instant,
) {
    let timer_shared = Arc::clone(&shared);
    timer_shared.timer.submit(
        at,
        Box::new(move || {
            if inner.is_done() {
                return;
            }
            if let Some(sem) = inner.semaphore() {
                sem.enqueue(inner.id());
                if inner.is_done() {
                    sem.release(inner.id());
                    return;
                }
            }
            let exec_shared = Arc::clone(&shared);
            let round_inner = Arc::clone(&inner);
            let round_work = Arc::clone(&work);
            let submitted = shared.executor.submit(Box::new(move || {
                run_round(exec_shared, round_inner, round_work, mode, period);
            }));
            if submitted.is_err() {
                inner.complete(Err(JobError::Rejected(inner.input().name().to_owned())));
            }
        }),
    );
}

/// Body of one round of a periodic job.
fn run_round(
    shared: Arc<ManagerShared>,
    inner: Arc<FutureInner<()>>,
    work: PeriodicWork,
    mode: PeriodicMode,
    period: Duration,
) {
    if inner.is_done() {
        return;
    }
    let name = inner.input().name().to_owned();
    if let Some(sem) = inner.semaphore() {
        if !sem.is_permit_owner(inner.id()) {
            inner.set_state(JobState::WaitingForPermit);
        }
        let guard = Arc::clone(&inner);
        if let Err(err) = sem.await_permit(inner.id(), &name, || guard.cancellation().is_some()) {
            inner.complete(Err(err));
            return;
        }
    }
    if !inner.has_started() && inner.is_expired() {
        inner.complete(Err(JobError::Cancelled(format!("{name} [expired]"))));
        return;
    }
    if !inner.try_start() {
        inner.complete(Err(JobError::Cancelled(name)));
        return;
    }

    let round_started = Instant::now();
    let any: Arc<dyn AnyFuture> = inner.clone();
    shared
        .events
        .fire(JobEvent::new(JobEventType::AboutToRun, Some(Arc::clone(&any))));

    let manager = JobManager {
        shared: Arc::clone(&shared),
    };
    let chain = shared.policy.context_chain(inner.input());
    let mut ctx = JobContext::new(any, manager);
    let round = Arc::clone(&work);
    let result = chain.invoke(&mut ctx, inner.input(), Box::new(move |ctx| round(ctx)));

    if inner.cancellation().is_some() {
        inner.complete(Err(JobError::Cancelled(name)));
        return;
    }
    match result {
        Err(err) => inner.complete(Err(err)),
        Ok(()) => {
            // Round done, future stays alive: free the permit and go back
            // to the scheduled state until the next round is due.
            if let Some(sem) = inner.semaphore() {
                sem.release(inner.id());
            }
            inner.set_state(JobState::Scheduled);
            let next = match mode {
                PeriodicMode::FixedRate => round_started + period,
                PeriodicMode::FixedDelay => Instant::now() + period,
            };
            arm_periodic(shared, inner, work, mode, period, next);
        }
    }
}
