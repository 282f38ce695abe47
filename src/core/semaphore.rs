//! Mutual-exclusion semaphore for competing jobs.
//!
//! A [`MutexSemaphore`] grants at most *capacity* concurrent permits for one
//! [`MutexKey`] and keeps competitors in a strict FIFO queue. Waiting is
//! implemented with a `parking_lot` mutex/condvar pair; a worker thread
//! blocked on a permit consumes no CPU. Releasing a permit and granting it
//! to the next queued competitor happen under a single lock, so no thread
//! can ever observe a released-but-ungranted permit.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::core::error::JobError;
use crate::core::future::JobId;

/// Identity used to group units of work that must not run concurrently.
///
/// Two keys are equal only if they are clones of the same allocation; the
/// name is purely diagnostic. A session typically owns one key with
/// capacity 1, which is what gives model jobs their single-writer
/// guarantee.
#[derive(Clone)]
pub struct MutexKey {
    inner: Arc<KeyInner>,
}

struct KeyInner {
    name: String,
    capacity: usize,
}

impl MutexKey {
    /// Create a key with the default permit capacity of 1.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, 1)
    }

    /// Create a key granting up to `capacity` concurrent permits.
    ///
    /// A zero capacity is coerced to 1.
    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(KeyInner {
                name: name.into(),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Diagnostic name of this key.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of concurrent permit holders this key allows.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

impl PartialEq for MutexKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for MutexKey {}

impl Hash for MutexKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl fmt::Debug for MutexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexKey")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

/// Permit bookkeeping for one mutex key.
struct SemState {
    /// Current permit holders, each with the thread that acquired the
    /// permit (set once the owning worker observes the grant).
    holders: HashMap<JobId, Option<ThreadId>>,
    /// Competitors waiting for a permit, first-come-first-served.
    queue: VecDeque<JobId>,
}

/// A named counting permit with an ordered queue of competing jobs.
///
/// Created lazily per distinct [`MutexKey`] by the job manager and dropped
/// once no live future references it any more.
pub struct MutexSemaphore {
    key: MutexKey,
    state: Mutex<SemState>,
    cond: Condvar,
}

impl MutexSemaphore {
    /// Create a semaphore for the given key.
    #[must_use]
    pub fn new(key: MutexKey) -> Self {
        Self {
            key,
            state: Mutex::new(SemState {
                holders: HashMap::new(),
                queue: VecDeque::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// The key this semaphore guards.
    #[must_use]
    pub fn key(&self) -> &MutexKey {
        &self.key
    }

    /// Append a competitor to the tail of the queue and promote queued
    /// competitors into free permit slots.
    ///
    /// There is deliberately no head-insertion variant: a job resuming from
    /// a blocking condition re-enters here like any new competitor.
    pub fn enqueue(&self, id: JobId) {
        let mut state = self.state.lock();
        if state.holders.contains_key(&id) || state.queue.contains(&id) {
            return;
        }
        state.queue.push_back(id);
        trace!(mutex = %self.key.name(), job = %id, "competitor enqueued");
        self.promote(&mut state);
    }

    /// Block the calling thread until `id` holds a permit.
    ///
    /// `give_up` is polled whenever the wait wakes; when it returns `true`
    /// the competitor withdraws from the queue and the call fails with a
    /// cancellation error. On success the calling thread is recorded as the
    /// permit-owning thread.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Cancelled`] if `give_up` fired before a permit
    /// was granted.
    pub fn await_permit<F>(&self, id: JobId, label: &str, give_up: F) -> Result<(), JobError>
    where
        F: Fn() -> bool,
    {
        let mut state = self.state.lock();
        loop {
            if state.holders.contains_key(&id) {
                state.holders.insert(id, Some(thread::current().id()));
                trace!(mutex = %self.key.name(), job = %id, "permit acquired");
                return Ok(());
            }
            if give_up() {
                state.queue.retain(|queued| *queued != id);
                self.promote(&mut state);
                return Err(JobError::Cancelled(label.to_owned()));
            }
            self.cond.wait(&mut state);
        }
    }

    /// Release the permit (or queue position) held by `id` and grant the
    /// next queued competitor in the same critical section.
    pub fn release(&self, id: JobId) {
        let mut state = self.state.lock();
        if state.holders.remove(&id).is_none() {
            state.queue.retain(|queued| *queued != id);
        } else {
            trace!(mutex = %self.key.name(), job = %id, "permit released");
        }
        self.promote(&mut state);
        // Wake cancelled waiters too; they re-check their give-up predicate.
        self.cond.notify_all();
    }

    /// Wake all threads parked on this semaphore so they re-evaluate their
    /// give-up predicates. Used when a queued competitor is cancelled.
    pub fn notify_waiters(&self) {
        self.cond.notify_all();
    }

    /// `true` if `id` currently holds a permit.
    #[must_use]
    pub fn is_permit_owner(&self, id: JobId) -> bool {
        self.state.lock().holders.contains_key(&id)
    }

    /// The job whose permit was acquired on the given thread, if any.
    #[must_use]
    pub fn held_by_thread(&self, thread: ThreadId) -> Option<JobId> {
        let state = self.state.lock();
        state
            .holders
            .iter()
            .find(|(_, owner)| **owner == Some(thread))
            .map(|(id, _)| *id)
    }

    /// `true` once both the holder set and the queue are empty.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.holders.is_empty() && state.queue.is_empty()
    }

    /// Number of competitors currently holding or waiting for a permit.
    #[must_use]
    pub fn competitor_count(&self) -> usize {
        let state = self.state.lock();
        state.holders.len() + state.queue.len()
    }

    /// Move queued competitors into free permit slots, FIFO.
    fn promote(&self, state: &mut SemState) {
        let mut granted = false;
        while state.holders.len() < self.key.capacity() {
            match state.queue.pop_front() {
                Some(next) => {
                    state.holders.insert(next, None);
                    trace!(mutex = %self.key.name(), job = %next, "permit granted");
                    granted = true;
                }
                None => break,
            }
        }
        if granted {
            self.cond.notify_all();
        }
    }
}

impl fmt::Debug for MutexSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MutexSemaphore")
            .field("key", &self.key)
            .field("holders", &state.holders.len())
            .field("queued", &state.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn id(n: u64) -> JobId {
        JobId::from_raw(n)
    }

    #[test]
    fn test_key_identity() {
        let a = MutexKey::new("a");
        let b = MutexKey::new("a");
        assert_eq!(a, a.clone());
        assert_ne!(a, b, "keys with equal names are still distinct");
    }

    #[test]
    fn test_first_competitor_granted_immediately() {
        let sem = MutexSemaphore::new(MutexKey::new("m"));
        sem.enqueue(id(1));
        assert!(sem.is_permit_owner(id(1)));
        sem.enqueue(id(2));
        assert!(!sem.is_permit_owner(id(2)));
        assert_eq!(sem.competitor_count(), 2);
    }

    #[test]
    fn test_release_grants_fifo() {
        let sem = MutexSemaphore::new(MutexKey::new("m"));
        sem.enqueue(id(1));
        sem.enqueue(id(2));
        sem.enqueue(id(3));

        sem.release(id(1));
        assert!(sem.is_permit_owner(id(2)));
        assert!(!sem.is_permit_owner(id(3)));

        sem.release(id(2));
        assert!(sem.is_permit_owner(id(3)));

        sem.release(id(3));
        assert!(sem.is_idle());
    }

    #[test]
    fn test_capacity_two_grants_two() {
        let sem = MutexSemaphore::new(MutexKey::with_capacity("m", 2));
        sem.enqueue(id(1));
        sem.enqueue(id(2));
        sem.enqueue(id(3));
        assert!(sem.is_permit_owner(id(1)));
        assert!(sem.is_permit_owner(id(2)));
        assert!(!sem.is_permit_owner(id(3)));
    }

    #[test]
    fn test_await_permit_blocks_until_release() {
        let sem = Arc::new(MutexSemaphore::new(MutexKey::new("m")));
        sem.enqueue(id(1));
        sem.enqueue(id(2));

        let sem2 = Arc::clone(&sem);
        let waiter = thread::spawn(move || {
            sem2.await_permit(id(2), "j2", || false).unwrap();
            sem2.held_by_thread(thread::current().id())
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        sem.release(id(1));
        assert_eq!(waiter.join().unwrap(), Some(id(2)));
    }

    #[test]
    fn test_give_up_withdraws_from_queue() {
        let sem = Arc::new(MutexSemaphore::new(MutexKey::new("m")));
        sem.enqueue(id(1));
        sem.enqueue(id(2));
        sem.enqueue(id(3));

        let cancelled = Arc::new(AtomicBool::new(false));
        let sem2 = Arc::clone(&sem);
        let flag = Arc::clone(&cancelled);
        let waiter = thread::spawn(move || sem2.await_permit(id(2), "j2", || flag.load(Ordering::Acquire)));

        thread::sleep(Duration::from_millis(20));
        cancelled.store(true, Ordering::Release);
        sem.notify_waiters();

        let err = waiter.join().unwrap().unwrap_err();
        assert!(err.is_cancellation());

        // The withdrawn competitor must not stall the queue.
        sem.release(id(1));
        assert!(sem.is_permit_owner(id(3)));
    }

    #[test]
    fn test_release_of_queued_competitor_keeps_order() {
        let sem = MutexSemaphore::new(MutexKey::new("m"));
        sem.enqueue(id(1));
        sem.enqueue(id(2));
        sem.enqueue(id(3));

        // Cancelling a queued (not holding) competitor removes it.
        sem.release(id(2));
        sem.release(id(1));
        assert!(sem.is_permit_owner(id(3)));
    }
}
