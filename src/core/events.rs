//! Job lifecycle events and the listener bus.
//!
//! Listeners register against a copy-on-write snapshot list; firing an
//! event never blocks on listener registration. Asynchronous delivery goes
//! through a single dispatcher thread fed by a channel, which gives every
//! listener a consistent per-listener publication order. Synchronous
//! listeners run inline on the thread that caused the event.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::filter::JobEventFilter;
use crate::core::future::AnyFuture;
use crate::util::clock;

/// Lifecycle transitions published by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventType {
    /// A future was accepted.
    Scheduled,
    /// A job acquired its permit (if any) and is about to execute.
    AboutToRun,
    /// A job parked on a blocking condition.
    Blocked,
    /// A job resumed from a blocking condition.
    Unblocked,
    /// A future completed.
    Done,
    /// The manager shut down. Carries no future; always delivered
    /// synchronously on the shutdown-calling thread.
    Shutdown,
}

/// How a listener wants events delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// On the dispatcher thread, in per-listener publication order.
    Async,
    /// Inline on the thread that caused the event.
    Sync,
}

/// One published lifecycle event.
#[derive(Clone)]
pub struct JobEvent {
    /// What happened.
    pub event_type: JobEventType,
    /// The affected future; `None` only for [`JobEventType::Shutdown`].
    pub future: Option<Arc<dyn AnyFuture>>,
    /// Wall-clock publication time, milliseconds since the Unix epoch.
    pub at_ms: u128,
}

impl JobEvent {
    pub(crate) fn new(event_type: JobEventType, future: Option<Arc<dyn AnyFuture>>) -> Self {
        Self {
            event_type,
            future,
            at_ms: clock::now_ms(),
        }
    }
}

impl fmt::Debug for JobEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobEvent")
            .field("event_type", &self.event_type)
            .field("job", &self.future.as_ref().map(|f| f.id()))
            .field("at_ms", &self.at_ms)
            .finish()
    }
}

type ListenerFn = dyn Fn(&JobEvent) + Send + Sync;

struct ListenerEntry {
    id: u64,
    filter: Option<JobEventFilter>,
    mode: DeliveryMode,
    callback: Box<ListenerFn>,
}

impl ListenerEntry {
    fn accepts(&self, event: &JobEvent) -> bool {
        self.filter.as_ref().map_or(true, |f| f.accept(event))
    }
}

struct BusInner {
    listeners: RwLock<Vec<Arc<ListenerEntry>>>,
    sender: Mutex<Option<Sender<JobEvent>>>,
    next_id: AtomicU64,
}

/// Disposer for one registered listener.
///
/// Dropping the handle does *not* unregister the listener; call
/// [`dispose`](Self::dispose) explicitly.
pub struct ListenerHandle {
    id: u64,
    bus: Weak<BusInner>,
}

impl ListenerHandle {
    /// Unregister the listener. Idempotent.
    pub fn dispose(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.listeners.write().retain(|entry| entry.id != self.id);
        }
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle").field("id", &self.id).finish()
    }
}

/// The manager's event bus.
pub(crate) struct JobEventBus {
    inner: Arc<BusInner>,
}

impl JobEventBus {
    /// Start the bus and its dispatcher thread.
    pub(crate) fn start() -> Self {
        let (tx, rx) = unbounded::<JobEvent>();
        let inner = Arc::new(BusInner {
            listeners: RwLock::new(Vec::new()),
            sender: Mutex::new(Some(tx)),
            next_id: AtomicU64::new(1),
        });

        let dispatcher_inner = Arc::clone(&inner);
        let spawned = thread::Builder::new()
            .name("sj-events".to_owned())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    let snapshot = dispatcher_inner.listeners.read().clone();
                    for entry in &snapshot {
                        if entry.mode == DeliveryMode::Async && entry.accepts(&event) {
                            (entry.callback)(&event);
                        }
                    }
                }
                debug!("event dispatcher stopped");
            });
        if let Err(err) = spawned {
            warn!(error = %err, "failed to spawn event dispatcher; async listeners disabled");
            *inner.sender.lock() = None;
        }

        Self { inner }
    }

    pub(crate) fn add_listener(
        &self,
        filter: Option<JobEventFilter>,
        mode: DeliveryMode,
        callback: Box<ListenerFn>,
    ) -> ListenerHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.write().push(Arc::new(ListenerEntry {
            id,
            filter,
            mode,
            callback,
        }));
        ListenerHandle {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Publish an event: synchronous listeners inline, asynchronous ones via
    /// the dispatcher thread.
    pub(crate) fn fire(&self, event: JobEvent) {
        let snapshot = self.inner.listeners.read().clone();
        let mut needs_dispatch = false;
        for entry in &snapshot {
            match entry.mode {
                DeliveryMode::Sync => {
                    if entry.accepts(&event) {
                        (entry.callback)(&event);
                    }
                }
                DeliveryMode::Async => needs_dispatch = true,
            }
        }
        if needs_dispatch {
            if let Some(sender) = self.inner.sender.lock().as_ref() {
                // Dispatcher gone means shutdown already ran; drop silently.
                let _ = sender.send(event);
            }
        }
    }

    /// Deliver an event synchronously to every matching listener, regardless
    /// of its preferred mode. Used for the shutdown event.
    pub(crate) fn fire_sync_to_all(&self, event: &JobEvent) {
        let snapshot = self.inner.listeners.read().clone();
        for entry in &snapshot {
            if entry.accepts(event) {
                (entry.callback)(event);
            }
        }
    }

    /// Stop the dispatcher thread once its queue drains.
    pub(crate) fn shutdown(&self) {
        *self.inner.sender.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_sync_listener_runs_inline() {
        let bus = JobEventBus::start();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        bus.add_listener(
            None,
            DeliveryMode::Sync,
            Box::new(move |_| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bus.fire(JobEvent::new(JobEventType::Shutdown, None));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        bus.shutdown();
    }

    #[test]
    fn test_async_listener_sees_publication_order() {
        let bus = JobEventBus::start();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        bus.add_listener(
            None,
            DeliveryMode::Async,
            Box::new(move |event| {
                seen2.lock().push(event.event_type);
            }),
        );
        bus.fire(JobEvent::new(JobEventType::Scheduled, None));
        bus.fire(JobEvent::new(JobEventType::Done, None));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while seen.lock().len() < 2 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*seen.lock(), vec![JobEventType::Scheduled, JobEventType::Done]);
        bus.shutdown();
    }

    #[test]
    fn test_disposed_listener_stops_receiving() {
        let bus = JobEventBus::start();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let handle = bus.add_listener(
            None,
            DeliveryMode::Sync,
            Box::new(move |_| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bus.fire(JobEvent::new(JobEventType::Scheduled, None));
        handle.dispose();
        handle.dispose();
        bus.fire(JobEvent::new(JobEventType::Scheduled, None));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        bus.shutdown();
    }
}
