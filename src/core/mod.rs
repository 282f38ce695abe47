//! Scheduler core: manager, futures, mutual exclusion, blocking conditions,
//! contexts, events and filters.

pub mod condition;
pub mod context;
pub mod error;
pub mod events;
pub mod filter;
pub mod future;
pub mod input;
pub mod manager;
pub mod policy;
pub mod semaphore;
pub mod session;

pub use condition::BlockingCondition;
pub use context::{ChainStep, ContextChain, ContextDecorator, JobContext, RunContext};
pub use error::JobError;
pub use events::{DeliveryMode, JobEvent, JobEventType, ListenerHandle};
pub use filter::{FutureFilter, FutureFilterBuilder, JobEventFilter};
pub use future::{AnyFuture, Cancellation, JobFuture, JobId, JobState};
pub use input::JobInput;
pub use manager::JobManager;
pub use policy::{
    ClientJobManager, ClientPolicy, DefaultPolicy, ModelJobManager, ModelPolicy, SchedulingPolicy,
};
pub use semaphore::{MutexKey, MutexSemaphore};
pub use session::Session;
