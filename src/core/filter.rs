//! Composable filters over futures and job events.

use uuid::Uuid;

use crate::core::events::{JobEvent, JobEventType};
use crate::core::future::{AnyFuture, JobId};
use crate::core::semaphore::MutexKey;
use crate::core::session::Session;

/// A predicate tree over live futures.
///
/// Used by [`cancel`](crate::JobManager::cancel),
/// [`visit`](crate::JobManager::visit) and
/// [`await_done`](crate::JobManager::await_done) to select the futures an
/// operation applies to.
#[derive(Debug, Clone)]
pub enum FutureFilter {
    /// Matches every future.
    Any,
    /// Matches the future with the given id.
    Id(JobId),
    /// Matches futures scheduled under the given job name.
    Name(String),
    /// Matches futures competing on the given mutex key.
    Mutex(MutexKey),
    /// Matches futures associated with the given session.
    Session(Uuid),
    /// Matches futures currently carrying the given execution hint.
    Hint(String),
    /// Negates the inner filter.
    Not(Box<FutureFilter>),
    /// Matches when every inner filter matches (empty: matches all).
    AllOf(Vec<FutureFilter>),
    /// Matches when at least one inner filter matches (empty: matches none).
    AnyOf(Vec<FutureFilter>),
}

impl FutureFilter {
    /// Evaluate this filter against a future.
    #[must_use]
    pub fn accept(&self, future: &dyn AnyFuture) -> bool {
        match self {
            Self::Any => true,
            Self::Id(id) => future.id() == *id,
            Self::Name(name) => future.input().name() == name,
            Self::Mutex(key) => future.input().mutex() == Some(key),
            Self::Session(id) => future
                .input()
                .session()
                .map_or(false, |session| session.id() == *id),
            Self::Hint(hint) => future.contains_execution_hint(hint),
            Self::Not(inner) => !inner.accept(future),
            Self::AllOf(inner) => inner.iter().all(|f| f.accept(future)),
            Self::AnyOf(inner) => inner.iter().any(|f| f.accept(future)),
        }
    }

    /// Filter matching futures of the given session.
    #[must_use]
    pub fn session(session: &Session) -> Self {
        Self::Session(session.id())
    }
}

/// Conjunctive builder for [`FutureFilter`] trees.
///
/// ```
/// use session_jobs::FutureFilterBuilder;
///
/// let filter = FutureFilterBuilder::new()
///     .and_match_name("sync")
///     .and_match_hint("background")
///     .build();
/// ```
#[derive(Debug, Default)]
pub struct FutureFilterBuilder {
    terms: Vec<FutureFilter>,
}

impl FutureFilterBuilder {
    /// Start with an always-matching filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require an arbitrary filter term.
    #[must_use]
    pub fn and_match(mut self, filter: FutureFilter) -> Self {
        self.terms.push(filter);
        self
    }

    /// Require the complement of a filter term.
    #[must_use]
    pub fn and_match_not(self, filter: FutureFilter) -> Self {
        self.and_match(FutureFilter::Not(Box::new(filter)))
    }

    /// Require a specific job id.
    #[must_use]
    pub fn and_match_id(self, id: JobId) -> Self {
        self.and_match(FutureFilter::Id(id))
    }

    /// Require a specific job name.
    #[must_use]
    pub fn and_match_name(self, name: impl Into<String>) -> Self {
        self.and_match(FutureFilter::Name(name.into()))
    }

    /// Require a specific mutex key.
    #[must_use]
    pub fn and_match_mutex(self, mutex: MutexKey) -> Self {
        self.and_match(FutureFilter::Mutex(mutex))
    }

    /// Require association with a specific session.
    #[must_use]
    pub fn and_match_session(self, session: &Session) -> Self {
        self.and_match(FutureFilter::Session(session.id()))
    }

    /// Require a specific execution hint.
    #[must_use]
    pub fn and_match_hint(self, hint: impl Into<String>) -> Self {
        self.and_match(FutureFilter::Hint(hint.into()))
    }

    /// Assemble the filter. No terms yields [`FutureFilter::Any`].
    #[must_use]
    pub fn build(mut self) -> FutureFilter {
        match self.terms.len() {
            0 => FutureFilter::Any,
            1 => self.terms.remove(0),
            _ => FutureFilter::AllOf(self.terms),
        }
    }
}

/// Filter over published job events.
#[derive(Debug, Clone, Default)]
pub struct JobEventFilter {
    types: Vec<JobEventType>,
    future: Option<FutureFilter>,
}

impl JobEventFilter {
    /// Matches every event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the given event types (empty: all types).
    #[must_use]
    pub fn with_types(mut self, types: impl IntoIterator<Item = JobEventType>) -> Self {
        self.types = types.into_iter().collect();
        self
    }

    /// Restrict to events whose future matches the given filter. Events
    /// without a future (shutdown) pass any future filter.
    #[must_use]
    pub fn with_future_filter(mut self, filter: FutureFilter) -> Self {
        self.future = Some(filter);
        self
    }

    /// Evaluate this filter against an event.
    #[must_use]
    pub fn accept(&self, event: &JobEvent) -> bool {
        if !self.types.is_empty() && !self.types.contains(&event.event_type) {
            return false;
        }
        match (&self.future, &event.future) {
            (Some(filter), Some(future)) => filter.accept(future.as_ref()),
            _ => true,
        }
    }
}
