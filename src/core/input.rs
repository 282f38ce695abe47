//! Job input: the instruction sheet a job is scheduled with.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::core::context::RunContext;
use crate::core::semaphore::MutexKey;
use crate::core::session::Session;

/// Describes how a single job is to be executed.
///
/// Built once, handed to the manager at scheduling time and immutable
/// afterwards (execution hints become mutable on the future, not here).
///
/// ```
/// use session_jobs::{JobInput, MutexKey};
/// use std::time::Duration;
///
/// let mutex = MutexKey::new("report-mutex");
/// let input = JobInput::new("nightly-report")
///     .with_mutex(mutex)
///     .with_expiration(Duration::from_secs(30))
///     .with_execution_hint("reporting");
/// assert_eq!(input.name(), "nightly-report");
/// ```
#[derive(Debug, Clone)]
pub struct JobInput {
    name: String,
    mutex: Option<MutexKey>,
    session: Option<Arc<Session>>,
    hints: HashSet<String>,
    expiration: Option<Duration>,
    log_on_error: bool,
    context: RunContext,
}

impl JobInput {
    /// Create an input with the given diagnostic job name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mutex: None,
            session: None,
            hints: HashSet::new(),
            expiration: None,
            log_on_error: true,
            context: RunContext::default(),
        }
    }

    /// Compete on the given mutex key: at most the key's capacity of jobs
    /// with this key run at any instant.
    #[must_use]
    pub fn with_mutex(mut self, mutex: MutexKey) -> Self {
        self.mutex = Some(mutex);
        self
    }

    /// Associate a session. Model-job policies derive the mutex from it.
    #[must_use]
    pub fn with_session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    /// Tag the job with an execution hint, queryable through filters.
    #[must_use]
    pub fn with_execution_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.insert(hint.into());
        self
    }

    /// Cancel the job if it could not start its work within `ttl` of being
    /// scheduled. Without an expiration the job waits indefinitely.
    #[must_use]
    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    /// Whether an uncaught failure is logged by the worker (default: true).
    #[must_use]
    pub fn with_log_on_error(mut self, log_on_error: bool) -> Self {
        self.log_on_error = log_on_error;
        self
    }

    /// Ambient values (subject, locale, texts, properties) installed for
    /// the job by the context chain.
    #[must_use]
    pub fn with_context(mut self, context: RunContext) -> Self {
        self.context = context;
        self
    }

    /// Diagnostic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The mutex key this job competes on, if any.
    #[must_use]
    pub fn mutex(&self) -> Option<&MutexKey> {
        self.mutex.as_ref()
    }

    /// The associated session, if any.
    #[must_use]
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    /// Execution hints the job starts with.
    #[must_use]
    pub fn execution_hints(&self) -> &HashSet<String> {
        &self.hints
    }

    /// Time-to-start budget, if any.
    #[must_use]
    pub fn expiration(&self) -> Option<Duration> {
        self.expiration
    }

    /// Whether uncaught failures are logged by the worker.
    #[must_use]
    pub fn log_on_error(&self) -> bool {
        self.log_on_error
    }

    /// The ambient run context.
    #[must_use]
    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub(crate) fn replace_mutex(mut self, mutex: MutexKey) -> Self {
        self.mutex = Some(mutex);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let input = JobInput::new("j");
        assert_eq!(input.name(), "j");
        assert!(input.mutex().is_none());
        assert!(input.session().is_none());
        assert!(input.execution_hints().is_empty());
        assert!(input.expiration().is_none());
        assert!(input.log_on_error());
    }

    #[test]
    fn test_builder_accumulates() {
        let mutex = MutexKey::new("m");
        let input = JobInput::new("j")
            .with_mutex(mutex.clone())
            .with_execution_hint("a")
            .with_execution_hint("b")
            .with_expiration(Duration::from_secs(1))
            .with_log_on_error(false);
        assert_eq!(input.mutex(), Some(&mutex));
        assert_eq!(input.execution_hints().len(), 2);
        assert_eq!(input.expiration(), Some(Duration::from_secs(1)));
        assert!(!input.log_on_error());
    }
}
