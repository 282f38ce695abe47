//! Scheduling policies: pluggable validation and context-chain strategies.
//!
//! The behavioral differences between plain jobs, client jobs and model
//! jobs are small (input validation, implicit mutex selection, who may call
//! `run_now`), so they are expressed as strategy values rather than
//! manager subclasses. [`ClientJobManager`] and [`ModelJobManager`] are
//! thin convenience wrappers that pre-select the matching policy.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::config::JobManagerConfig;
use crate::core::context::ContextChain;
use crate::core::error::JobError;
use crate::core::input::JobInput;
use crate::core::manager::JobManager;
use crate::core::session::Session;

/// Strategy hooks a manager consults when accepting and running jobs.
pub trait SchedulingPolicy: Send + Sync + 'static {
    /// Short diagnostic name, used in log fields.
    fn name(&self) -> &'static str;

    /// Validate and normalize the input before a future is created.
    ///
    /// # Errors
    ///
    /// [`JobError::Assertion`] when the input violates the policy's
    /// preconditions; no future exists at that point.
    fn prepare(&self, input: JobInput) -> Result<JobInput, JobError>;

    /// Additional precondition for inline execution.
    ///
    /// # Errors
    ///
    /// [`JobError::Assertion`] when the calling thread may not run the job
    /// inline.
    fn validate_run_now(&self, input: &JobInput, manager: &JobManager) -> Result<(), JobError> {
        let _ = (input, manager);
        Ok(())
    }

    /// The context chain to wrap around this job's work.
    fn context_chain(&self, input: &JobInput) -> ContextChain {
        let _ = input;
        ContextChain::standard()
    }
}

impl fmt::Debug for dyn SchedulingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// No additional constraints; jobs run with whatever input they were given.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPolicy;

impl SchedulingPolicy for DefaultPolicy {
    fn name(&self) -> &'static str {
        "default"
    }

    fn prepare(&self, input: JobInput) -> Result<JobInput, JobError> {
        Ok(input)
    }
}

/// Client jobs: require a session as execution context, impose no mutex.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientPolicy;

impl SchedulingPolicy for ClientPolicy {
    fn name(&self) -> &'static str {
        "client"
    }

    fn prepare(&self, input: JobInput) -> Result<JobInput, JobError> {
        if input.session().is_none() {
            return Err(JobError::Assertion(format!(
                "client job '{}' requires a session on its input",
                input.name()
            )));
        }
        Ok(input)
    }
}

/// Model jobs: serialized per session on the session's model mutex.
///
/// The mutex is derived from the session; an explicit mutex on the input is
/// accepted only if it is exactly the session's model mutex.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModelPolicy;

impl SchedulingPolicy for ModelPolicy {
    fn name(&self) -> &'static str {
        "model"
    }

    fn prepare(&self, input: JobInput) -> Result<JobInput, JobError> {
        let Some(session) = input.session().cloned() else {
            return Err(JobError::Assertion(format!(
                "model job '{}' requires a session on its input",
                input.name()
            )));
        };
        let model_mutex = session.model_job_mutex();
        if let Some(mutex) = input.mutex() {
            if *mutex != model_mutex {
                return Err(JobError::Assertion(format!(
                    "model job '{}' must compete on the model mutex of session '{}', not on '{}'",
                    input.name(),
                    session.name(),
                    mutex.name()
                )));
            }
        }
        Ok(input.replace_mutex(model_mutex))
    }

    fn validate_run_now(&self, input: &JobInput, manager: &JobManager) -> Result<(), JobError> {
        // prepare() ran first, so the session and mutex are present.
        let Some(session) = input.session() else {
            return Err(JobError::Assertion(format!(
                "model job '{}' requires a session on its input",
                input.name()
            )));
        };
        if !manager.current_thread_holds(&session.model_job_mutex()) {
            return Err(JobError::Assertion(format!(
                "inline model job '{}' must be invoked from the model thread of session '{}'",
                input.name(),
                session.name()
            )));
        }
        Ok(())
    }
}

/// A manager pre-configured with [`ClientPolicy`].
#[derive(Debug, Clone)]
pub struct ClientJobManager {
    inner: JobManager,
}

impl ClientJobManager {
    /// Create a client job manager.
    ///
    /// # Errors
    ///
    /// [`JobError::Assertion`] if the configuration is invalid, or a
    /// failure spawning the worker threads.
    pub fn new(config: JobManagerConfig) -> Result<Self, JobError> {
        Ok(Self {
            inner: JobManager::with_policy(config, Arc::new(ClientPolicy))?,
        })
    }
}

impl Deref for ClientJobManager {
    type Target = JobManager;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// A manager pre-configured with [`ModelPolicy`].
#[derive(Debug, Clone)]
pub struct ModelJobManager {
    inner: JobManager,
}

impl ModelJobManager {
    /// Create a model job manager.
    ///
    /// # Errors
    ///
    /// [`JobError::Assertion`] if the configuration is invalid, or a
    /// failure spawning the worker threads.
    pub fn new(config: JobManagerConfig) -> Result<Self, JobError> {
        Ok(Self {
            inner: JobManager::with_policy(config, Arc::new(ModelPolicy))?,
        })
    }

    /// `true` if the calling thread currently holds the model mutex of the
    /// given session, i.e. is that session's model thread.
    #[must_use]
    pub fn is_model_thread(&self, session: &Session) -> bool {
        self.inner.current_thread_holds(&session.model_job_mutex())
    }
}

impl Deref for ModelJobManager {
    type Target = JobManager;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::semaphore::MutexKey;

    #[test]
    fn test_model_policy_forces_session_mutex() {
        let session = Session::new("s");
        let input = JobInput::new("j").with_session(Arc::clone(&session));
        let prepared = ModelPolicy.prepare(input).unwrap();
        assert_eq!(prepared.mutex(), Some(&session.model_job_mutex()));
    }

    #[test]
    fn test_model_policy_rejects_foreign_mutex() {
        let session = Session::new("s");
        let input = JobInput::new("j")
            .with_session(session)
            .with_mutex(MutexKey::new("other"));
        let err = ModelPolicy.prepare(input).unwrap_err();
        assert!(matches!(err, JobError::Assertion(_)));
    }

    #[test]
    fn test_model_policy_requires_session() {
        let err = ModelPolicy.prepare(JobInput::new("j")).unwrap_err();
        assert!(matches!(err, JobError::Assertion(_)));
        let err = ClientPolicy.prepare(JobInput::new("j")).unwrap_err();
        assert!(matches!(err, JobError::Assertion(_)));
    }
}
