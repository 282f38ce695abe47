//! Fluent construction of job managers.

use std::sync::Arc;

use crate::config::JobManagerConfig;
use crate::core::error::JobError;
use crate::core::manager::JobManager;
use crate::core::policy::{ClientPolicy, DefaultPolicy, ModelPolicy, SchedulingPolicy};

/// Builder for a [`JobManager`].
///
/// ```no_run
/// use session_jobs::{JobManagerBuilder, JobManagerConfig};
///
/// let manager = JobManagerBuilder::new()
///     .with_config(JobManagerConfig::new().with_worker_count(4))
///     .build()
///     .unwrap();
/// # manager.shutdown();
/// ```
pub struct JobManagerBuilder {
    config: JobManagerConfig,
    policy: Arc<dyn SchedulingPolicy>,
}

impl JobManagerBuilder {
    /// Start with the default configuration and policy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: JobManagerConfig::default(),
            policy: Arc::new(DefaultPolicy),
        }
    }

    /// Use the given configuration.
    #[must_use]
    pub fn with_config(mut self, config: JobManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use the given scheduling policy.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn SchedulingPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Shortcut for [`ClientPolicy`].
    #[must_use]
    pub fn client(self) -> Self {
        self.with_policy(Arc::new(ClientPolicy))
    }

    /// Shortcut for [`ModelPolicy`].
    #[must_use]
    pub fn model(self) -> Self {
        self.with_policy(Arc::new(ModelPolicy))
    }

    /// Validate the configuration and start the manager.
    ///
    /// # Errors
    ///
    /// [`JobError::Assertion`] for an invalid configuration, or a worker
    /// spawn failure.
    pub fn build(self) -> Result<JobManager, JobError> {
        JobManager::with_policy(self.config, self.policy)
    }
}

impl Default for JobManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JobManagerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManagerBuilder")
            .field("policy", &self.policy.name())
            .finish_non_exhaustive()
    }
}
