//! Execution contexts and the decorator chain wrapped around user work.
//!
//! Instead of ambient thread-local state, every job receives an explicit
//! [`JobContext`] carrying its future handle, the owning manager and the
//! ambient values ([`RunContext`]) its input asked for. The
//! [`ContextChain`] decides which ambient values get installed and wraps
//! the work in panic translation and a diagnostic tracing span.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::warn;

use crate::core::error::JobError;
use crate::core::future::{AnyFuture, Cancellation};
use crate::core::input::JobInput;
use crate::core::manager::JobManager;
use crate::core::session::Session;

/// Ambient values available to running work.
///
/// A job's input carries the source values; the context chain copies the
/// ones it is configured to install into the job's [`JobContext`].
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    subject: Option<String>,
    locale: Option<String>,
    user_agent: Option<String>,
    session: Option<Arc<Session>>,
    texts: Option<Arc<HashMap<String, String>>>,
    properties: HashMap<String, String>,
}

impl RunContext {
    /// Empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The principal on whose behalf the job runs.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Language tag for text resolution.
    #[must_use]
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    /// User-agent string of the originating client.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Localized text table.
    #[must_use]
    pub fn with_texts(mut self, texts: Arc<HashMap<String, String>>) -> Self {
        self.texts = Some(texts);
        self
    }

    /// A job-local key/value property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// The installed subject, if any.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// The installed locale, if any.
    #[must_use]
    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    /// The installed user agent, if any.
    #[must_use]
    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    /// The installed session, if any.
    #[must_use]
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    /// Resolve a localized text by key.
    #[must_use]
    pub fn text(&self, key: &str) -> Option<&str> {
        self.texts.as_ref().and_then(|t| t.get(key)).map(String::as_str)
    }

    /// Look up a job-local property.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// All job-local properties.
    #[must_use]
    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }
}

/// A user-supplied chain step.
pub trait ContextDecorator: Send + Sync {
    /// Install additional ambient values before the work runs.
    fn decorate(&self, run: &mut RunContext, input: &JobInput);
}

/// One step of the context chain.
#[derive(Clone)]
pub enum ChainStep {
    /// Catch panics and translate every failure into a [`JobError`]
    /// (outermost catch-all).
    TranslateExceptions,
    /// Enter a tracing span carrying the job name, so every log line of the
    /// work identifies its job.
    DecorateThreadName,
    /// Install the subject from the input's run context.
    InstallSubject,
    /// Install the job-local property map.
    InstallJobProperties,
    /// Install the locale.
    InstallLocale,
    /// Install the session.
    InstallSession,
    /// Install the user agent.
    InstallUserAgent,
    /// Install the localized text table.
    InstallTexts,
    /// A user-supplied decorator.
    Custom(Arc<dyn ContextDecorator>),
}

impl fmt::Debug for ChainStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TranslateExceptions => "TranslateExceptions",
            Self::DecorateThreadName => "DecorateThreadName",
            Self::InstallSubject => "InstallSubject",
            Self::InstallJobProperties => "InstallJobProperties",
            Self::InstallLocale => "InstallLocale",
            Self::InstallSession => "InstallSession",
            Self::InstallUserAgent => "InstallUserAgent",
            Self::InstallTexts => "InstallTexts",
            Self::Custom(_) => "Custom",
        };
        f.write_str(name)
    }
}

/// Ordered list of decorators wrapped around user work.
///
/// The standard chain keeps exception translation outermost so that no
/// panic or error can escape a worker thread undecorated. Policies may add
/// steps but the relative order of the standard steps is fixed.
#[derive(Debug, Clone)]
pub struct ContextChain {
    steps: Vec<ChainStep>,
}

impl ContextChain {
    /// The standard chain: translate-exceptions, decorate-thread-name, then
    /// the install steps, then the work.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            steps: vec![
                ChainStep::TranslateExceptions,
                ChainStep::DecorateThreadName,
                ChainStep::InstallSubject,
                ChainStep::InstallJobProperties,
                ChainStep::InstallLocale,
                ChainStep::InstallSession,
                ChainStep::InstallUserAgent,
                ChainStep::InstallTexts,
            ],
        }
    }

    /// An empty chain (work runs with no installed values and no panic
    /// translation; intended for tests).
    #[must_use]
    pub fn empty() -> Self {
        Self { steps: Vec::new() }
    }

    /// Append a step after all existing steps (closest to the work).
    #[must_use]
    pub fn with_step(mut self, step: ChainStep) -> Self {
        self.steps.push(step);
        self
    }

    /// The configured steps, outermost first.
    #[must_use]
    pub fn steps(&self) -> &[ChainStep] {
        &self.steps
    }

    /// Run `work` inside this chain.
    ///
    /// Install steps populate `ctx.run` from `input`; the translate step
    /// converts panics and work errors into [`JobError::Failed`].
    pub(crate) fn invoke<T>(
        &self,
        ctx: &mut JobContext,
        input: &JobInput,
        work: Box<dyn FnOnce(&JobContext) -> anyhow::Result<T> + Send + '_>,
    ) -> Result<T, JobError> {
        let mut translate = false;
        let mut span = false;
        for step in &self.steps {
            match step {
                ChainStep::TranslateExceptions => translate = true,
                ChainStep::DecorateThreadName => span = true,
                ChainStep::InstallSubject => {
                    ctx.run.subject = input.context().subject.clone();
                }
                ChainStep::InstallJobProperties => {
                    ctx.run.properties = input.context().properties.clone();
                }
                ChainStep::InstallLocale => {
                    ctx.run.locale = input.context().locale.clone();
                }
                ChainStep::InstallSession => {
                    ctx.run.session = input.session().cloned();
                }
                ChainStep::InstallUserAgent => {
                    ctx.run.user_agent = input.context().user_agent.clone();
                }
                ChainStep::InstallTexts => {
                    ctx.run.texts = input.context().texts.clone();
                }
                ChainStep::Custom(decorator) => decorator.decorate(&mut ctx.run, input),
            }
        }

        let run_work = move |ctx: &JobContext| -> Result<T, JobError> {
            let _span = span.then(|| {
                tracing::info_span!("job", name = %input.name(), id = %ctx.future().id()).entered()
            });
            work(ctx).map_err(|err| match err.downcast::<JobError>() {
                // A scheduler failure propagated through the work keeps its
                // identity (cancellation, interruption, timeout).
                Ok(job_err) => job_err,
                Err(other) => JobError::failed(other),
            })
        };

        let result = if translate {
            match panic::catch_unwind(AssertUnwindSafe(|| run_work(ctx))) {
                Ok(result) => result,
                Err(payload) => Err(JobError::failed(anyhow::anyhow!(
                    "job panicked: {}",
                    panic_message(&payload)
                ))),
            }
        } else {
            run_work(ctx)
        };

        if let Err(err) = &result {
            if translate && input.log_on_error() && !err.is_cancellation() {
                warn!(job = %input.name(), error = %err, "job work failed");
            }
        }
        result
    }
}

impl Default for ContextChain {
    fn default() -> Self {
        Self::standard()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Execution context handed to running work.
///
/// Carries the job's own future (for cooperative cancellation checks), the
/// owning manager (for scheduling follow-up work) and the installed ambient
/// values.
pub struct JobContext {
    future: Arc<dyn AnyFuture>,
    manager: JobManager,
    pub(crate) run: RunContext,
}

impl JobContext {
    pub(crate) fn new(future: Arc<dyn AnyFuture>, manager: JobManager) -> Self {
        Self {
            future,
            manager,
            run: RunContext::default(),
        }
    }

    /// The future of the job this context belongs to.
    #[must_use]
    pub fn future(&self) -> &Arc<dyn AnyFuture> {
        &self.future
    }

    /// The manager that runs this job.
    #[must_use]
    pub fn manager(&self) -> &JobManager {
        &self.manager
    }

    /// Cooperative cancellation check; long-running work should poll this
    /// and stop when it answers `true`.
    #[must_use]
    pub fn is_cancellation_requested(&self) -> bool {
        self.future.cancellation().is_some()
    }

    /// The recorded cancellation, if any.
    #[must_use]
    pub fn cancellation(&self) -> Option<Cancellation> {
        self.future.cancellation()
    }

    /// The installed session, if any.
    #[must_use]
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.run.session()
    }

    /// The installed subject, if any.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.run.subject()
    }

    /// The installed locale, if any.
    #[must_use]
    pub fn locale(&self) -> Option<&str> {
        self.run.locale()
    }

    /// The installed user agent, if any.
    #[must_use]
    pub fn user_agent(&self) -> Option<&str> {
        self.run.user_agent()
    }

    /// Resolve a localized text by key.
    #[must_use]
    pub fn text(&self, key: &str) -> Option<&str> {
        self.run.text(key)
    }

    /// Look up a job-local property.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.run.property(key)
    }

    /// The full installed run context.
    #[must_use]
    pub fn run_context(&self) -> &RunContext {
        &self.run
    }

    /// Run a nested unit of work inline on the current thread.
    ///
    /// If the nested input competes on the mutex this job already holds, the
    /// nested unit executes on behalf of this job and is not independently
    /// cancellable; cancelling this job cancels the whole nesting.
    ///
    /// # Errors
    ///
    /// As [`JobManager::run_now`].
    pub fn run_now<T, F>(&self, input: JobInput, work: F) -> Result<T, JobError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(&JobContext) -> anyhow::Result<T> + Send + 'static,
    {
        self.manager.run_now(input, work)
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job", &self.future.id())
            .finish_non_exhaustive()
    }
}
