//! Telemetry helpers for structured logging.

use tracing_subscriber::EnvFilter;

/// Install a default `tracing` subscriber unless one is already set.
///
/// Honors `RUST_LOG`; without it, scheduler internals log at `info` and
/// everything else at `warn`. Applications embedding the scheduler
/// typically install their own subscriber before creating a manager, in
/// which case this is a no-op. Idempotent, safe to call from every test.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,session_jobs=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
