//! Job manager configuration.

use serde::{Deserialize, Serialize};

fn default_worker_count() -> usize {
    num_cpus::get().max(8)
}

fn default_max_queue_depth() -> usize {
    512
}

fn default_thread_stack_size() -> usize {
    2 * 1024 * 1024
}

fn default_thread_name_prefix() -> String {
    "sj-worker".to_owned()
}

/// Sizing and naming of a manager's worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobManagerConfig {
    /// Number of worker threads.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Maximum queued tasks before submissions are rejected.
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    /// Stack size per worker thread, in bytes.
    #[serde(default = "default_thread_stack_size")]
    pub thread_stack_size: usize,
    /// Worker thread name prefix; threads are named `{prefix}-{index}`.
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            max_queue_depth: default_max_queue_depth(),
            thread_stack_size: default_thread_stack_size(),
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

impl JobManagerConfig {
    /// Configuration with defaults (worker count sized from the CPU count).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    #[must_use]
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Set the maximum queued tasks before rejection.
    #[must_use]
    pub fn with_max_queue_depth(mut self, max_queue_depth: usize) -> Self {
        self.max_queue_depth = max_queue_depth;
        self
    }

    /// Set the per-worker stack size in bytes.
    #[must_use]
    pub fn with_thread_stack_size(mut self, thread_stack_size: usize) -> Self {
        self.thread_stack_size = thread_stack_size;
        self
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// A human-readable description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        if self.thread_name_prefix.is_empty() {
            return Err("thread_name_prefix must not be empty".into());
        }
        Ok(())
    }

    /// Parse a configuration from a JSON string and validate it.
    ///
    /// # Errors
    ///
    /// A parse error or the first validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let config: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = JobManagerConfig::new();
        assert!(config.validate().is_ok());
        assert!(config.worker_count >= 8);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = JobManagerConfig::new().with_worker_count(0);
        assert!(config.validate().unwrap_err().contains("worker_count"));
    }

    #[test]
    fn test_validate_rejects_tiny_stack() {
        let config = JobManagerConfig::new().with_thread_stack_size(1024);
        assert!(config.validate().unwrap_err().contains("thread_stack_size"));
    }

    #[test]
    fn test_from_json_str_applies_defaults() {
        let config = JobManagerConfig::from_json_str(r#"{"worker_count": 2}"#).unwrap();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.max_queue_depth, 512);
        assert_eq!(config.thread_name_prefix, "sj-worker");
    }

    #[test]
    fn test_from_json_str_rejects_invalid() {
        assert!(JobManagerConfig::from_json_str(r#"{"worker_count": 0}"#).is_err());
        assert!(JobManagerConfig::from_json_str("not json").is_err());
    }
}
