use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;

/// Recognized pool configuration options.
///
/// Plain, `serde`-serializable data with a synchronous [`validate`](Self::validate)
/// step — no environment variables, no file parsing, no CLI. A host
/// application builds this with ordinary Rust and hands it to
/// [`crate::pool::WorkerPool::start`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    pub min_pool_size: usize,
    pub max_pool_size: usize,

    /// Opaque string passed to the worker unchanged.
    pub implementation_locator: String,
    /// Entry-point identifier passed to the worker unchanged.
    pub implementation_type_name: String,

    pub max_memory_mb: u64,
    pub max_gdi_handles: u64,
    pub max_user_handles: u64,
    pub max_total_handles: u64,

    /// `0` disables the call-count recycle ceiling.
    pub process_recycle_threshold: u64,

    #[serde(with = "duration_millis")]
    pub max_process_lifetime: Duration,
    #[serde(with = "duration_millis")]
    pub method_call_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub process_start_timeout: Duration,

    /// 1-in-N rate for running the recycle predicate.
    pub recycle_check_calls: u64,

    pub verbose_worker_logging: bool,

    /// Concurrent spawns during initialization (default 3).
    pub startup_concurrency: usize,
    /// Bound on `acquire()` retries before `PoolExhausted` (default 10).
    pub max_acquire_attempts: u32,
    /// Bound on transparent retry-on-fresh-worker after a startup-race
    /// flake (default 10).
    pub max_retry_attempts: u32,

    /// Path to the worker-host executable this pool spawns. Not part of the
    /// original option table (which assumes the worker binary is a given);
    /// a Rust embedding needs it explicitly since there is no shared
    /// runtime to resolve "the current assembly" from.
    pub worker_executable: PathBuf,
    pub worker_extra_args: Vec<String>,
}

impl WorkerPoolConfig {
    pub fn new(
        implementation_locator: impl Into<String>,
        implementation_type_name: impl Into<String>,
        worker_executable: impl Into<PathBuf>,
    ) -> Self {
        Self {
            min_pool_size: 1,
            max_pool_size: 5,
            implementation_locator: implementation_locator.into(),
            implementation_type_name: implementation_type_name.into(),
            max_memory_mb: 1024,
            max_gdi_handles: 10_000,
            max_user_handles: 10_000,
            max_total_handles: 10_000,
            process_recycle_threshold: 0,
            max_process_lifetime: Duration::from_secs(3600),
            method_call_timeout: Duration::from_secs(300),
            process_start_timeout: Duration::from_secs(60),
            recycle_check_calls: 100,
            verbose_worker_logging: false,
            startup_concurrency: 3,
            max_acquire_attempts: 10,
            max_retry_attempts: 10,
            worker_executable: worker_executable.into(),
            worker_extra_args: Vec::new(),
        }
    }

    /// Synchronous structural validation, performed eagerly rather than
    /// deferred to the first spawn attempt.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.min_pool_size > self.max_pool_size {
            return Err(PoolError::Configuration(format!(
                "min_pool_size ({}) must not exceed max_pool_size ({})",
                self.min_pool_size, self.max_pool_size
            )));
        }
        if self.max_pool_size == 0 {
            return Err(PoolError::Configuration(
                "max_pool_size must be at least 1".to_owned(),
            ));
        }
        if self.implementation_locator.trim().is_empty() {
            return Err(PoolError::Configuration(
                "implementation_locator is required".to_owned(),
            ));
        }
        if self.implementation_type_name.trim().is_empty() {
            return Err(PoolError::Configuration(
                "implementation_type_name is required".to_owned(),
            ));
        }
        if self.startup_concurrency == 0 {
            return Err(PoolError::Configuration(
                "startup_concurrency must be at least 1".to_owned(),
            ));
        }
        if self.recycle_check_calls == 0 {
            return Err(PoolError::Configuration(
                "recycle_check_calls must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Configuration handed to the worker process over its command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub implementation_locator: String,
    pub implementation_type_name: String,
    pub endpoint_name: String,
    pub verbose_logging: bool,
    pub parent_pid: u32,
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_min_greater_than_max() {
        let mut config = WorkerPoolConfig::new("locator", "Type", "/bin/true");
        config.min_pool_size = 5;
        config.max_pool_size = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_locator() {
        let mut config = WorkerPoolConfig::new("", "Type", "/bin/true");
        config.implementation_locator = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn defaults_match_spec_table() {
        let config = WorkerPoolConfig::new("locator", "Type", "/bin/true");
        assert_eq!(config.min_pool_size, 1);
        assert_eq!(config.max_pool_size, 5);
        assert_eq!(config.max_memory_mb, 1024);
        assert_eq!(config.process_recycle_threshold, 0);
        assert_eq!(config.max_process_lifetime, Duration::from_secs(3600));
        assert_eq!(config.method_call_timeout, Duration::from_secs(300));
        assert_eq!(config.process_start_timeout, Duration::from_secs(60));
        assert_eq!(config.recycle_check_calls, 100);
        assert!(!config.verbose_worker_logging);
    }
}
