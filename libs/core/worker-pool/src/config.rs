//! Worker pool configuration.

use crate::error::PoolError;
use core_config::{env_bool, env_duration, env_parse, ConfigError, FromEnv};
use std::time::Duration;

/// Configuration for a [`WorkerPool`](crate::WorkerPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool name, used as the `pool` metrics label
    pub name: String,

    /// Maximum number of concurrently running tasks
    pub max_workers: usize,

    /// Maximum number of submitters allowed to wait for a free worker (0 = unbounded)
    pub max_blocking_tasks: usize,

    /// Idle workers older than this are retired
    pub expiry_duration: Duration,

    /// Spawn `max_workers` idle workers when the pool is created
    pub pre_alloc: bool,

    /// Fail fast with `Overloaded` instead of waiting for a free worker
    pub nonblocking: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_workers: 100,
            max_blocking_tasks: 10_000,
            expiry_duration: Duration::from_secs(60),
            pre_alloc: true,
            nonblocking: false,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with the given capacity and defaults elsewhere.
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            ..Default::default()
        }
    }

    /// Set the pool name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the maximum number of blocked submitters.
    pub fn with_max_blocking_tasks(mut self, max: usize) -> Self {
        self.max_blocking_tasks = max;
        self
    }

    /// Set the idle worker expiry.
    pub fn with_expiry_duration(mut self, expiry: Duration) -> Self {
        self.expiry_duration = expiry;
        self
    }

    /// Enable or disable worker pre-allocation.
    pub fn with_pre_alloc(mut self, pre_alloc: bool) -> Self {
        self.pre_alloc = pre_alloc;
        self
    }

    /// Enable or disable non-blocking submission.
    pub fn with_nonblocking(mut self, nonblocking: bool) -> Self {
        self.nonblocking = nonblocking;
        self
    }

    /// Reject configurations the pool cannot run with.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "max workers must be positive".to_string(),
            ));
        }
        if self.expiry_duration.is_zero() {
            return Err(PoolError::InvalidConfig(
                "expiry duration must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl FromEnv for PoolConfig {
    /// Reads `WORKER_POOL_*` variables, falling back to [`PoolConfig::default`].
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            name: core_config::env_or_default("WORKER_POOL_NAME", &defaults.name),
            max_workers: env_parse("WORKER_POOL_MAX_WORKERS", defaults.max_workers)?,
            max_blocking_tasks: env_parse(
                "WORKER_POOL_MAX_BLOCKING_TASKS",
                defaults.max_blocking_tasks,
            )?,
            expiry_duration: env_duration("WORKER_POOL_EXPIRY", defaults.expiry_duration)?,
            pre_alloc: env_bool("WORKER_POOL_PRE_ALLOC", defaults.pre_alloc)?,
            nonblocking: env_bool("WORKER_POOL_NONBLOCKING", defaults.nonblocking)?,
        })
    }
}
