//! Error types for the worker pool.

use std::time::Duration;
use thiserror::Error;

/// Error returned by pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Configuration rejected at construction
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// `tune` called with a non-positive size
    #[error("Pool size must be positive, got {0}")]
    InvalidSize(usize),

    /// The submitter's context was cancelled before the task could run
    #[error("Task submission cancelled")]
    Cancelled,

    /// No free worker (non-blocking mode) or too many blocked submitters
    #[error("Pool is full")]
    Overloaded,

    /// The pool is releasing or released
    #[error("Pool is closed")]
    Closed,

    /// In-flight tasks did not drain before the deadline
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}
