//! Bounded async worker pool.
//!
//! A fixed number of long-lived tokio tasks execute submitted work. The pool
//! reuses idle workers (most recently used first), retires workers idle for
//! longer than the configured expiry and isolates panics so one bad task
//! never takes a worker down.
//!
//! # Example
//!
//! ```ignore
//! use tokio_util::sync::CancellationToken;
//! use worker_pool::{PoolConfig, WorkerPool};
//!
//! let pool = WorkerPool::new(PoolConfig::new(8).with_name("checkout"))?;
//! let ctx = CancellationToken::new();
//!
//! pool.submit(&ctx, || async {
//!     process_order().await?;
//!     Ok(())
//! })
//! .await?;
//!
//! pool.graceful_shutdown(Duration::from_secs(30)).await?;
//! ```

pub mod config;
pub mod error;
pub mod metrics;
mod pool;
mod worker;

pub use config::PoolConfig;
pub use error::PoolError;
pub use metrics::PoolMetricsSnapshot;
pub use pool::{PoolState, WorkerPool};
pub use tokio_util::sync::CancellationToken;
