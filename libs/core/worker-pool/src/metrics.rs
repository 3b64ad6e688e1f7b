//! Live pool counters.
//!
//! Every counter is kept in an atomic for cheap point-in-time snapshots and
//! mirrored to the `metrics` facade so a Prometheus recorder picks it up.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// Snapshot keys, shared with callers that merge pool metrics into larger maps.
pub const COMPLETED_TASKS: &str = "completed_tasks";
pub const FAILED_TASKS: &str = "failed_tasks";
pub const RUNNING_TASKS: &str = "running_tasks";
pub const WAITING_TASKS: &str = "waiting_tasks";
pub const CAPACITY: &str = "capacity";
pub const FREE_WORKERS: &str = "free_workers";

/// Atomic task counters for one pool.
#[derive(Debug)]
pub(crate) struct PoolMetrics {
    pool: String,
    completed: AtomicI64,
    failed: AtomicI64,
    running: AtomicI64,
    waiting: AtomicI64,
}

impl PoolMetrics {
    pub(crate) fn new(pool: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            completed: AtomicI64::new(0),
            failed: AtomicI64::new(0),
            running: AtomicI64::new(0),
            waiting: AtomicI64::new(0),
        }
    }

    pub(crate) fn task_queued(&self) {
        let waiting = self.waiting.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::gauge!("worker_pool_waiting_tasks", "pool" => self.pool.clone())
            .set(waiting as f64);
    }

    /// A queued task left the queue without running.
    pub(crate) fn task_abandoned(&self) {
        let waiting = self.waiting.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics::gauge!("worker_pool_waiting_tasks", "pool" => self.pool.clone())
            .set(waiting as f64);
        self.record_failed();
    }

    pub(crate) fn task_started(&self) {
        let waiting = self.waiting.fetch_sub(1, Ordering::AcqRel) - 1;
        let running = self.running.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::gauge!("worker_pool_waiting_tasks", "pool" => self.pool.clone())
            .set(waiting as f64);
        metrics::gauge!("worker_pool_running_tasks", "pool" => self.pool.clone())
            .set(running as f64);
    }

    pub(crate) fn task_stopped(&self) {
        let running = self.running.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics::gauge!("worker_pool_running_tasks", "pool" => self.pool.clone())
            .set(running as f64);
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
        metrics::counter!("worker_pool_tasks_completed_total", "pool" => self.pool.clone())
            .increment(1);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::AcqRel);
        metrics::counter!("worker_pool_tasks_failed_total", "pool" => self.pool.clone())
            .increment(1);
    }

    pub(crate) fn record_capacity(&self, capacity: usize) {
        metrics::gauge!("worker_pool_capacity", "pool" => self.pool.clone()).set(capacity as f64);
    }

    pub(crate) fn record_duration(&self, seconds: f64) {
        metrics::histogram!("worker_pool_task_duration_seconds", "pool" => self.pool.clone())
            .record(seconds);
    }

    pub(crate) fn snapshot(&self, capacity: usize, free_workers: usize) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            completed_tasks: self.completed.load(Ordering::Acquire),
            failed_tasks: self.failed.load(Ordering::Acquire),
            running_tasks: self.running.load(Ordering::Acquire),
            waiting_tasks: self.waiting.load(Ordering::Acquire),
            capacity: capacity as i64,
            free_workers: free_workers as i64,
        }
    }
}

/// Point-in-time view of a pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolMetricsSnapshot {
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub running_tasks: i64,
    pub waiting_tasks: i64,
    pub capacity: i64,
    pub free_workers: i64,
}

impl PoolMetricsSnapshot {
    /// Flatten into string keys for merging with other metric sources.
    pub fn to_map(&self) -> BTreeMap<String, i64> {
        BTreeMap::from([
            (COMPLETED_TASKS.to_string(), self.completed_tasks),
            (FAILED_TASKS.to_string(), self.failed_tasks),
            (RUNNING_TASKS.to_string(), self.running_tasks),
            (WAITING_TASKS.to_string(), self.waiting_tasks),
            (CAPACITY.to_string(), self.capacity),
            (FREE_WORKERS.to_string(), self.free_workers),
        ])
    }
}
