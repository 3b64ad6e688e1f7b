//! Prometheus export and typed metric snapshots.

use crate::broker::StreamInfo;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;
use worker_pool::PoolMetricsSnapshot;

static METRICS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder. Safe to call more than once.
pub fn init_metrics() -> eyre::Result<&'static PrometheusHandle> {
    METRICS_HANDLE.get_or_try_init(|| -> eyre::Result<PrometheusHandle> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics recorder initialized");
        register_metric_descriptions();
        Ok(handle)
    })
}

fn register_metric_descriptions() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    describe_counter!(
        "worker_pool_tasks_completed_total",
        "Tasks that finished successfully"
    );
    describe_counter!(
        "worker_pool_tasks_failed_total",
        "Tasks that returned an error, panicked or were rejected"
    );
    describe_gauge!("worker_pool_running_tasks", "Tasks currently executing");
    describe_gauge!("worker_pool_waiting_tasks", "Tasks admitted but not yet started");
    describe_gauge!("worker_pool_capacity", "Configured pool capacity");
    describe_histogram!("worker_pool_task_duration_seconds", "Task execution time");

    describe_counter!(
        "nats_manager_publish_total",
        "Publish calls by subject and outcome"
    );
    describe_counter!(
        "nats_manager_publish_retries_total",
        "Publish attempts retried after a transient failure"
    );
    describe_histogram!(
        "nats_manager_publish_duration_seconds",
        "Time from first attempt to broker acknowledgement"
    );
    describe_counter!(
        "nats_manager_stream_reconciled_total",
        "Stream reconciliations by outcome"
    );
    describe_counter!(
        "nats_manager_deliveries_rejected_total",
        "Deliveries left unacknowledged because the pool refused them"
    );
    describe_gauge!("nats_manager_stream_messages", "Messages held by the stream");
}

/// Stream counters reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub messages: u64,
    pub bytes: u64,
    pub consumer_count: usize,
}

impl From<&StreamInfo> for StreamStats {
    fn from(info: &StreamInfo) -> Self {
        Self {
            messages: info.messages,
            bytes: info.bytes,
            consumer_count: info.consumer_count,
        }
    }
}

/// Pool counters plus, when the broker answered, stream counters.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerMetrics {
    pub pool: PoolMetricsSnapshot,
    pub stream: Option<StreamStats>,
}

impl ManagerMetrics {
    /// Flatten into the key/value form served on `/stats`.
    pub fn to_map(&self) -> BTreeMap<String, i64> {
        let mut map = self.pool.to_map();
        if let Some(stream) = &self.stream {
            map.insert("stream_messages".into(), saturating_i64(stream.messages));
            map.insert("stream_bytes".into(), saturating_i64(stream.bytes));
            map.insert(
                "consumer_count".into(),
                i64::try_from(stream.consumer_count).unwrap_or(i64::MAX),
            );
        }
        map
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_snapshot() -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            completed_tasks: 12,
            failed_tasks: 3,
            running_tasks: 2,
            waiting_tasks: 1,
            capacity: 8,
            free_workers: 6,
        }
    }

    #[test]
    fn test_to_map_without_stream() {
        let metrics = ManagerMetrics {
            pool: pool_snapshot(),
            stream: None,
        };

        let map = metrics.to_map();
        assert_eq!(map.len(), 6);
        assert_eq!(map["completed_tasks"], 12);
        assert_eq!(map["failed_tasks"], 3);
        assert_eq!(map["free_workers"], 6);
        assert!(!map.contains_key("stream_messages"));
    }

    #[test]
    fn test_to_map_with_stream() {
        let metrics = ManagerMetrics {
            pool: pool_snapshot(),
            stream: Some(StreamStats {
                messages: 40,
                bytes: u64::MAX,
                consumer_count: 2,
            }),
        };

        let map = metrics.to_map();
        assert_eq!(map["stream_messages"], 40);
        assert_eq!(map["stream_bytes"], i64::MAX);
        assert_eq!(map["consumer_count"], 2);
        assert_eq!(map["capacity"], 8);
    }
}
