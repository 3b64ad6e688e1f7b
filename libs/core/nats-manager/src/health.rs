//! Stream health and HTTP probes.

use crate::broker::StreamInfo;
use crate::manager::NatsManager;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Usage above which a stream is reported as nearly full.
pub const WARNING_THRESHOLD_PERCENT: f64 = 90.0;

/// Stream fill level relative to its message limit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub stream: String,
    pub current_msgs: u64,
    pub max_msgs: i64,
    /// `None` when the stream has no message limit
    pub usage_percentage: Option<f64>,
    pub warning: bool,
}

impl HealthReport {
    pub fn from_stream(info: &StreamInfo) -> Self {
        let max_msgs = info.config.max_msgs;
        let usage_percentage =
            (max_msgs > 0).then(|| info.messages as f64 * 100.0 / max_msgs as f64);

        Self {
            stream: info.config.name.clone(),
            current_msgs: info.messages,
            max_msgs,
            usage_percentage,
            warning: usage_percentage.is_some_and(|usage| usage >= WARNING_THRESHOLD_PERCENT),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ProbeStatus {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<HealthReport>,
}

impl ProbeStatus {
    fn healthy(report: Option<HealthReport>) -> Self {
        Self {
            status: "healthy".to_string(),
            report,
        }
    }

    fn unhealthy(reason: &str) -> Self {
        Self {
            status: format!("unhealthy: {}", reason),
            report: None,
        }
    }
}

#[derive(Clone)]
struct HealthState {
    manager: Arc<NatsManager>,
}

/// Probe, stats and metrics routes for a [`NatsManager`].
///
/// `/metrics` is only mounted when a Prometheus handle is given.
pub fn health_router(manager: Arc<NatsManager>, metrics: Option<PrometheusHandle>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/stats", get(stats_handler))
        .with_state(HealthState { manager });

    if let Some(handle) = metrics {
        router = router.route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
    }

    router.layer(TraceLayer::new_for_http())
}

/// Liveness: fails only once the pool has been released.
async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    if state.manager.pool().is_closed() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProbeStatus::unhealthy("worker pool closed")),
        )
    } else {
        (StatusCode::OK, Json(ProbeStatus::healthy(None)))
    }
}

/// Readiness: the broker must answer for the stream.
async fn ready_handler(State(state): State<HealthState>) -> impl IntoResponse {
    match state.manager.health_check().await {
        Ok(report) => (StatusCode::OK, Json(ProbeStatus::healthy(Some(report)))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProbeStatus::unhealthy(&e.to_string())),
        ),
    }
}

async fn stats_handler(State(state): State<HealthState>) -> impl IntoResponse {
    Json(state.manager.metrics().await.to_map())
}
