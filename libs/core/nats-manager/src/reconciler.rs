//! Idempotent stream provisioning.

use crate::broker::Broker;
use crate::config::StreamPolicy;
use crate::error::{BrokerError, NatsError};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What [`StreamReconciler::ensure_stream`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// The stream did not exist and was created
    Created,
    /// Creation reported overlapping subjects: an equivalent stream already exists
    AlreadySatisfied,
    /// The stream already matched the policy
    Unchanged,
    /// The stream was updated to the policy
    Updated,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Created => "created",
            ReconcileOutcome::AlreadySatisfied => "already_satisfied",
            ReconcileOutcome::Unchanged => "unchanged",
            ReconcileOutcome::Updated => "updated",
        }
    }
}

/// Creates or updates a stream so it matches a [`StreamPolicy`].
///
/// Concurrent calls are serialized.
pub struct StreamReconciler {
    broker: Arc<dyn Broker>,
    lock: Mutex<()>,
}

impl StreamReconciler {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            lock: Mutex::new(()),
        }
    }

    pub async fn ensure_stream(
        &self,
        policy: &StreamPolicy,
    ) -> Result<ReconcileOutcome, NatsError> {
        let _guard = self.lock.lock().await;

        let outcome = match self.broker.stream_info(&policy.name).await {
            Ok(existing) => self.update_if_needed(&existing.config, policy).await?,
            Err(BrokerError::StreamNotFound(_)) => self.create(policy).await?,
            Err(e) => {
                warn!(stream = %policy.name, error = %e, "Failed to look up stream");
                return Err(e.into());
            }
        };

        metrics::counter!(
            "nats_manager_stream_reconciled_total",
            "stream" => policy.name.clone(),
            "outcome" => outcome.as_str()
        )
        .increment(1);

        Ok(outcome)
    }

    async fn create(&self, policy: &StreamPolicy) -> Result<ReconcileOutcome, NatsError> {
        info!(
            stream = %policy.name,
            subjects = ?policy.subjects,
            "Creating stream"
        );

        match self.broker.create_stream(policy).await {
            Ok(()) => {
                info!(stream = %policy.name, "Stream created");
                Ok(ReconcileOutcome::Created)
            }
            Err(BrokerError::SubjectsOverlap(_)) => {
                info!(
                    stream = %policy.name,
                    "Using existing stream with overlapping subjects"
                );
                Ok(ReconcileOutcome::AlreadySatisfied)
            }
            Err(e) => {
                warn!(stream = %policy.name, error = %e, "Failed to create stream");
                Err(e.into())
            }
        }
    }

    async fn update_if_needed(
        &self,
        current: &StreamPolicy,
        desired: &StreamPolicy,
    ) -> Result<ReconcileOutcome, NatsError> {
        let changed = current.diff(desired);
        if changed.is_empty() {
            debug!(stream = %desired.name, "Stream configuration up to date");
            return Ok(ReconcileOutcome::Unchanged);
        }

        info!(stream = %desired.name, changed = ?changed, "Updating stream configuration");

        self.broker
            .update_stream(desired)
            .await
            .map_err(|source| {
                warn!(stream = %desired.name, error = %source, "Failed to update stream config");
                NatsError::StreamUpdate {
                    stream: desired.name.clone(),
                    source,
                }
            })?;

        info!(stream = %desired.name, "Stream configuration updated");
        Ok(ReconcileOutcome::Updated)
    }
}
