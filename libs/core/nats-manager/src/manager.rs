use crate::broker::Broker;
use crate::config::{DeliveryOptions, NatsConfig, StreamPolicy};
use crate::dispatcher::{MessageHandler, SubscriptionDispatcher, SubscriptionHandle};
use crate::error::NatsError;
use crate::health::HealthReport;
use crate::jetstream::JetStreamBroker;
use crate::metrics::{ManagerMetrics, StreamStats};
use crate::publisher::{Publisher, RetryPolicy};
use crate::reconciler::{ReconcileOutcome, StreamReconciler};
use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use worker_pool::WorkerPool;

/// Owns the stream policy, the broker handle and the worker pool.
///
/// Build one per process and share it behind an `Arc`.
pub struct NatsManager {
    broker: Arc<dyn Broker>,
    policy: StreamPolicy,
    reconciler: StreamReconciler,
    publisher: Publisher,
    dispatcher: SubscriptionDispatcher,
    pool: Arc<WorkerPool>,
    delivery: DeliveryOptions,
}

impl NatsManager {
    /// Connect to `config.url` over JetStream and reconcile the stream.
    pub async fn connect(config: &NatsConfig, pool: Arc<WorkerPool>) -> Result<Self, NatsError> {
        info!(config = ?config, "Connecting to NATS");
        let broker = JetStreamBroker::connect(&config.url).await?;
        Self::new(Arc::new(broker), pool, config).await
    }

    /// Build a manager on top of `broker` and reconcile the stream.
    ///
    /// A failed stream update is logged and the existing stream is used as is.
    /// Any other reconciliation failure aborts construction.
    pub async fn new(
        broker: Arc<dyn Broker>,
        pool: Arc<WorkerPool>,
        config: &NatsConfig,
    ) -> Result<Self, NatsError> {
        config.stream.validate()?;

        let manager = Self {
            reconciler: StreamReconciler::new(broker.clone()),
            publisher: Publisher::new(broker.clone()),
            dispatcher: SubscriptionDispatcher::new(
                broker.clone(),
                pool.clone(),
                config.stream.name.clone(),
                config.durable_prefix.clone(),
            ),
            broker,
            policy: config.stream.clone(),
            pool,
            delivery: config.delivery.clone(),
        };

        match manager.ensure_stream().await {
            Ok(outcome) => {
                info!(
                    stream = %manager.policy.name,
                    outcome = outcome.as_str(),
                    "NATS manager ready"
                );
            }
            Err(NatsError::StreamUpdate { stream, source }) => {
                warn!(
                    stream = %stream,
                    error = %source,
                    "Continuing with existing stream configuration"
                );
            }
            Err(e) => return Err(e),
        }

        Ok(manager)
    }

    /// Replace the publish retry budget.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.publisher = Publisher::new(self.broker.clone()).with_retry_policy(retry);
        self
    }

    pub async fn ensure_stream(&self) -> Result<ReconcileOutcome, NatsError> {
        self.reconciler.ensure_stream(&self.policy).await
    }

    /// Publish with retry. Returns the stream sequence.
    pub async fn publish(
        &self,
        ctx: &CancellationToken,
        subject: &str,
        payload: impl Into<Bytes>,
    ) -> Result<u64, NatsError> {
        self.publisher.publish(ctx, subject, payload.into()).await
    }

    /// Subscribe with the configured delivery defaults.
    pub async fn subscribe<H: MessageHandler>(
        &self,
        subject: &str,
        handler: H,
    ) -> Result<SubscriptionHandle, NatsError> {
        self.subscribe_with(subject, handler, self.delivery.clone())
            .await
    }

    pub async fn subscribe_with<H: MessageHandler>(
        &self,
        subject: &str,
        handler: H,
        options: DeliveryOptions,
    ) -> Result<SubscriptionHandle, NatsError> {
        self.dispatcher
            .subscribe(subject, Arc::new(handler), options)
            .await
    }

    /// Report how full the stream is relative to its message limit.
    pub async fn health_check(&self) -> Result<HealthReport, NatsError> {
        let info = self.broker.stream_info(&self.policy.name).await?;
        let report = HealthReport::from_stream(&info);

        metrics::gauge!("nats_manager_stream_messages", "stream" => report.stream.clone())
            .set(report.current_msgs as f64);

        if report.warning {
            warn!(
                stream = %report.stream,
                current_msgs = report.current_msgs,
                max_msgs = report.max_msgs,
                usage_percentage = report.usage_percentage.unwrap_or_default(),
                "Stream is nearing its message limit"
            );
        } else {
            debug!(
                stream = %report.stream,
                current_msgs = report.current_msgs,
                "Stream health checked"
            );
        }

        Ok(report)
    }

    /// Pool counters and, if the broker answers, stream counters.
    pub async fn metrics(&self) -> ManagerMetrics {
        let stream = match self.broker.stream_info(&self.policy.name).await {
            Ok(info) => Some(StreamStats::from(&info)),
            Err(e) => {
                debug!(stream = %self.policy.name, error = %e, "Stream stats unavailable");
                None
            }
        };

        ManagerMetrics {
            pool: self.pool.metrics(),
            stream,
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// The desired stream policy.
    ///
    /// After a rejected update the broker keeps running its older
    /// configuration; [`Self::health_check`] reports the limits in effect.
    pub fn stream_policy(&self) -> &StreamPolicy {
        &self.policy
    }

    /// Release the pool and close the broker connection.
    ///
    /// Use [`WorkerPool::graceful_shutdown`] first to let running tasks finish.
    pub async fn close(&self) -> Result<(), NatsError> {
        self.pool.release();
        self.broker.close().await?;
        info!(stream = %self.policy.name, "NATS manager closed");
        Ok(())
    }
}

impl std::fmt::Debug for NatsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsManager")
            .field("stream", &self.policy.name)
            .field("pool", &self.pool)
            .finish()
    }
}
