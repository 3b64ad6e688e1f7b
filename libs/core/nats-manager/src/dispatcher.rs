//! Subscription dispatch onto the worker pool.

use crate::broker::{Broker, Delivery, DeliveryStream};
use crate::config::{durable_name, AckMode, DeliveryOptions};
use crate::error::NatsError;
use async_trait::async_trait;
use eyre::WrapErr;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use worker_pool::WorkerPool;

/// Processes one delivery.
///
/// Implemented for any `Fn(Delivery) -> impl Future<Output = eyre::Result<()>>`.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery) -> eyre::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) -> eyre::Result<()> {
        (self)(delivery).await
    }
}

/// Binds durable consumers and runs their deliveries on a [`WorkerPool`].
pub struct SubscriptionDispatcher {
    broker: Arc<dyn Broker>,
    pool: Arc<WorkerPool>,
    stream: String,
    durable_prefix: String,
}

impl SubscriptionDispatcher {
    pub fn new(
        broker: Arc<dyn Broker>,
        pool: Arc<WorkerPool>,
        stream: impl Into<String>,
        durable_prefix: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            pool,
            stream: stream.into(),
            durable_prefix: durable_prefix.into(),
        }
    }

    pub async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn MessageHandler>,
        options: DeliveryOptions,
    ) -> Result<SubscriptionHandle, NatsError> {
        let durable = durable_name(&self.durable_prefix, subject);
        let deliveries = self
            .broker
            .consume(&self.stream, &durable, subject, &options)
            .await?;

        info!(
            stream = %self.stream,
            subject = %subject,
            consumer = %durable,
            ack_mode = ?options.ack_mode,
            "Subscribed"
        );

        let token = CancellationToken::new();
        let task = tokio::spawn(dispatch_loop(
            deliveries,
            handler,
            self.pool.clone(),
            options.ack_mode,
            token.clone(),
            durable.clone(),
        ));

        Ok(SubscriptionHandle {
            durable_name: durable,
            subject: subject.to_string(),
            token,
            task: Some(task),
        })
    }
}

/// A running subscription. Dropping the handle stops dispatch.
pub struct SubscriptionHandle {
    durable_name: String,
    subject: String,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn durable_name(&self) -> &str {
        &self.durable_name
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
            && self
                .task
                .as_ref()
                .is_some_and(|task| !task.is_finished())
    }

    /// Stop pulling deliveries and wait for the dispatch loop to exit.
    ///
    /// Tasks already handed to the pool keep running.
    pub async fn unsubscribe(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(consumer = %self.durable_name, error = %e, "Dispatch loop ended abnormally");
            }
        }
        info!(consumer = %self.durable_name, "Unsubscribed");
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("durable_name", &self.durable_name)
            .field("subject", &self.subject)
            .field("active", &self.is_active())
            .finish()
    }
}

async fn dispatch_loop(
    mut deliveries: DeliveryStream,
    handler: Arc<dyn MessageHandler>,
    pool: Arc<WorkerPool>,
    ack_mode: AckMode,
    token: CancellationToken,
    consumer: String,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = deliveries.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => {
                warn!(consumer = %consumer, error = %e, "Error receiving delivery");
                continue;
            }
            None => {
                info!(consumer = %consumer, "Delivery stream ended");
                break;
            }
        };

        let subject = delivery.subject.clone();
        let sequence = delivery.sequence;
        debug!(
            consumer = %consumer,
            subject = %subject,
            sequence,
            delivered = delivery.delivered,
            "Dispatching delivery"
        );

        let handler = handler.clone();
        let submitted = pool
            .submit(&token, move || run_handler(handler, delivery, ack_mode))
            .await;

        if let Err(e) = submitted {
            // Left unacknowledged: the broker redelivers after ack_wait.
            warn!(
                consumer = %consumer,
                subject = %subject,
                sequence,
                error = %e,
                "Worker pool rejected delivery"
            );
            metrics::counter!(
                "nats_manager_deliveries_rejected_total",
                "consumer" => consumer.clone()
            )
            .increment(1);
        }
    }

    debug!(consumer = %consumer, "Dispatch loop stopped");
}

async fn run_handler(
    handler: Arc<dyn MessageHandler>,
    delivery: Delivery,
    ack_mode: AckMode,
) -> eyre::Result<()> {
    let subject = delivery.subject.clone();
    let sequence = delivery.sequence;
    let acker = delivery.clone();

    handler
        .handle(delivery)
        .await
        .wrap_err_with(|| format!("handler failed for {} (sequence {})", subject, sequence))?;

    if ack_mode == AckMode::Auto {
        acker
            .ack()
            .await
            .wrap_err_with(|| format!("failed to ack {} (sequence {})", subject, sequence))?;
    }

    Ok(())
}
