//! Publishing with bounded retry and exponential backoff.

use crate::broker::Broker;
use crate::error::{BrokerError, NatsError};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How many times to try a publish and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay after the zero-based `attempt` failed: `base_delay * 2^attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Publishes payloads through a [`Broker`], retrying transient failures.
pub struct Publisher {
    broker: Arc<dyn Broker>,
    retry: RetryPolicy,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Publish `payload` to `subject` and return the stream sequence.
    ///
    /// `ctx` is checked before every attempt and raced against the broker
    /// call and each backoff sleep. Non-retryable failures are returned
    /// immediately.
    pub async fn publish(
        &self,
        ctx: &CancellationToken,
        subject: &str,
        payload: Bytes,
    ) -> Result<u64, NatsError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let started = Instant::now();
        let mut last_error = BrokerError::Other("no publish attempt made".into());

        for attempt in 0..max_attempts {
            if ctx.is_cancelled() {
                record_outcome(subject, "cancelled");
                return Err(NatsError::Cancelled);
            }

            let result = tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    record_outcome(subject, "cancelled");
                    return Err(NatsError::Cancelled);
                }
                result = self.broker.publish(subject, payload.clone()) => result,
            };

            let error = match result {
                Ok(sequence) => {
                    info!(
                        subject = %subject,
                        sequence,
                        attempts = attempt + 1,
                        "Message published"
                    );
                    record_outcome(subject, "success");
                    metrics::histogram!("nats_manager_publish_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    return Ok(sequence);
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                warn!(
                    subject = %subject,
                    attempt = attempt + 1,
                    error = %error,
                    "Publish failed with non-retryable error"
                );
                record_outcome(subject, "rejected");
                return Err(error.into());
            }

            if attempt + 1 < max_attempts {
                let delay = self.retry.backoff(attempt);
                warn!(
                    subject = %subject,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Failed to publish message, retrying"
                );
                metrics::counter!("nats_manager_publish_retries_total").increment(1);

                tokio::select! {
                    biased;
                    _ = ctx.cancelled() => {
                        record_outcome(subject, "cancelled");
                        return Err(NatsError::Cancelled);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            last_error = error;
        }

        warn!(
            subject = %subject,
            attempts = max_attempts,
            error = %last_error,
            "Publish retries exhausted"
        );
        record_outcome(subject, "exhausted");

        Err(NatsError::PublishExhausted {
            attempts: max_attempts,
            source: last_error,
        })
    }
}

fn record_outcome(subject: &str, outcome: &'static str) {
    metrics::counter!(
        "nats_manager_publish_total",
        "subject" => subject.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBroker;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn assert_close(actual: Duration, expected: Duration) {
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(5),
            "expected ~{:?}, got {:?}",
            expected,
            actual
        );
    }

    #[test]
    fn test_backoff_doubles() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff(0), Duration::from_millis(100));
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(2), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_saturates() {
        let retry = RetryPolicy::new(64, Duration::from_secs(1));
        assert_eq!(retry.backoff(63), Duration::from_secs(u32::MAX as u64));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_returns_sequence() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .withf(|subject, payload| subject == "orders.created" && payload.as_ref() == b"{}")
            .times(1)
            .returning(|_, _| Ok(17));

        let publisher = Publisher::new(Arc::new(broker));
        let sequence = publisher
            .publish(&CancellationToken::new(), "orders.created", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert_eq!(sequence, 17);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_exhausts_three_attempts() {
        let attempt_times = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let mut broker = MockBroker::new();
        let times = attempt_times.clone();
        broker.expect_publish().times(3).returning(move |_, _| {
            times.lock().unwrap().push(start.elapsed());
            Err(BrokerError::Timeout("no ack".into()))
        });

        let publisher = Publisher::new(Arc::new(broker));
        let err = publisher
            .publish(&CancellationToken::new(), "orders.created", Bytes::new())
            .await
            .unwrap_err();

        match err {
            NatsError::PublishExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert_eq!(source, BrokerError::Timeout("no ack".into()));
            }
            other => panic!("unexpected error: {other}"),
        }

        // Sleeps of 100ms then 200ms, none after the final attempt.
        let times = attempt_times.lock().unwrap();
        assert_eq!(times.len(), 3);
        assert_close(times[0], Duration::ZERO);
        assert_close(times[1] - times[0], Duration::from_millis(100));
        assert_close(times[2] - times[1], Duration::from_millis(200));
        assert_close(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_single_attempt() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .times(1)
            .returning(|_, _| Err(BrokerError::FeatureDisabled("no responders".into())));

        let publisher = Publisher::new(Arc::new(broker));
        let err = publisher
            .publish(&CancellationToken::new(), "orders.created", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NatsError::Broker(BrokerError::FeatureDisabled(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_ack_single_attempt() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .times(1)
            .returning(|_, _| Err(BrokerError::InvalidAck("garbage".into())));

        let publisher = Publisher::new(Arc::new(broker));
        let err = publisher
            .publish(&CancellationToken::new(), "orders.created", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NatsError::Broker(BrokerError::InvalidAck(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut broker = MockBroker::new();
        let counter = calls.clone();
        broker.expect_publish().times(2).returning(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(BrokerError::Unavailable("connection reset".into()))
            } else {
                Ok(5)
            }
        });

        let publisher = Publisher::new(Arc::new(broker));
        let sequence = publisher
            .publish(&CancellationToken::new(), "orders.created", Bytes::new())
            .await
            .unwrap();
        assert_eq!(sequence, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_retries() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .times(1)
            .returning(|_, _| Err(BrokerError::Timeout("no ack".into())));

        let ctx = CancellationToken::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let publisher = Publisher::new(Arc::new(broker));
        let err = publisher
            .publish(&ctx, "orders.created", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NatsError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let mut broker = MockBroker::new();
        broker.expect_publish().never();

        let ctx = CancellationToken::new();
        ctx.cancel();

        let publisher = Publisher::new(Arc::new(broker));
        let err = publisher
            .publish(&ctx, "orders.created", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NatsError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_retry_policy() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .times(5)
            .returning(|_, _| Err(BrokerError::Timeout("no ack".into())));

        let publisher = Publisher::new(Arc::new(broker))
            .with_retry_policy(RetryPolicy::new(5, Duration::from_millis(10)));
        let start = Instant::now();
        let err = publisher
            .publish(&CancellationToken::new(), "orders.created", Bytes::new())
            .await
            .unwrap_err();

        assert!(matches!(err, NatsError::PublishExhausted { attempts: 5, .. }));
        // 10 + 20 + 40 + 80
        assert_close(start.elapsed(), Duration::from_millis(150));
    }
}
