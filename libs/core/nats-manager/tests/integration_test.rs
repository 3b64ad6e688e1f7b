//! Integration tests for the NATS manager

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use nats_manager::{
    AckMode, Acknowledger, Broker, BrokerError, CancellationToken, Delivery, DeliveryOptions,
    DeliveryStream, NatsConfig, NatsError, NatsManager, PoolConfig, ReconcileOutcome, StreamInfo,
    StreamPolicy, WorkerPool,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// In-memory stand-in for a JetStream server.
#[derive(Default)]
struct FakeBroker {
    state: Mutex<FakeState>,
    acks: Arc<Mutex<Vec<(String, u64)>>>,
}

#[derive(Default)]
struct FakeState {
    streams: HashMap<String, FakeStream>,
    consumers: Vec<FakeConsumer>,
    create_calls: usize,
    update_calls: usize,
    reject_updates: bool,
    transient_publish_failures: u32,
    publish_attempts: u32,
    closed: bool,
}

struct FakeStream {
    policy: StreamPolicy,
    messages: Vec<(String, Bytes, u64)>,
    last_sequence: u64,
}

struct FakeConsumer {
    durable: String,
    filter: String,
    tx: mpsc::UnboundedSender<Result<Delivery, BrokerError>>,
}

struct FakeAcker {
    sequence: u64,
    log: Arc<Mutex<Vec<(String, u64)>>>,
}

#[async_trait]
impl Acknowledger for FakeAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.log.lock().unwrap().push(("ack".into(), self.sequence));
        Ok(())
    }

    async fn nak(&self, _delay: Option<Duration>) -> Result<(), BrokerError> {
        self.log.lock().unwrap().push(("nak".into(), self.sequence));
        Ok(())
    }

    async fn term(&self) -> Result<(), BrokerError> {
        self.log.lock().unwrap().push(("term".into(), self.sequence));
        Ok(())
    }
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern = pattern.split('.');
    let mut subject = subject.split('.');
    loop {
        match (pattern.next(), subject.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

impl FakeBroker {
    fn with_stream(policy: StreamPolicy) -> Self {
        let broker = Self::default();
        broker.state.lock().unwrap().streams.insert(
            policy.name.clone(),
            FakeStream {
                policy,
                messages: Vec::new(),
                last_sequence: 0,
            },
        );
        broker
    }

    fn delivery(&self, subject: &str, payload: Bytes, sequence: u64) -> Delivery {
        Delivery::new(
            subject,
            payload,
            sequence,
            1,
            Arc::new(FakeAcker {
                sequence,
                log: self.acks.clone(),
            }),
        )
    }

    fn acked(&self) -> Vec<u64> {
        let mut acked: Vec<u64> = self
            .acks
            .lock()
            .unwrap()
            .iter()
            .filter(|(kind, _)| kind == "ack")
            .map(|(_, sequence)| *sequence)
            .collect();
        acked.sort_unstable();
        acked
    }

    fn policy(&self, name: &str) -> StreamPolicy {
        self.state.lock().unwrap().streams[name].policy.clone()
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn stream_info(&self, name: &str) -> Result<StreamInfo, BrokerError> {
        let state = self.state.lock().unwrap();
        let stream = state
            .streams
            .get(name)
            .ok_or_else(|| BrokerError::StreamNotFound(name.to_string()))?;
        Ok(StreamInfo {
            config: stream.policy.clone(),
            messages: stream.messages.len() as u64,
            bytes: stream.messages.iter().map(|(_, p, _)| p.len() as u64).sum(),
            consumer_count: state.consumers.len(),
        })
    }

    async fn create_stream(&self, policy: &StreamPolicy) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        let overlaps = state.streams.values().any(|s| {
            s.policy
                .subjects
                .iter()
                .any(|subject| policy.subjects.contains(subject))
        });
        if overlaps {
            return Err(BrokerError::SubjectsOverlap("subjects overlap".into()));
        }
        state.streams.insert(
            policy.name.clone(),
            FakeStream {
                policy: policy.clone(),
                messages: Vec::new(),
                last_sequence: 0,
            },
        );
        Ok(())
    }

    async fn update_stream(&self, policy: &StreamPolicy) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.update_calls += 1;
        if state.reject_updates {
            return Err(BrokerError::Other("stream configuration update not allowed".into()));
        }
        let stream = state
            .streams
            .get_mut(&policy.name)
            .ok_or_else(|| BrokerError::StreamNotFound(policy.name.clone()))?;
        stream.policy = policy.clone();
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<u64, BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.publish_attempts += 1;
        if state.closed {
            return Err(BrokerError::Unavailable("connection closed".into()));
        }
        if state.transient_publish_failures > 0 {
            state.transient_publish_failures -= 1;
            return Err(BrokerError::Timeout("timed out waiting for ack".into()));
        }

        let stream = state
            .streams
            .values_mut()
            .find(|s| s.policy.subjects.iter().any(|p| subject_matches(p, subject)))
            .ok_or_else(|| BrokerError::FeatureDisabled("no responders".into()))?;
        stream.last_sequence += 1;
        let sequence = stream.last_sequence;
        stream
            .messages
            .push((subject.to_string(), payload.clone(), sequence));

        for consumer in state
            .consumers
            .iter()
            .filter(|c| subject_matches(&c.filter, subject))
        {
            let _ = consumer
                .tx
                .send(Ok(self.delivery(subject, payload.clone(), sequence)));
        }

        Ok(sequence)
    }

    async fn consume(
        &self,
        stream: &str,
        durable: &str,
        subject: &str,
        _options: &DeliveryOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.state.lock().unwrap();
        if !state.streams.contains_key(stream) {
            return Err(BrokerError::StreamNotFound(stream.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.consumers.push(FakeConsumer {
            durable: durable.to_string(),
            filter: subject.to_string(),
            tx,
        });

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.consumers.clear();
        Ok(())
    }
}

fn pool(max_workers: usize) -> Arc<WorkerPool> {
    Arc::new(
        WorkerPool::new(
            PoolConfig::new(max_workers)
                .with_name("checkout-test")
                .with_pre_alloc(false),
        )
        .unwrap(),
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

mod reconcile_tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_created_once_then_unchanged() {
        let broker = Arc::new(FakeBroker::default());
        let config = NatsConfig::default();

        let manager = NatsManager::new(broker.clone(), pool(2), &config)
            .await
            .unwrap();
        assert_eq!(
            manager.ensure_stream().await.unwrap(),
            ReconcileOutcome::Unchanged
        );

        let _second = NatsManager::new(broker.clone(), pool(2), &config)
            .await
            .unwrap();

        let state = broker.state.lock().unwrap();
        assert_eq!(state.create_calls, 1);
        assert_eq!(state.update_calls, 0);
    }

    #[tokio::test]
    async fn test_drifted_stream_is_updated() {
        let broker = Arc::new(FakeBroker::with_stream(
            StreamPolicy::new("CHECKOUT", "checkout.>").with_max_msgs(10),
        ));

        let manager = NatsManager::new(broker.clone(), pool(2), &NatsConfig::default())
            .await
            .unwrap();

        assert_eq!(broker.policy("CHECKOUT"), *manager.stream_policy());
        assert_eq!(broker.state.lock().unwrap().update_calls, 1);
    }

    #[tokio::test]
    async fn test_rejected_update_keeps_stale_stream() {
        let broker = Arc::new(FakeBroker::with_stream(
            StreamPolicy::new("CHECKOUT", "checkout.>").with_max_msgs(10),
        ));
        broker.state.lock().unwrap().reject_updates = true;

        let manager = NatsManager::new(broker.clone(), pool(2), &NatsConfig::default())
            .await
            .unwrap();

        assert_eq!(broker.policy("CHECKOUT").max_msgs, 10);
        assert_eq!(manager.stream_policy().max_msgs, 10_000);

        let report = manager.health_check().await.unwrap();
        assert_eq!(report.max_msgs, 10);
    }

    #[tokio::test]
    async fn test_overlapping_stream_is_accepted() {
        let broker = Arc::new(FakeBroker::with_stream(StreamPolicy::new(
            "LEGACY",
            "checkout.>",
        )));

        let manager = NatsManager::new(broker.clone(), pool(2), &NatsConfig::default())
            .await
            .unwrap();

        assert_eq!(
            manager.ensure_stream().await.unwrap(),
            ReconcileOutcome::AlreadySatisfied
        );
    }
}

mod messaging_tests {
    use super::*;

    #[tokio::test]
    async fn test_sequences_increase() {
        let broker = Arc::new(FakeBroker::default());
        let manager = NatsManager::new(broker.clone(), pool(2), &NatsConfig::default())
            .await
            .unwrap();
        let ctx = CancellationToken::new();

        let first = manager
            .publish(&ctx, "checkout.orders.created", "{\"id\":1}")
            .await
            .unwrap();
        let second = manager
            .publish(&ctx, "checkout.orders.paid", "{\"id\":1}")
            .await
            .unwrap();
        assert!(second > first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_recovers_from_transient_failures() {
        let broker = Arc::new(FakeBroker::default());
        let manager = NatsManager::new(broker.clone(), pool(2), &NatsConfig::default())
            .await
            .unwrap();
        broker.state.lock().unwrap().transient_publish_failures = 2;

        let sequence = manager
            .publish(&CancellationToken::new(), "checkout.orders.created", "{}")
            .await
            .unwrap();

        assert_eq!(sequence, 1);
        assert_eq!(broker.state.lock().unwrap().publish_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_gives_up_after_budget() {
        let broker = Arc::new(FakeBroker::default());
        let manager = NatsManager::new(broker.clone(), pool(2), &NatsConfig::default())
            .await
            .unwrap();
        broker.state.lock().unwrap().transient_publish_failures = 10;

        let err = manager
            .publish(&CancellationToken::new(), "checkout.orders.created", "{}")
            .await
            .unwrap_err();

        assert!(matches!(err, NatsError::PublishExhausted { attempts: 3, .. }));
        assert_eq!(broker.state.lock().unwrap().publish_attempts, 3);
    }

    #[tokio::test]
    async fn test_unrouted_subject_is_not_retried() {
        let broker = Arc::new(FakeBroker::default());
        let manager = NatsManager::new(broker.clone(), pool(2), &NatsConfig::default())
            .await
            .unwrap();

        let err = manager
            .publish(&CancellationToken::new(), "billing.invoices", "{}")
            .await
            .unwrap_err();

        assert!(matches!(err, NatsError::Broker(BrokerError::FeatureDisabled(_))));
        assert_eq!(broker.state.lock().unwrap().publish_attempts, 1);
    }

    #[tokio::test]
    async fn test_auto_ack_subscription_end_to_end() {
        let broker = Arc::new(FakeBroker::default());
        let manager = NatsManager::new(broker.clone(), pool(4), &NatsConfig::default())
            .await
            .unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let subscription = manager
            .subscribe_with(
                "checkout.orders.*",
                move |delivery: Delivery| {
                    let sink = sink.clone();
                    async move {
                        let order: serde_json::Value = delivery.json()?;
                        sink.lock().unwrap().push(order["id"].as_u64().unwrap_or_default());
                        Ok::<_, eyre::Report>(())
                    }
                },
                DeliveryOptions::default().with_ack_mode(AckMode::Auto),
            )
            .await
            .unwrap();
        assert_eq!(subscription.durable_name(), "CHECKOUT_checkout_orders_*");

        let ctx = CancellationToken::new();
        for id in 1..=5 {
            manager
                .publish(&ctx, "checkout.orders.created", format!("{{\"id\":{}}}", id))
                .await
                .unwrap();
        }

        wait_until(|| broker.acked().len() == 5).await;
        assert_eq!(broker.acked(), vec![1, 2, 3, 4, 5]);

        let mut ids = received.lock().unwrap().clone();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        subscription.unsubscribe().await;
    }

    #[tokio::test]
    async fn test_manual_mode_handler_decides() {
        let broker = Arc::new(FakeBroker::default());
        let manager = NatsManager::new(broker.clone(), pool(2), &NatsConfig::default())
            .await
            .unwrap();

        let subscription = manager
            .subscribe("checkout.orders.created", |delivery: Delivery| async move {
                if delivery.payload.as_ref() == b"poison" {
                    delivery.term().await?;
                } else {
                    delivery.ack().await?;
                }
                Ok::<_, eyre::Report>(())
            })
            .await
            .unwrap();
        assert_eq!(subscription.durable_name(), "CHECKOUT_checkout_orders_created");

        let ctx = CancellationToken::new();
        manager
            .publish(&ctx, "checkout.orders.created", "{}")
            .await
            .unwrap();
        manager
            .publish(&ctx, "checkout.orders.created", "poison")
            .await
            .unwrap();

        wait_until(|| broker.acks.lock().unwrap().len() == 2).await;
        let mut log = broker.acks.lock().unwrap().clone();
        log.sort();
        assert_eq!(log, vec![("ack".to_string(), 1), ("term".to_string(), 2)]);

        subscription.unsubscribe().await;
    }

    #[tokio::test]
    async fn test_failed_handler_leaves_message_unacked() {
        let broker = Arc::new(FakeBroker::default());
        let pool = pool(2);
        let manager = NatsManager::new(broker.clone(), pool.clone(), &NatsConfig::default())
            .await
            .unwrap();

        let subscription = manager
            .subscribe_with(
                "checkout.orders.created",
                |_delivery: Delivery| async { Err::<(), _>(eyre::eyre!("inventory unavailable")) },
                DeliveryOptions::default().with_ack_mode(AckMode::Auto),
            )
            .await
            .unwrap();

        manager
            .publish(&CancellationToken::new(), "checkout.orders.created", "{}")
            .await
            .unwrap();

        wait_until(|| pool.metrics().failed_tasks == 1).await;
        assert!(broker.acked().is_empty());
        subscription.unsubscribe().await;
    }
}

mod observability_tests {
    use super::*;

    #[tokio::test]
    async fn test_health_and_stats_reflect_stream() {
        let broker = Arc::new(FakeBroker::default());
        let config = NatsConfig::new(
            "nats://localhost:4222",
            StreamPolicy::new("CHECKOUT", "checkout.>").with_max_msgs(4),
        );
        let manager = NatsManager::new(broker.clone(), pool(3), &config)
            .await
            .unwrap();

        let ctx = CancellationToken::new();
        for _ in 0..4 {
            manager
                .publish(&ctx, "checkout.orders.created", "{}")
                .await
                .unwrap();
        }

        let report = manager.health_check().await.unwrap();
        assert_eq!(report.stream, "CHECKOUT");
        assert_eq!(report.current_msgs, 4);
        assert_eq!(report.usage_percentage, Some(100.0));
        assert!(report.warning);

        let map = manager.metrics().await.to_map();
        assert_eq!(map["stream_messages"], 4);
        assert_eq!(map["stream_bytes"], 8);
        assert_eq!(map["capacity"], 3);
        assert_eq!(map["completed_tasks"], 0);
    }

    #[tokio::test]
    async fn test_close_shuts_everything_down() {
        let broker = Arc::new(FakeBroker::default());
        let manager = NatsManager::new(broker.clone(), pool(2), &NatsConfig::default())
            .await
            .unwrap();

        let subscription = manager
            .subscribe("checkout.orders.created", |_delivery: Delivery| async {
                Ok::<_, eyre::Report>(())
            })
            .await
            .unwrap();
        assert_eq!(broker.state.lock().unwrap().consumers[0].durable, subscription.durable_name());

        manager.close().await.unwrap();
        assert!(broker.state.lock().unwrap().closed);
        assert!(manager.pool().is_closed());

        // The connection is gone: publishes fail instead of reaching the stream.
        let err = manager
            .publish(&CancellationToken::new(), "checkout.orders.created", "{}")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NatsError::PublishExhausted {
                source: BrokerError::Unavailable(_),
                ..
            }
        ));
        assert!(broker.state.lock().unwrap().streams["CHECKOUT"].messages.is_empty());

        // Consumers were dropped by the broker, so the dispatch loop ends on its own.
        wait_until(|| !subscription.is_active()).await;
        subscription.unsubscribe().await;
    }
}

mod jetstream_tests {
    use super::*;
    use test_utils::{assertions, TestDataBuilder, TestNats};

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_round_trip_against_jetstream() {
        let nats = TestNats::new().await;
        let data = TestDataBuilder::from_test_name("test_round_trip_against_jetstream");

        let stream = data.stream_name("checkout");
        let config = NatsConfig::new(
            nats.url(),
            StreamPolicy::new(stream.clone(), data.subject_wildcard()),
        );
        let manager = NatsManager::connect(&config, pool(4)).await.unwrap();

        // Second reconciliation against a real server is a no-op.
        assert_eq!(
            manager.ensure_stream().await.unwrap(),
            ReconcileOutcome::Unchanged
        );

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let subject = data.subject("orders", "created");
        let subscription = manager
            .subscribe_with(
                &subject,
                move |delivery: Delivery| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().unwrap().push(delivery.sequence);
                        Ok::<_, eyre::Report>(())
                    }
                },
                DeliveryOptions::default().with_ack_mode(AckMode::Auto),
            )
            .await
            .unwrap();

        let ctx = CancellationToken::new();
        let sequence = assertions::within(
            Duration::from_secs(5),
            "publish to JetStream",
            manager.publish(&ctx, &subject, "{}"),
        )
        .await
        .unwrap();
        assert_eq!(sequence, 1);

        wait_until(|| received.lock().unwrap().len() == 1).await;
        assert_eq!(*received.lock().unwrap(), vec![1]);

        let report = manager.health_check().await.unwrap();
        assert_eq!(report.stream, stream);

        subscription.unsubscribe().await;
        manager.close().await.unwrap();
        nats.delete_stream(&stream).await;
    }
}
