//! `async-nats` JetStream implementation of [`Broker`].

use crate::broker::{Acknowledger, Broker, Delivery, DeliveryStream, StreamInfo};
use crate::config::{DeliveryOptions, ReplayPolicy, Retention, Storage, StreamPolicy};
use crate::error::{BrokerError, NatsError};
use async_nats::jetstream::consumer::{pull, AckPolicy, DeliverPolicy};
use async_nats::jetstream::stream::{Config as StreamConfig, RetentionPolicy, StorageType};
use async_nats::jetstream::{self, AckKind, Context};
use async_nats::Client;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// JetStream-backed broker.
#[derive(Clone)]
pub struct JetStreamBroker {
    client: Client,
    jetstream: Context,
}

impl JetStreamBroker {
    /// Connect to a NATS server.
    pub async fn connect(url: &str) -> Result<Self, NatsError> {
        let client = async_nats::connect(url).await?;
        info!(server = %client.server_info().server_name, "Connected to NATS");
        Ok(Self::new(client))
    }

    /// Wrap an existing client.
    pub fn new(client: Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self { client, jetstream }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn jetstream(&self) -> &Context {
        &self.jetstream
    }
}

#[async_trait]
impl Broker for JetStreamBroker {
    async fn stream_info(&self, name: &str) -> Result<StreamInfo, BrokerError> {
        let mut stream = self
            .jetstream
            .get_stream(name)
            .await
            .map_err(BrokerError::from_jetstream_error)?;

        let info = stream
            .info()
            .await
            .map_err(BrokerError::from_jetstream_error)?;

        Ok(StreamInfo {
            config: from_stream_config(&info.config),
            messages: info.state.messages,
            bytes: info.state.bytes,
            consumer_count: info.state.consumer_count,
        })
    }

    async fn create_stream(&self, policy: &StreamPolicy) -> Result<(), BrokerError> {
        self.jetstream
            .create_stream(to_stream_config(policy))
            .await
            .map_err(BrokerError::from_jetstream_error)?;
        Ok(())
    }

    async fn update_stream(&self, policy: &StreamPolicy) -> Result<(), BrokerError> {
        self.jetstream
            .update_stream(to_stream_config(policy))
            .await
            .map_err(BrokerError::from_jetstream_error)?;
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<u64, BrokerError> {
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(BrokerError::from_jetstream_error)?
            .await
            .map_err(BrokerError::from_jetstream_error)?;

        Ok(ack.sequence)
    }

    async fn consume(
        &self,
        stream: &str,
        durable: &str,
        subject: &str,
        options: &DeliveryOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let stream = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(BrokerError::from_jetstream_error)?;

        let consumer = stream
            .get_or_create_consumer(durable, consumer_config(durable, subject, options))
            .await
            .map_err(BrokerError::from_jetstream_error)?;

        let messages = consumer
            .messages()
            .await
            .map_err(BrokerError::from_jetstream_error)?;

        debug!(consumer = %durable, subject = %subject, "Consumer bound");

        Ok(messages
            .map(|message| {
                message
                    .map(into_delivery)
                    .map_err(BrokerError::from_jetstream_error)
            })
            .boxed())
    }

    /// Flush pending publishes, unsubscribe everything and close the connection.
    async fn close(&self) -> Result<(), BrokerError> {
        self.client
            .drain()
            .await
            .map_err(BrokerError::from_jetstream_error)
    }
}

fn into_delivery(message: jetstream::Message) -> Delivery {
    let (sequence, delivered) = match message.info() {
        Ok(info) => (info.stream_sequence, info.delivered.max(1) as u64),
        Err(e) => {
            warn!(error = %e, "Failed to read message info, using defaults");
            (0, 1)
        }
    };
    let subject = message.subject.to_string();
    let payload = message.payload.clone();

    Delivery::new(
        subject,
        payload,
        sequence,
        delivered,
        Arc::new(JetStreamAcker { message }),
    )
}

struct JetStreamAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acknowledger for JetStreamAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.message
            .ack()
            .await
            .map_err(BrokerError::from_jetstream_error)
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), BrokerError> {
        self.message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(BrokerError::from_jetstream_error)
    }

    async fn term(&self) -> Result<(), BrokerError> {
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(BrokerError::from_jetstream_error)
    }
}

pub(crate) fn to_stream_config(policy: &StreamPolicy) -> StreamConfig {
    StreamConfig {
        name: policy.name.clone(),
        subjects: policy.subjects.clone(),
        storage: match policy.storage {
            Storage::Memory => StorageType::Memory,
            Storage::File => StorageType::File,
        },
        retention: match policy.retention {
            Retention::Limits => RetentionPolicy::Limits,
            Retention::WorkQueue => RetentionPolicy::WorkQueue,
            Retention::Interest => RetentionPolicy::Interest,
        },
        max_age: policy.max_age,
        max_messages: policy.max_msgs,
        max_bytes: policy.max_bytes,
        ..Default::default()
    }
}

pub(crate) fn from_stream_config(config: &StreamConfig) -> StreamPolicy {
    StreamPolicy {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        storage: match config.storage {
            StorageType::Memory => Storage::Memory,
            StorageType::File => Storage::File,
        },
        retention: match config.retention {
            RetentionPolicy::Limits => Retention::Limits,
            RetentionPolicy::WorkQueue => Retention::WorkQueue,
            RetentionPolicy::Interest => Retention::Interest,
        },
        max_age: config.max_age,
        max_msgs: config.max_messages,
        max_bytes: config.max_bytes,
    }
}

pub(crate) fn consumer_config(
    durable: &str,
    subject: &str,
    options: &DeliveryOptions,
) -> pull::Config {
    pull::Config {
        durable_name: Some(durable.to_string()),
        name: Some(durable.to_string()),
        // Auto mode is acked by the dispatcher, so the broker always expects explicit acks.
        ack_policy: AckPolicy::Explicit,
        ack_wait: options.ack_wait,
        max_deliver: options.max_deliver,
        deliver_policy: match options.replay {
            ReplayPolicy::All => DeliverPolicy::All,
            ReplayPolicy::New => DeliverPolicy::New,
            ReplayPolicy::Last => DeliverPolicy::Last,
        },
        filter_subject: subject.to_string(),
        ..Default::default()
    }
}
