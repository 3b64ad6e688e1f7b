//! Broker abstraction.
//!
//! Everything the manager needs from JetStream goes through [`Broker`], so
//! reconciliation, publishing and dispatch can be tested without a server.

use crate::config::{DeliveryOptions, StreamPolicy};
use crate::error::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Effective configuration and state of an existing stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub config: StreamPolicy,
    pub messages: u64,
    pub bytes: u64,
    pub consumer_count: usize,
}

/// Inbound deliveries for one durable consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Message broker operations used by the manager.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Look up a stream. Missing streams are reported as `StreamNotFound`.
    async fn stream_info(&self, name: &str) -> Result<StreamInfo, BrokerError>;

    async fn create_stream(&self, policy: &StreamPolicy) -> Result<(), BrokerError>;

    async fn update_stream(&self, policy: &StreamPolicy) -> Result<(), BrokerError>;

    /// Publish and wait for the broker acknowledgement. Returns the stream sequence.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<u64, BrokerError>;

    /// Bind (creating if needed) a durable consumer and stream its deliveries.
    async fn consume(
        &self,
        stream: &str,
        durable: &str,
        subject: &str,
        options: &DeliveryOptions,
    ) -> Result<DeliveryStream, BrokerError>;

    /// Flush pending work and let go of the connection.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Acknowledgement handle of a single delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Processing succeeded.
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Processing failed, redeliver (after `delay` when given).
    async fn nak(&self, delay: Option<Duration>) -> Result<(), BrokerError>;

    /// Never redeliver.
    async fn term(&self) -> Result<(), BrokerError>;
}

/// A message received from a durable consumer.
///
/// Cloning is cheap; clones share the acknowledgement handle.
#[derive(Clone)]
pub struct Delivery {
    pub subject: String,
    pub payload: Bytes,
    /// Broker-assigned stream sequence
    pub sequence: u64,
    /// Number of times this message has been delivered, starting at 1
    pub delivered: u64,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        subject: impl Into<String>,
        payload: Bytes,
        sequence: u64,
        delivered: u64,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            sequence,
            delivered,
            acker,
        }
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivered > 1
    }

    /// Deserialize the payload as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn nak(&self, delay: Option<Duration>) -> Result<(), BrokerError> {
        self.acker.nak(delay).await
    }

    pub async fn term(&self) -> Result<(), BrokerError> {
        self.acker.term().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("sequence", &self.sequence)
            .field("delivered", &self.delivered)
            .finish()
    }
}
