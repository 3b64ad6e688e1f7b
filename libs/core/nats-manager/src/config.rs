//! Stream policy, delivery options and environment configuration.

use crate::error::NatsError;
use core_config::{env_duration, env_or_default, env_parse, ConfigError, FromEnv};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Where the broker keeps stream data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Storage {
    Memory,
    File,
}

impl FromStr for Storage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Storage::Memory),
            "file" => Ok(Storage::File),
            other => Err(format!("unknown storage '{}', expected memory or file", other)),
        }
    }
}

/// When the broker may discard stored messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    /// Keep until a limit (age, count, bytes) is hit
    Limits,
    /// Remove once acknowledged by a consumer
    WorkQueue,
    /// Keep while at least one consumer is interested
    Interest,
}

impl FromStr for Retention {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "limits" => Ok(Retention::Limits),
            "workqueue" => Ok(Retention::WorkQueue),
            "interest" => Ok(Retention::Interest),
            other => Err(format!(
                "unknown retention '{}', expected limits, workqueue or interest",
                other
            )),
        }
    }
}

/// Desired configuration of a stream.
///
/// The name and subjects identify the stream; reconciliation only brings the
/// limit, storage and retention fields in line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamPolicy {
    pub name: String,
    pub subjects: Vec<String>,
    pub storage: Storage,
    pub retention: Retention,
    pub max_age: Duration,
    /// Maximum stored messages, `<= 0` means unlimited
    pub max_msgs: i64,
    /// Maximum stored bytes, `<= 0` means unlimited
    pub max_bytes: i64,
}

impl StreamPolicy {
    /// Policy with the manager defaults: memory storage, work-queue retention,
    /// 24h max age, 10 000 messages, 1 GiB.
    pub fn new(name: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subjects: vec![subject.into()],
            storage: Storage::Memory,
            retention: Retention::WorkQueue,
            max_age: Duration::from_secs(24 * 60 * 60),
            max_msgs: 10_000,
            max_bytes: 1024 * 1024 * 1024,
        }
    }

    pub fn with_subjects(mut self, subjects: Vec<String>) -> Self {
        self.subjects = subjects;
        self
    }

    pub fn with_storage(mut self, storage: Storage) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_max_msgs(mut self, max_msgs: i64) -> Self {
        self.max_msgs = max_msgs;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: i64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Names of the reconciled fields where `self` differs from `desired`.
    ///
    /// Subjects are compared in order.
    pub fn diff(&self, desired: &StreamPolicy) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.max_age != desired.max_age {
            changed.push("max_age");
        }
        if self.max_msgs != desired.max_msgs {
            changed.push("max_msgs");
        }
        if self.max_bytes != desired.max_bytes {
            changed.push("max_bytes");
        }
        if self.storage != desired.storage {
            changed.push("storage");
        }
        if self.retention != desired.retention {
            changed.push("retention");
        }
        if self.subjects != desired.subjects {
            changed.push("subjects");
        }
        changed
    }

    pub fn validate(&self) -> Result<(), NatsError> {
        if self.name.trim().is_empty() {
            return Err(NatsError::Config("stream name must not be empty".into()));
        }
        if self.subjects.is_empty() || self.subjects.iter().any(|s| s.trim().is_empty()) {
            return Err(NatsError::Config(format!(
                "stream {} needs at least one non-empty subject",
                self.name
            )));
        }
        Ok(())
    }
}

/// Who acknowledges a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// The handler acks, naks or terminates the delivery itself
    Manual,
    /// The dispatcher acks after the handler returns `Ok`
    Auto,
}

/// Where a new durable consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
    All,
    New,
    Last,
}

/// Per-subscription consumer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryOptions {
    pub ack_mode: AckMode,
    /// Redelivery delay for unacknowledged messages
    pub ack_wait: Duration,
    /// Delivery attempts before the broker gives up on a message
    pub max_deliver: i64,
    pub replay: ReplayPolicy,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::Manual,
            ack_wait: Duration::from_secs(5),
            max_deliver: 3,
            replay: ReplayPolicy::All,
        }
    }
}

impl DeliveryOptions {
    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: i64) -> Self {
        self.max_deliver = max_deliver;
        self
    }

    pub fn with_replay(mut self, replay: ReplayPolicy) -> Self {
        self.replay = replay;
        self
    }
}

/// Durable consumer name for a subject: `prefix` + subject with `.` replaced by `_`.
///
/// ```
/// assert_eq!(
///     nats_manager::durable_name("CHECKOUT_", "orders.created"),
///     "CHECKOUT_orders_created"
/// );
/// ```
pub fn durable_name(prefix: &str, subject: &str) -> String {
    format!("{}{}", prefix, subject.replace('.', "_"))
}

/// Full manager configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct NatsConfig {
    pub url: String,
    pub stream: StreamPolicy,
    pub durable_prefix: String,
    pub delivery: DeliveryOptions,
}

impl NatsConfig {
    pub fn new(url: impl Into<String>, stream: StreamPolicy) -> Self {
        Self {
            url: url.into(),
            stream,
            durable_prefix: "CHECKOUT_".to_string(),
            delivery: DeliveryOptions::default(),
        }
    }

    pub fn with_durable_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.durable_prefix = prefix.into();
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryOptions) -> Self {
        self.delivery = delivery;
        self
    }
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self::new(
            "nats://localhost:4222",
            StreamPolicy::new("CHECKOUT", "checkout.>"),
        )
    }
}

// Credentials may be embedded in the URL, keep them out of logs.
impl fmt::Debug for NatsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let url = match self.url.split_once('@') {
            Some((scheme_and_auth, host)) => {
                let scheme = scheme_and_auth
                    .split_once("://")
                    .map(|(scheme, _)| scheme)
                    .unwrap_or("nats");
                format!("{}://***@{}", scheme, host)
            }
            None => self.url.clone(),
        };

        f.debug_struct("NatsConfig")
            .field("url", &url)
            .field("stream", &self.stream)
            .field("durable_prefix", &self.durable_prefix)
            .field("delivery", &self.delivery)
            .finish()
    }
}

impl FromEnv for NatsConfig {
    /// Reads `NATS_*` variables. `NATS_SUBJECT` may list several subjects
    /// separated by commas.
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let policy = defaults.stream;

        let subjects = match std::env::var("NATS_SUBJECT") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            Err(_) => policy.subjects,
        };

        let stream = StreamPolicy {
            name: env_or_default("NATS_STREAM_NAME", &policy.name),
            subjects,
            storage: env_parse("NATS_STORAGE", policy.storage)?,
            retention: env_parse("NATS_RETENTION", policy.retention)?,
            max_age: env_duration("NATS_MAX_AGE", policy.max_age)?,
            max_msgs: env_parse("NATS_MAX_MSGS", policy.max_msgs)?,
            max_bytes: env_parse("NATS_MAX_BYTES", policy.max_bytes)?,
        };

        let delivery = DeliveryOptions {
            ack_wait: env_duration("NATS_ACK_WAIT", defaults.delivery.ack_wait)?,
            max_deliver: env_parse("NATS_MAX_DELIVER", defaults.delivery.max_deliver)?,
            ..defaults.delivery
        };

        Ok(Self {
            url: env_or_default("NATS_URL", &defaults.url),
            stream,
            durable_prefix: env_or_default("NATS_DURABLE_PREFIX", &defaults.durable_prefix),
            delivery,
        })
    }
}
