//! Error types for the NATS manager.

use thiserror::Error;
use worker_pool::PoolError;

/// Failure reported by a [`Broker`](crate::Broker) call.
///
/// JetStream reports most failures as text, so classification works on the
/// rendered error message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The named stream does not exist
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// Another stream already owns one of the subjects
    #[error("Subjects overlap with an existing stream: {0}")]
    SubjectsOverlap(String),

    /// The server does not have JetStream enabled
    #[error("JetStream not enabled: {0}")]
    FeatureDisabled(String),

    /// The publish acknowledgement could not be understood
    #[error("Invalid publish acknowledgement: {0}")]
    InvalidAck(String),

    /// The server could not be reached
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The request timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Any other JetStream failure
    #[error("JetStream error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Classify an `async_nats` error by its message.
    pub fn from_jetstream_error(error: impl std::fmt::Display) -> Self {
        let message = error.to_string();
        let lowered = message.to_lowercase();

        if lowered.contains("stream not found") {
            BrokerError::StreamNotFound(message)
        } else if lowered.contains("subjects overlap") {
            BrokerError::SubjectsOverlap(message)
        } else if lowered.contains("jetstream not enabled")
            || lowered.contains("jetstream unavailable")
            || lowered.contains("no responders")
        {
            BrokerError::FeatureDisabled(message)
        } else if lowered.contains("ack")
            && (lowered.contains("invalid")
                || lowered.contains("parse")
                || lowered.contains("deserializ"))
        {
            BrokerError::InvalidAck(message)
        } else if lowered.contains("timed out") || lowered.contains("timeout") {
            BrokerError::Timeout(message)
        } else if lowered.contains("connection")
            || lowered.contains("disconnected")
            || lowered.contains("broken pipe")
            || lowered.contains("not connected")
        {
            BrokerError::Unavailable(message)
        } else {
            BrokerError::Other(message)
        }
    }

    /// Whether a publish that failed with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            BrokerError::FeatureDisabled(_) | BrokerError::InvalidAck(_)
        )
    }
}

/// Error returned by manager operations.
#[derive(Debug, Error)]
pub enum NatsError {
    /// NATS connection error
    #[error("NATS connection error: {0}")]
    Connection(#[from] async_nats::ConnectError),

    /// Broker call failed
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Stream exists but could not be brought in line with the desired policy
    #[error("Failed to update stream {stream}: {source}")]
    StreamUpdate {
        stream: String,
        #[source]
        source: BrokerError,
    },

    /// The caller's context was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Every publish attempt failed with a retryable error
    #[error("Failed to publish after {attempts} attempts: {source}")]
    PublishExhausted {
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    /// Worker pool error
    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl NatsError {
    /// Errors that should stop the process from starting.
    pub fn is_fatal(&self) -> bool {
        match self {
            NatsError::Connection(_) | NatsError::Config(_) => true,
            NatsError::Broker(e) => matches!(
                e,
                BrokerError::Unavailable(_) | BrokerError::FeatureDisabled(_)
            ),
            _ => false,
        }
    }
}

impl From<core_config::ConfigError> for NatsError {
    fn from(error: core_config::ConfigError) -> Self {
        NatsError::Config(error.to_string())
    }
}
