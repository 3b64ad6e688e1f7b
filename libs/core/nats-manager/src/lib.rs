//! JetStream messaging reliability layer.
//!
//! - [`StreamReconciler`] creates or updates a stream so it matches a
//!   [`StreamPolicy`], idempotently.
//! - [`Publisher`] publishes with bounded retry and exponential backoff,
//!   honouring a [`CancellationToken`].
//! - [`SubscriptionDispatcher`] binds durable consumers and hands every
//!   delivery to a [`WorkerPool`].
//! - [`NatsManager`] ties them together and adds health and metrics.
//!
//! # Example
//!
//! ```rust,ignore
//! use nats_manager::{Delivery, NatsConfig, NatsManager};
//! use core_config::FromEnv;
//! use worker_pool::{PoolConfig, WorkerPool};
//!
//! let pool = Arc::new(WorkerPool::new(PoolConfig::from_env()?)?);
//! let manager = NatsManager::connect(&NatsConfig::from_env()?, pool).await?;
//!
//! let subscription = manager
//!     .subscribe("checkout.orders.created", |delivery: Delivery| async move {
//!         let order: Order = delivery.json()?;
//!         process(order).await?;
//!         delivery.ack().await?;
//!         Ok(())
//!     })
//!     .await?;
//!
//! let sequence = manager.publish(&ctx, "checkout.orders.created", payload).await?;
//! ```

pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod jetstream;
pub mod manager;
pub mod metrics;
pub mod publisher;
pub mod reconciler;

pub use broker::{Acknowledger, Broker, Delivery, DeliveryStream, StreamInfo};
pub use config::{
    durable_name, AckMode, DeliveryOptions, NatsConfig, ReplayPolicy, Retention, Storage,
    StreamPolicy,
};
pub use dispatcher::{MessageHandler, SubscriptionDispatcher, SubscriptionHandle};
pub use error::{BrokerError, NatsError};
pub use health::{health_router, HealthReport};
pub use jetstream::JetStreamBroker;
pub use manager::NatsManager;
pub use metrics::{init_metrics, ManagerMetrics, StreamStats};
pub use publisher::{Publisher, RetryPolicy};
pub use reconciler::{ReconcileOutcome, StreamReconciler};

pub use tokio_util::sync::CancellationToken;
pub use worker_pool::{PoolConfig, PoolError, WorkerPool};
