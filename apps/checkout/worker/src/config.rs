//! Configuration for the checkout worker

use core_config::server::ServerConfig;
use core_config::{env_duration, env_or_default, ConfigError, Environment, FromEnv};
use nats_manager::NatsConfig;
use std::time::Duration;
use worker_pool::PoolConfig;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub environment: Environment,
    /// Health, stats and metrics endpoints
    pub server: ServerConfig,
    pub nats: NatsConfig,
    pub pool: PoolConfig,
    /// Subject the worker consumes new orders from
    pub orders_subject: String,
    /// Subject accepted orders are published to
    pub accepted_subject: String,
    /// How long running handlers get to finish on shutdown
    pub shutdown_timeout: Duration,
}

impl FromEnv for WorkerConfig {
    /// Reads the `NATS_*`, `WORKER_POOL_*`, `HOST`/`PORT` and `APP_ENV`
    /// variables plus `ORDERS_SUBJECT`, `ACCEPTED_SUBJECT` and
    /// `SHUTDOWN_TIMEOUT`.
    fn from_env() -> Result<Self, ConfigError> {
        let mut pool = PoolConfig::from_env()?;
        if std::env::var("WORKER_POOL_NAME").is_err() {
            pool = pool.with_name("checkout");
        }

        Ok(Self {
            environment: Environment::from_env(),
            server: ServerConfig::from_env()?,
            nats: NatsConfig::from_env()?,
            pool,
            orders_subject: env_or_default("ORDERS_SUBJECT", "checkout.orders.created"),
            accepted_subject: env_or_default("ACCEPTED_SUBJECT", "checkout.orders.accepted"),
            shutdown_timeout: env_duration("SHUTDOWN_TIMEOUT", Duration::from_secs(30))?,
        })
    }
}
