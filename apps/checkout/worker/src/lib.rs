//! Checkout worker
//!
//! Consumes `OrderCreated` events from JetStream, validates them on a bounded
//! worker pool and republishes accepted orders.
//!
//! ```text
//! NATS JetStream (CHECKOUT stream)
//!   ↓ (durable pull consumer: CHECKOUT_checkout_orders_created)
//! SubscriptionDispatcher
//!   ↓ (one task per delivery)
//! WorkerPool → OrderHandler
//!   ↓ (publish with retry, then ack)
//! checkout.orders.accepted
//! ```
//!
//! Health probes, `/stats` and Prometheus `/metrics` are served on `HOST:PORT`.

pub mod config;
pub mod handlers;

use crate::config::WorkerConfig;
use crate::handlers::OrderHandler;
use core_config::FromEnv;
use eyre::{Result, WrapErr};
use nats_manager::{health_router, CancellationToken, NatsManager, SubscriptionHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use worker_pool::WorkerPool;

/// Run the worker until SIGINT or SIGTERM.
///
/// Shutdown order: stop pulling deliveries, let running handlers finish
/// within `SHUTDOWN_TIMEOUT`, then close the broker connection.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();

    let config = WorkerConfig::from_env().wrap_err("Failed to load configuration")?;
    core_config::tracing::init_tracing(&config.environment);

    let metrics_handle = nats_manager::init_metrics()
        .wrap_err("Failed to install Prometheus recorder")?
        .clone();

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        environment = ?config.environment,
        "Starting checkout worker"
    );

    let pool = Arc::new(
        WorkerPool::new(config.pool.clone()).wrap_err("Failed to create worker pool")?,
    );

    let manager = Arc::new(
        NatsManager::connect(&config.nats, pool.clone())
            .await
            .wrap_err_with(|| format!("Failed to start NATS manager for {}", config.nats.url))?,
    );

    // Handlers publish under their own token so the drain can finish them.
    let publish_ctx = CancellationToken::new();
    let server_shutdown = CancellationToken::new();

    let handler = OrderHandler::new(
        manager.clone(),
        publish_ctx.clone(),
        config.accepted_subject.clone(),
    );
    let subscription = manager
        .subscribe(&config.orders_subject, handler)
        .await
        .wrap_err_with(|| format!("Failed to subscribe to {}", config.orders_subject))?;

    let listener = tokio::net::TcpListener::bind(config.server.address())
        .await
        .wrap_err_with(|| format!("Failed to bind {}", config.server.address()))?;
    info!(addr = %config.server.address(), "Health server listening");

    let router = health_router(manager.clone(), Some(metrics_handle));
    let server_token = server_shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_token.cancelled().await })
            .await
    });

    shutdown_signal().await;

    drain(subscription, &pool, &publish_ctx, config.shutdown_timeout).await;

    let closed = manager.close().await;
    server_shutdown.cancel();
    closed.wrap_err("Failed to close NATS manager")?;

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Health server failed"),
        Err(e) => error!(error = %e, "Health server task panicked"),
    }

    info!("Checkout worker stopped");
    Ok(())
}

/// Stop pulling orders and let running handlers finish within `timeout`.
///
/// `publish_ctx` is cancelled only once the pool has drained or timed out, so
/// handlers still running can publish their result and ack.
pub async fn drain(
    subscription: SubscriptionHandle,
    pool: &WorkerPool,
    publish_ctx: &CancellationToken,
    timeout: Duration,
) {
    subscription.unsubscribe().await;

    if let Err(e) = pool.graceful_shutdown(timeout).await {
        warn!(error = %e, "Worker pool did not drain in time");
    }

    publish_ctx.cancel();
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating shutdown..."),
    }
}
