//! Order event handling

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::WrapErr;
use nats_manager::{CancellationToken, Delivery, MessageHandler, NatsManager};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub sku: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

/// Published by the storefront when a customer places an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub currency: String,
    pub items: Vec<LineItem>,
    pub created_at: DateTime<Utc>,
}

/// Published by this worker once an order passed validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAccepted {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub currency: String,
    pub total_cents: i64,
    pub item_count: u32,
    pub accepted_at: DateTime<Utc>,
}

/// Why an order can never be accepted. Rejected orders are not redelivered.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrderRejection {
    #[error("order has no line items")]
    NoItems,

    #[error("line item {sku} has zero quantity")]
    ZeroQuantity { sku: String },

    #[error("line item {sku} has a negative price")]
    NegativePrice { sku: String },

    #[error("currency '{0}' is not an ISO 4217 code")]
    InvalidCurrency(String),

    #[error("order total overflows")]
    TotalOverflow,
}

/// Validate an order and compute its total.
pub fn accept_order(
    order: &OrderCreated,
    now: DateTime<Utc>,
) -> Result<OrderAccepted, OrderRejection> {
    if order.items.is_empty() {
        return Err(OrderRejection::NoItems);
    }
    if order.currency.len() != 3 || !order.currency.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(OrderRejection::InvalidCurrency(order.currency.clone()));
    }

    let mut total_cents: i64 = 0;
    let mut item_count: u32 = 0;
    for item in &order.items {
        if item.quantity == 0 {
            return Err(OrderRejection::ZeroQuantity {
                sku: item.sku.clone(),
            });
        }
        if item.unit_price_cents < 0 {
            return Err(OrderRejection::NegativePrice {
                sku: item.sku.clone(),
            });
        }

        let line = item
            .unit_price_cents
            .checked_mul(i64::from(item.quantity))
            .ok_or(OrderRejection::TotalOverflow)?;
        total_cents = total_cents
            .checked_add(line)
            .ok_or(OrderRejection::TotalOverflow)?;
        item_count = item_count.saturating_add(item.quantity);
    }

    Ok(OrderAccepted {
        order_id: order.order_id,
        customer_id: order.customer_id,
        currency: order.currency.clone(),
        total_cents,
        item_count,
        accepted_at: now,
    })
}

/// Accepts or rejects `OrderCreated` deliveries.
///
/// Accepted orders are republished before the delivery is acked, so a failed
/// publish leaves the order for redelivery. Undecodable or invalid orders are
/// terminated.
pub struct OrderHandler {
    manager: Arc<NatsManager>,
    ctx: CancellationToken,
    accepted_subject: String,
}

impl OrderHandler {
    pub fn new(
        manager: Arc<NatsManager>,
        ctx: CancellationToken,
        accepted_subject: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            ctx,
            accepted_subject: accepted_subject.into(),
        }
    }
}

#[async_trait]
impl MessageHandler for OrderHandler {
    async fn handle(&self, delivery: Delivery) -> eyre::Result<()> {
        let order: OrderCreated = match delivery.json() {
            Ok(order) => order,
            Err(e) => {
                warn!(
                    sequence = delivery.sequence,
                    error = %e,
                    "Undecodable order event, terminating"
                );
                delivery.term().await?;
                return Ok(());
            }
        };

        let accepted = match accept_order(&order, Utc::now()) {
            Ok(accepted) => accepted,
            Err(rejection) => {
                warn!(
                    order_id = %order.order_id,
                    sequence = delivery.sequence,
                    reason = %rejection,
                    "Order rejected"
                );
                delivery.term().await?;
                return Ok(());
            }
        };

        let payload = serde_json::to_vec(&accepted)?;
        let sequence = self
            .manager
            .publish(&self.ctx, &self.accepted_subject, payload)
            .await
            .wrap_err_with(|| format!("Failed to publish acceptance of order {}", order.order_id))?;

        delivery.ack().await?;

        info!(
            order_id = %order.order_id,
            total_cents = accepted.total_cents,
            redelivery = delivery.is_redelivery(),
            accepted_sequence = sequence,
            "Order accepted"
        );
        Ok(())
    }
}
