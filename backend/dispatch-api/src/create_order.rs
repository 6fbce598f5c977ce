//! The `CreateOrder` unit of work: validate, then write the `orders` row and
//! its `OrderCreated` outbox row in one transaction. Outbox-only -- this use
//! case never talks to the broker directly (see spec's Open Question (a)).

use crate::repository::OrderRepository;
use error_types::ServiceError;
use order_domain::Order;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use transactional_outbox::{OutboxEvent, OutboxRepository};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrderInput {
    pub id: String,
    pub price: Decimal,
    pub tax: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateOrderOutput {
    pub id: String,
    pub final_price: Decimal,
}

/// Minimal wire DTO carried in the outbox payload and published to
/// `orders.created`; deliberately narrower than the full `Order`.
#[derive(Debug, Serialize)]
struct OrderCreatedPayload {
    id: String,
    final_price: Decimal,
}

pub struct CreateOrder<OR, XR> {
    pool: PgPool,
    orders: Arc<OR>,
    outbox: Arc<XR>,
}

impl<OR, XR> CreateOrder<OR, XR>
where
    OR: OrderRepository,
    XR: OutboxRepository,
{
    pub fn new(pool: PgPool, orders: Arc<OR>, outbox: Arc<XR>) -> Self {
        Self {
            pool,
            orders,
            outbox,
        }
    }

    /// `trace_parent` is the inbound request's W3C `traceparent` header, if
    /// any; it rides along in the outbox row so the relay's publish carries
    /// it onto the broker message (spec §4.2).
    pub async fn execute(
        &self,
        input: CreateOrderInput,
        trace_parent: Option<&str>,
    ) -> Result<CreateOrderOutput, ServiceError> {
        let order = Order::new(input.id, input.price, input.tax)
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;

        let payload = serde_json::to_vec(&OrderCreatedPayload {
            id: order.id.clone(),
            final_price: order.final_price,
        })
        .map_err(|e| ServiceError::InternalError(e.to_string()))?;

        let event = OutboxEvent::new(
            "Order",
            order.id.clone(),
            "OrderCreated",
            1,
            payload,
            "orders.created",
        )
        .with_trace_parent(trace_parent);

        let mut tx = self.pool.begin().await.map_err(ServiceError::from)?;

        self.orders.insert(&mut tx, &order).await?;
        self.outbox
            .insert(&mut tx, &event)
            .await
            .map_err(|e| ServiceError::Database(e.to_string()))?;

        tx.commit().await.map_err(ServiceError::from)?;

        Ok(CreateOrderOutput {
            id: order.id,
            final_price: order.final_price,
        })
    }
}
