//! `orders` table reads/updates on the Worker side. Trimmed relative to
//! `dispatch-api`'s repository: the Worker never inserts an order, only
//! reads one to drive the FSM and writes back its new status/driver_id --
//! each service owns its own persistence layer rather than sharing a
//! repository crate across a process boundary.

use async_trait::async_trait;
use error_types::ServiceError;
use order_domain::{Order, OrderStatus};
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use std::str::FromStr;

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Order>, ServiceError>;

    async fn update_status(&self, order: &Order) -> Result<(), ServiceError>;
}

pub struct SqlxOrderRepository {
    pool: PgPool,
}

impl SqlxOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderRepository for SqlxOrderRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<Order>, ServiceError> {
        let row = sqlx::query(
            "SELECT id, price, tax, final_price, status, driver_id FROM orders WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(ServiceError::from)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: String = row.try_get("id").map_err(ServiceError::from)?;
        let price: Decimal = row.try_get("price").map_err(ServiceError::from)?;
        let tax: Decimal = row.try_get("tax").map_err(ServiceError::from)?;
        let final_price: Decimal = row.try_get("final_price").map_err(ServiceError::from)?;
        let status_str: String = row.try_get("status").map_err(ServiceError::from)?;
        let driver_id: Option<String> = row.try_get("driver_id").map_err(ServiceError::from)?;

        let status = OrderStatus::from_str(&status_str)
            .map_err(|_| ServiceError::UnknownState(status_str))?;

        Ok(Some(Order::restore(
            id,
            price,
            tax,
            final_price,
            status,
            driver_id,
        )))
    }

    async fn update_status(&self, order: &Order) -> Result<(), ServiceError> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $1, driver_id = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(order.status.as_str())
        .bind(&order.driver_id)
        .bind(&order.id)
        .execute(&self.pool)
        .await
        .map_err(ServiceError::from)?;

        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound(order.id.clone()));
        }
        Ok(())
    }
}
