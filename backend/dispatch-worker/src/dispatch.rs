//! The `Dispatch`/`SendToManual` use case (spec §4.6): locate the order,
//! apply the FSM transition the location lookup's outcome calls for, and
//! persist the new status. Idempotent at the call level only in the sense
//! that `Order::apply` rejects re-entry into an already-left state --
//! duplicate-delivery protection is the idempotency guard's job, upstream
//! of this use case.

use crate::repository::OrderRepository;
use error_types::ServiceError;
use order_domain::OrderEvent;

pub struct Dispatch<OR> {
    orders: OR,
}

impl<OR: OrderRepository> Dispatch<OR> {
    pub fn new(orders: OR) -> Self {
        Self { orders }
    }

    /// A driver was found: transition the order to `DISPATCHED`.
    pub async fn dispatch_to_driver(
        &self,
        order_id: &str,
        driver_id: String,
    ) -> Result<(), ServiceError> {
        self.transition(order_id, OrderEvent::Dispatch { driver_id })
            .await
    }

    /// No driver was found, or the location lookup's circuit is open:
    /// transition the order to `MANUAL_DISPATCH` for operator pickup.
    pub async fn send_to_manual(&self, order_id: &str) -> Result<(), ServiceError> {
        self.transition(order_id, OrderEvent::SendToManual).await
    }

    async fn transition(&self, order_id: &str, event: OrderEvent) -> Result<(), ServiceError> {
        let mut order = self
            .orders
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(order_id.to_string()))?;

        order.apply(event)?;
        self.orders.update_status(&order).await
    }
}
