//! Order aggregate and its dispatch-lifecycle state machine.
//!
//! The state space is closed and small: `PENDING`, `MANUAL_DISPATCH`,
//! `DISPATCHED`, `DELIVERED`, `CANCELLED`. Rather than one struct per state
//! implementing a shared trait, the aggregate holds a single `OrderStatus`
//! tag and all transitions go through [`Order::apply`].

mod error;

pub use error::{OrderError, OrderResult};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current position of an order in its dispatch lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "MANUAL_DISPATCH")]
    ManualDispatch,
    #[serde(rename = "DISPATCHED")]
    Dispatched,
    #[serde(rename = "DELIVERED")]
    Delivered,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::ManualDispatch => "MANUAL_DISPATCH",
            OrderStatus::Dispatched => "DISPATCHED",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "MANUAL_DISPATCH" => Ok(OrderStatus::ManualDispatch),
            "DISPATCHED" => Ok(OrderStatus::Dispatched),
            "DELIVERED" => Ok(OrderStatus::Delivered),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            other => Err(OrderError::UnknownState(other.to_string())),
        }
    }
}

/// A transition request applied to an [`Order`].
///
/// `Dispatch` carries the driver assigned by the location lookup (or by a
/// human operator, in the manual-dispatch fallback path).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderEvent {
    Dispatch { driver_id: String },
    SendToManual,
    Deliver,
    Cancel,
}

impl OrderEvent {
    fn name(&self) -> &'static str {
        match self {
            OrderEvent::Dispatch { .. } => "Dispatch",
            OrderEvent::SendToManual => "SendToManual",
            OrderEvent::Deliver => "Deliver",
            OrderEvent::Cancel => "Cancel",
        }
    }
}

/// The order aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub price: Decimal,
    pub tax: Decimal,
    pub final_price: Decimal,
    pub status: OrderStatus,
    pub driver_id: Option<String>,
}

impl Order {
    /// Construct and validate a brand-new order. `final_price` is computed,
    /// never taken from the caller.
    pub fn new(id: impl Into<String>, price: Decimal, tax: Decimal) -> OrderResult<Self> {
        let id = id.into();
        Self::validate(&id, price, tax)?;

        Ok(Self {
            id,
            price,
            tax,
            final_price: price + tax,
            status: OrderStatus::Pending,
            driver_id: None,
        })
    }

    /// Rebuild an order from persisted state. Skips creation-time validation
    /// since a row in the database has already passed it once.
    pub fn restore(
        id: impl Into<String>,
        price: Decimal,
        tax: Decimal,
        final_price: Decimal,
        status: OrderStatus,
        driver_id: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            price,
            tax,
            final_price,
            status,
            driver_id,
        }
    }

    fn validate(id: &str, price: Decimal, tax: Decimal) -> OrderResult<()> {
        if id.is_empty() {
            return Err(OrderError::IdRequired);
        }
        if price <= Decimal::ZERO {
            return Err(OrderError::PriceMustBePositive);
        }
        if tax < Decimal::ZERO {
            return Err(OrderError::TaxMustBeNonNegative);
        }
        Ok(())
    }

    /// Apply a transition, mutating `status` (and `driver_id`, where the
    /// event carries one) in place, or reject it if it is not valid from the
    /// current state.
    pub fn apply(&mut self, event: OrderEvent) -> OrderResult<()> {
        use OrderStatus::*;

        let invalid = || OrderError::InvalidStateTransition {
            from: self.status.to_string(),
            event: event.name().to_string(),
        };

        match (self.status, &event) {
            (Pending, OrderEvent::Dispatch { driver_id }) => {
                self.driver_id = Some(driver_id.clone());
                self.status = Dispatched;
            }
            (Pending, OrderEvent::SendToManual) => {
                self.status = ManualDispatch;
            }
            (Pending, OrderEvent::Cancel) => {
                self.status = Cancelled;
            }
            (ManualDispatch, OrderEvent::Dispatch { driver_id }) => {
                self.driver_id = Some(driver_id.clone());
                self.status = Dispatched;
            }
            (ManualDispatch, OrderEvent::Cancel) => {
                self.status = Cancelled;
            }
            (Dispatched, OrderEvent::Deliver) => {
                self.status = Delivered;
            }
            (Dispatched, OrderEvent::Cancel) => {
                self.status = Cancelled;
            }
            _ => return Err(invalid()),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn new_order_computes_final_price() {
        let order = Order::new("123", dec!(10.0), dec!(2.0)).unwrap();
        assert_eq!(order.final_price, dec!(12.0));
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.driver_id, None);
    }

    #[test]
    fn new_order_validation_errors() {
        assert_eq!(
            Order::new("", dec!(10.0), dec!(2.0)).unwrap_err(),
            OrderError::IdRequired
        );
        assert_eq!(
            Order::new("123", dec!(0.0), dec!(2.0)).unwrap_err(),
            OrderError::PriceMustBePositive
        );
        assert_eq!(
            Order::new("123", dec!(10.0), dec!(-1.0)).unwrap_err(),
            OrderError::TaxMustBeNonNegative
        );
    }

    #[test]
    fn pending_dispatch_sets_driver_and_moves_to_dispatched() {
        let mut order = Order::new("o1", dec!(10.0), dec!(2.0)).unwrap();
        order
            .apply(OrderEvent::Dispatch {
                driver_id: "d7".to_string(),
            })
            .unwrap();
        assert_eq!(order.status, OrderStatus::Dispatched);
        assert_eq!(order.driver_id.as_deref(), Some("d7"));
    }

    #[test]
    fn pending_send_to_manual_then_dispatch() {
        let mut order = Order::new("o1", dec!(10.0), dec!(2.0)).unwrap();
        order.apply(OrderEvent::SendToManual).unwrap();
        assert_eq!(order.status, OrderStatus::ManualDispatch);

        order
            .apply(OrderEvent::Dispatch {
                driver_id: "d9".to_string(),
            })
            .unwrap();
        assert_eq!(order.status, OrderStatus::Dispatched);
        assert_eq!(order.driver_id.as_deref(), Some("d9"));
    }

    #[test]
    fn dispatched_deliver_is_terminal() {
        let mut order = Order::new("o1", dec!(10.0), dec!(2.0)).unwrap();
        order
            .apply(OrderEvent::Dispatch {
                driver_id: "d7".to_string(),
            })
            .unwrap();
        order.apply(OrderEvent::Deliver).unwrap();
        assert_eq!(order.status, OrderStatus::Delivered);

        let err = order.apply(OrderEvent::Cancel).unwrap_err();
        assert_eq!(
            err,
            OrderError::InvalidStateTransition {
                from: "DELIVERED".to_string(),
                event: "Cancel".to_string(),
            }
        );
    }

    #[test]
    fn cancel_is_reachable_from_pending_manual_and_dispatched_but_not_after() {
        let mut pending = Order::new("o1", dec!(10.0), dec!(2.0)).unwrap();
        pending.apply(OrderEvent::Cancel).unwrap();
        assert_eq!(pending.status, OrderStatus::Cancelled);

        let err = pending.apply(OrderEvent::Cancel).unwrap_err();
        assert!(matches!(err, OrderError::InvalidStateTransition { .. }));
    }

    #[test]
    fn deliver_on_pending_order_is_invalid() {
        let mut order = Order::new("o1", dec!(10.0), dec!(2.0)).unwrap();
        let err = order.apply(OrderEvent::Deliver).unwrap_err();
        assert_eq!(
            err,
            OrderError::InvalidStateTransition {
                from: "PENDING".to_string(),
                event: "Deliver".to_string(),
            }
        );
    }

    #[test]
    fn dispatch_twice_is_invalid() {
        let mut order = Order::new("o1", dec!(10.0), dec!(2.0)).unwrap();
        order
            .apply(OrderEvent::Dispatch {
                driver_id: "d7".to_string(),
            })
            .unwrap();
        let err = order
            .apply(OrderEvent::Dispatch {
                driver_id: "d8".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, OrderError::InvalidStateTransition { .. }));
        assert_eq!(order.driver_id.as_deref(), Some("d7"));
    }

    #[test]
    fn status_round_trips_through_string() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::ManualDispatch,
            OrderStatus::Dispatched,
            OrderStatus::Delivered,
            OrderStatus::Cancelled,
        ] {
            let parsed: OrderStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn unknown_status_string_is_rejected() {
        let err = "SOMETHING_ELSE".parse::<OrderStatus>().unwrap_err();
        assert_eq!(err, OrderError::UnknownState("SOMETHING_ELSE".to_string()));
    }

    #[test]
    fn order_serializes_with_screaming_snake_case_status() {
        let order = Order::new("o1", dec!(10.0), dec!(2.0)).unwrap();
        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["status"], "PENDING");
    }
}
