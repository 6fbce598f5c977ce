//! Resilient consumer pipeline for the fleet-dispatch messaging backbone:
//! drains `orders.created` deliveries, deduplicates them, looks up a nearby
//! driver, and drives the order FSM to `DISPATCHED` or `MANUAL_DISPATCH`.

pub mod config;
pub mod dispatch;
pub mod handler;
pub mod metrics;
pub mod repository;
