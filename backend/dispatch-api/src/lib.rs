//! HTTP front door and embedded outbox relay for the fleet-dispatch
//! messaging backbone: accepts `POST /api/v1/orders`, persists the order and
//! its `OrderCreated` event atomically, and drains that outbox into the
//! broker.

pub mod config;
pub mod create_order;
pub mod handlers;
pub mod repository;
