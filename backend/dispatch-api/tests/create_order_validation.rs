//! `CreateOrder` validation is rejected before any repository is touched, so
//! these run against a lazily-connected pool that is never actually dialed.

use dispatch_api::create_order::{CreateOrder, CreateOrderInput};
use dispatch_api::repository::SqlxOrderRepository;
use error_types::ServiceError;
use rust_decimal_macros::dec;
use sqlx::PgPool;
use std::sync::Arc;
use transactional_outbox::SqlxOutboxRepository;

fn use_case() -> CreateOrder<SqlxOrderRepository, SqlxOutboxRepository> {
    let pool = PgPool::connect_lazy("postgres://localhost/unused")
        .expect("lazy pool construction does not dial the network");
    let orders = Arc::new(SqlxOrderRepository::new(pool.clone()));
    let outbox = Arc::new(SqlxOutboxRepository::new(pool.clone()));
    CreateOrder::new(pool, orders, outbox)
}

#[tokio::test]
async fn empty_id_is_rejected_without_touching_the_database() {
    let result = use_case()
        .execute(CreateOrderInput {
            id: String::new(),
            price: dec!(10.0),
            tax: dec!(2.0),
        })
        .await;

    assert!(matches!(result, Err(ServiceError::ValidationError(_))));
}

#[tokio::test]
async fn non_positive_price_is_rejected() {
    let result = use_case()
        .execute(CreateOrderInput {
            id: "o1".to_string(),
            price: dec!(0),
            tax: dec!(2.0),
        })
        .await;

    assert!(matches!(result, Err(ServiceError::ValidationError(_))));
}

#[tokio::test]
async fn negative_tax_is_rejected() {
    let result = use_case()
        .execute(CreateOrderInput {
            id: "o1".to_string(),
            price: dec!(10.0),
            tax: dec!(-1.0),
        })
        .await;

    assert!(matches!(result, Err(ServiceError::ValidationError(_))));
}
