//! HTTP surface: order creation plus the composite health check. `/metrics`
//! is served on its own listener in `main.rs`, not through this router.

use crate::create_order::{CreateOrder, CreateOrderInput};
use crate::repository::SqlxOrderRepository;
use actix_web::{web, HttpRequest, HttpResponse};
use redis_utils::RedisPool;
use serde::Serialize;
use sqlx::PgPool;
use transactional_outbox::SqlxOutboxRepository;

pub type AppCreateOrder = CreateOrder<SqlxOrderRepository, SqlxOutboxRepository>;

pub async fn create_order(
    use_case: web::Data<AppCreateOrder>,
    body: web::Json<CreateOrderInput>,
    req: HttpRequest,
) -> Result<HttpResponse, error_types::ServiceError> {
    let trace_parent = req
        .headers()
        .get("traceparent")
        .and_then(|v| v.to_str().ok());
    let output = use_case.execute(body.into_inner(), trace_parent).await?;
    Ok(HttpResponse::Ok().json(output))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    database: bool,
    broker: bool,
    cache: bool,
}

/// Composite health check: DB ping, broker pool availability, Redis ping.
/// 200 when all three are up, 503 otherwise -- never panics on a dependency
/// outage, since this endpoint exists to report one.
pub async fn health(
    pool: web::Data<PgPool>,
    broker: web::Data<deadpool_lapin::Pool>,
    redis: web::Data<RedisPool>,
) -> HttpResponse {
    let database = sqlx::query("SELECT 1").execute(pool.get_ref()).await.is_ok();

    let broker = match broker.get().await {
        Ok(conn) => conn.status().connected(),
        Err(_) => false,
    };

    let manager = redis.manager();
    let cache = redis_utils::with_timeout(async {
        let mut conn = manager.lock().await;
        redis::cmd("PING").query_async::<_, String>(&mut *conn).await
    })
    .await
    .is_ok();

    let response = HealthResponse {
        status: if database && broker && cache { "healthy" } else { "degraded" },
        database,
        broker,
        cache,
    };

    if database && broker && cache {
        HttpResponse::Ok().json(response)
    } else {
        HttpResponse::ServiceUnavailable().json(response)
    }
}
