//! `dispatch-worker`
//!
//! Resilient consumer for the fleet-dispatch messaging backbone. Drains
//! `orders.created`, deduplicates each delivery, looks up a nearby driver
//! through the location service, and drives the order FSM to `DISPATCHED`
//! or `MANUAL_DISPATCH`. Retries ride the broker's wait-queue TTL; after
//! `MAX_RETRIES` deaths a message is parked for operator triage.
//!
//! # Routes
//!
//! - `GET /health` - composite DB/broker/cache health, container liveness/readiness probe
//! - `GET /metrics` (separate port) - Prometheus exposition

use actix_web::{web, App, HttpResponse, HttpServer};
use dispatch_worker::config::Settings;
use dispatch_worker::dispatch::Dispatch;
use dispatch_worker::handler::MessageHandler;
use dispatch_worker::metrics::ConsumerMetrics;
use dispatch_worker::repository::SqlxOrderRepository;
use db_pool::{create_pool, migrate, DbConfig};
use futures_util::StreamExt;
use idempotent_consumer::IdempotencyGuard;
use location_client::LocationServiceClient;
use redis_utils::RedisPool;
use serde::Serialize;
use sqlx::PgPool;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_NAME: &str = "dispatch-worker";
const IDEMPOTENCY_HANDLER: &str = "orders.created";

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    database: bool,
    broker: bool,
    cache: bool,
}

/// Composite health check: DB ping, broker pool availability, Redis ping --
/// the same shape `dispatch-api::handlers::health` reports, since this
/// worker has no other HTTP surface to expose it on.
async fn health(
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

async fn serve_metrics() -> HttpResponse {
    use prometheus::{Encoder, TextEncoder};
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }
    HttpResponse::Ok().content_type(encoder.format_type()).body(buffer)
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let settings = Settings::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to load configuration");
        std::process::exit(1);
    });

    let db_pool = create_pool(DbConfig::for_service(SERVICE_NAME))
        .await
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to open database pool");
            std::process::exit(1);
        });

    migrate(&db_pool, "../dispatch-api/migrations")
        .await
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to run database migrations");
            std::process::exit(1);
        });

    let redis_pool = RedisPool::connect(&settings.redis.url, None)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to connect to redis");
            std::process::exit(1);
        });

    let broker_pool = broker_topology::connect_pool(&settings.broker.url).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to build broker pool");
        std::process::exit(1);
    });

    let topology = broker_topology::QueueTopology::new(settings.broker.queue.clone());

    let conn = broker_pool.get().await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to acquire broker connection");
        std::process::exit(1);
    });
    let channel = conn.create_channel().await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to open broker channel");
        std::process::exit(1);
    });
    broker_topology::declare_topology(&channel, &topology)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to declare broker topology");
            std::process::exit(1);
        });

    let location = LocationServiceClient::connect(settings.location.endpoint.clone())
        .await
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to connect to location service");
            std::process::exit(1);
        });

    let orders = SqlxOrderRepository::new(db_pool.clone());
    let idempotency = IdempotencyGuard::new(
        redis_pool.manager(),
        IDEMPOTENCY_HANDLER,
        Duration::from_secs(settings.app.idempotency_ttl_secs),
    );
    let metrics = ConsumerMetrics::new(SERVICE_NAME);

    let handler = Arc::new(MessageHandler {
        idempotency,
        location,
        dispatch: Dispatch::new(orders),
        topology: topology.clone(),
        max_retries: settings.app.max_retries,
        metrics,
    });

    let prefetch = settings.app.worker_count.saturating_mul(2);
    let consumer_tag = format!("{SERVICE_NAME}-{}", uuid::Uuid::new_v4());
    let mut consumer =
        broker_topology::consume(&channel, &topology, &consumer_tag, prefetch)
            .await
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "failed to subscribe to orders queue");
                std::process::exit(1);
            });

    let db_pool_data = web::Data::new(db_pool.clone());
    let broker_pool_data = web::Data::new(broker_pool.clone());
    let redis_pool_data = web::Data::new(redis_pool);

    let http_addr = format!("{}:{}", settings.app.host, settings.app.health_port);
    let health_server = HttpServer::new(move || {
        App::new()
            .app_data(db_pool_data.clone())
            .app_data(broker_pool_data.clone())
            .app_data(redis_pool_data.clone())
            .route("/health", web::get().to(health))
    })
    .bind(&http_addr)
    .unwrap_or_else(|e| {
        tracing::error!(error = %e, addr = %http_addr, "failed to bind health listener");
        std::process::exit(1);
    })
    .workers(1)
    .run();
    let health_handle = health_server.handle();

    let metrics_addr = format!("{}:{}", settings.app.host, settings.app.metrics_port);
    let metrics_server = HttpServer::new(|| App::new().route("/metrics", web::get().to(serve_metrics)))
        .bind(&metrics_addr)
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, addr = %metrics_addr, "failed to bind metrics listener");
            std::process::exit(1);
        })
        .workers(1)
        .run();
    let metrics_handle = metrics_server.handle();

    let worker_count = settings.app.worker_count as usize;
    let mut tasks: JoinSet<io::Result<()>> = JoinSet::new();
    tasks.spawn(async move { health_server.await });
    tasks.spawn(async move { metrics_server.await });

    let delivery_channel = channel.clone();
    let consume_join = tokio::spawn(async move {
        tracing::info!(worker_count, prefetch, "dispatch-worker consuming orders.created");
        consumer
            .for_each_concurrent(worker_count, |delivery| {
                let handler = handler.clone();
                let channel = delivery_channel.clone();
                async move {
                    match delivery {
                        Ok(delivery) => {
                            // Spawned so a handler panic unwinds only this
                            // delivery's task, not the whole consume loop;
                            // `for_each_concurrent` still throttles on the
                            // join below, preserving the prefetch bound.
                            let task = tokio::spawn(async move {
                                handler.handle_delivery(&channel, delivery).await;
                            });
                            if let Err(e) = task.await {
                                tracing::error!(error = %e, "message handler panicked");
                            }
                        }
                        Err(e) => tracing::error!(error = %e, "broker delivery error"),
                    }
                }
            })
            .await;
        tracing::info!("consumer stream closed, in-flight deliveries drained");
    });

    shutdown_signal().await;
    tracing::info!("shutdown signal received, closing consumer channel");

    // Closing the channel ends the delivery stream; `for_each_concurrent`
    // then drains whatever deliveries are still in flight before returning.
    if let Err(e) = channel.close(200, "worker shutting down").await {
        tracing::warn!(error = %e, "error closing broker channel during shutdown");
    }
    if let Err(e) = consume_join.await {
        tracing::error!(error = %e, "consumer task panicked during shutdown");
    }

    health_handle.stop(true).await;
    metrics_handle.stop(true).await;
    tasks.shutdown().await;

    tracing::info!("dispatch-worker shutting down");
    Ok(())
}
