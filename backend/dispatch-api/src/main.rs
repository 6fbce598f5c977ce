//! `dispatch-api`
//!
//! HTTP front door for the fleet-dispatch messaging backbone. Accepts order
//! creation, writes the order and its `OrderCreated` outbox row atomically,
//! and runs the outbox relay's dispatch/rescuer loops in-process alongside
//! the HTTP server.
//!
//! # Routes
//!
//! - `POST /api/v1/orders` - create an order
//! - `GET /health` - composite DB/broker/cache health
//! - `GET /metrics` (separate port) - Prometheus exposition

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use dispatch_api::config::Settings;
use dispatch_api::create_order::CreateOrder;
use dispatch_api::handlers;
use dispatch_api::repository::SqlxOrderRepository;
use db_pool::{create_pool, migrate, DbConfig};
use redis_utils::RedisPool;
use std::io;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transactional_outbox::{
    metrics::OutboxMetrics, LapinOutboxPublisher, OutboxRelay, OutboxRelayConfig,
    SqlxOutboxRepository,
};

const SERVICE_NAME: &str = "dispatch-api";

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

async fn serve_metrics() -> actix_web::HttpResponse {
    use prometheus::{Encoder, TextEncoder};
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return actix_web::HttpResponse::InternalServerError().body(err.to_string());
    }
    actix_web::HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
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

    migrate(&db_pool, "./migrations").await.unwrap_or_else(|e| {
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
    {
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
    }

    let publish_conn = broker_pool.get().await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to acquire broker connection for publisher");
        std::process::exit(1);
    });
    let publish_channel = publish_conn.create_channel().await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to open publisher channel");
        std::process::exit(1);
    });

    let order_repository = Arc::new(SqlxOrderRepository::new(db_pool.clone()));
    let outbox_repository = Arc::new(SqlxOutboxRepository::new(db_pool.clone()));
    let outbox_publisher = Arc::new(LapinOutboxPublisher::new(
        publish_channel,
        broker_topology::ORDERS_EXCHANGE,
    ));

    let relay_config = OutboxRelayConfig {
        batch_size: settings.outbox.batch_size,
        publish_concurrency: settings.outbox.publish_concurrency,
        poll_interval: settings.outbox.poll_interval,
        rescue_interval: settings.outbox.rescue_interval,
        max_attempts: settings.outbox.max_attempts,
        ..OutboxRelayConfig::default()
    };

    let relay = Arc::new(
        OutboxRelay::new(
            outbox_repository.clone(),
            outbox_publisher,
            relay_config,
        )
        .with_metrics(OutboxMetrics::new(SERVICE_NAME)),
    );

    let create_order = web::Data::new(CreateOrder::new(
        db_pool.clone(),
        order_repository,
        outbox_repository,
    ));

    let db_pool_data = web::Data::new(db_pool.clone());
    let broker_pool_data = web::Data::new(broker_pool);
    let redis_pool_data = web::Data::new(redis_pool);

    let http_addr = format!("{}:{}", settings.app.host, settings.app.web_server_port);
    let metrics_addr = format!("{}:{}", settings.app.host, settings.app.metrics_port);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(create_order.clone())
            .app_data(db_pool_data.clone())
            .app_data(broker_pool_data.clone())
            .app_data(redis_pool_data.clone())
            .wrap(Cors::permissive())
            .wrap(tracing_actix_web::TracingLogger::default())
            .wrap(actix_middleware::Logging)
            .wrap(actix_middleware::CorrelationIdMiddleware)
            .wrap(actix_middleware::MetricsMiddleware)
            .route("/health", web::get().to(handlers::health))
            .service(
                web::scope("/api/v1")
                    .route("/orders", web::post().to(handlers::create_order)),
            )
    })
    .bind(&http_addr)
    .unwrap_or_else(|e| {
        tracing::error!(error = %e, addr = %http_addr, "failed to bind HTTP listener");
        std::process::exit(1);
    })
    .workers(4)
    .run();

    let server_handle = server.handle();

    let metrics_server = HttpServer::new(|| App::new().route("/metrics", web::get().to(serve_metrics)))
        .bind(&metrics_addr)
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, addr = %metrics_addr, "failed to bind metrics listener");
            std::process::exit(1);
        })
        .workers(1)
        .run();
    let metrics_handle = metrics_server.handle();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());

    let mut tasks: JoinSet<io::Result<()>> = JoinSet::new();

    tasks.spawn(async move {
        tracing::info!("HTTP server is running");
        server.await
    });

    tasks.spawn(async move {
        tracing::info!("metrics server is running");
        metrics_server.await
    });

    {
        let relay = relay.clone();
        let shutdown_rx = shutdown_rx.clone();
        tasks.spawn(async move {
            relay.run_dispatch_loop(shutdown_rx).await;
            Ok(())
        });
    }

    {
        let relay = relay.clone();
        tasks.spawn(async move {
            relay.run_rescuer_loop(shutdown_rx).await;
            Ok(())
        });
    }

    let mut first_error: Option<io::Error> = None;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = tasks.join_next() => {
                match result {
                    Some(Ok(Ok(_))) => {
                        tracing::info!("background task completed");
                    }
                    Some(Ok(Err(e))) => {
                        tracing::error!(error = %e, "task returned error");
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                        let _ = shutdown_tx.send(());
                        server_handle.stop(true).await;
                        metrics_handle.stop(true).await;
                        tasks.shutdown().await;
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "task join error");
                        if first_error.is_none() {
                            first_error = Some(io::Error::new(io::ErrorKind::Other, e.to_string()));
                        }
                        let _ = shutdown_tx.send(());
                        server_handle.stop(true).await;
                        metrics_handle.stop(true).await;
                        tasks.shutdown().await;
                        break;
                    }
                    None => break,
                }
            }
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                let _ = shutdown_tx.send(());
                server_handle.stop(true).await;
                metrics_handle.stop(true).await;
                tasks.shutdown().await;
                break;
            }
        }
    }

    tracing::info!("dispatch-api shutting down");

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
