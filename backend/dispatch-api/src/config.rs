//! Environment-driven settings for `dispatch-api`: one struct per concern,
//! each with its own `from_env()`.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Settings {
    pub app: AppSettings,
    pub broker: BrokerSettings,
    pub redis: RedisSettings,
    pub outbox: OutboxSettings,
}

impl Settings {
    /// Database settings are not duplicated here: `db_pool::DbConfig::for_service`
    /// already reads `DATABASE_URL`/`DB_*` and knows this service's pool sizing.
    pub fn from_env() -> Result<Self> {
        if cfg!(debug_assertions) {
            dotenvy::dotenv().ok();
        }

        Ok(Self {
            app: AppSettings::from_env()?,
            broker: BrokerSettings::from_env()?,
            redis: RedisSettings::from_env()?,
            outbox: OutboxSettings::from_env(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AppSettings {
    pub host: String,
    pub web_server_port: u16,
    pub metrics_port: u16,
}

impl AppSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            host: env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            web_server_port: env::var("WEB_SERVER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("invalid WEB_SERVER_PORT")?,
            metrics_port: env::var("METRICS_PORT")
                .unwrap_or_else(|_| "9090".to_string())
                .parse()
                .context("invalid METRICS_PORT")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub url: String,
    pub queue: String,
}

impl BrokerSettings {
    fn from_env() -> Result<Self> {
        let host = env::var("RABBITMQ_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port = env::var("AMQ_PORT").unwrap_or_else(|_| "5672".to_string());
        let user = env::var("RABBITMQ_USER").unwrap_or_else(|_| "guest".to_string());
        let password = env::var("RABBITMQ_PASSWORD").unwrap_or_else(|_| "guest".to_string());

        let url = env::var("RABBITMQ_URL")
            .unwrap_or_else(|_| format!("amqp://{user}:{password}@{host}:{port}/%2f"));

        Ok(Self {
            url,
            queue: env::var("ORDERS_QUEUE").unwrap_or_else(|_| "orders.created".to_string()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: String,
}

impl RedisSettings {
    fn from_env() -> Result<Self> {
        let host = env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port = env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
        let url = env::var("REDIS_URL").unwrap_or_else(|_| format!("redis://{host}:{port}"));
        Ok(Self { url })
    }
}

/// Tuning for the embedded outbox relay, overriding
/// `transactional_outbox::OutboxRelayConfig`'s defaults where this service
/// needs to env-tune the dispatch/rescuer loops.
#[derive(Debug, Clone)]
pub struct OutboxSettings {
    pub batch_size: i64,
    pub publish_concurrency: usize,
    pub poll_interval: Duration,
    pub rescue_interval: Duration,
    pub max_attempts: i32,
}

impl OutboxSettings {
    fn from_env() -> Self {
        Self {
            batch_size: env::var("OUTBOX_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50),
            publish_concurrency: env::var("OUTBOX_PUBLISH_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            poll_interval: Duration::from_millis(
                env::var("OUTBOX_POLL_INTERVAL_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(100),
            ),
            rescue_interval: Duration::from_secs(
                env::var("OUTBOX_RESCUE_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5 * 60),
            ),
            max_attempts: env::var("OUTBOX_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
        }
    }
}
