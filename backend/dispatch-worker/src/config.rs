//! Environment-driven settings for `dispatch-worker`: one struct per
//! concern, each with its own `from_env()`.

use anyhow::{Context, Result};
use std::env;

#[derive(Debug, Clone)]
pub struct Settings {
    pub app: AppSettings,
    pub broker: BrokerSettings,
    pub redis: RedisSettings,
    pub location: LocationSettings,
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
            location: LocationSettings::from_env()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AppSettings {
    pub host: String,
    pub health_port: u16,
    pub metrics_port: u16,
    /// N in the `prefetch = 2N` backpressure rule and the worker pool size.
    pub worker_count: u16,
    /// R in the "exhausted retries -> parking" rule.
    pub max_retries: u32,
    /// TTL on the Redis dedup claim written per delivered event.
    pub idempotency_ttl_secs: u64,
}

impl AppSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            host: env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            health_port: env::var("WORKER_HEALTH_PORT")
                .unwrap_or_else(|_| "8090".to_string())
                .parse()
                .context("invalid WORKER_HEALTH_PORT")?,
            metrics_port: env::var("METRICS_PORT")
                .unwrap_or_else(|_| "9091".to_string())
                .parse()
                .context("invalid METRICS_PORT")?,
            worker_count: env::var("WORKER_COUNT")
                .unwrap_or_else(|_| "8".to_string())
                .parse()
                .context("invalid WORKER_COUNT")?,
            max_retries: env::var("CONSUMER_MAX_RETRIES")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .context("invalid CONSUMER_MAX_RETRIES")?,
            idempotency_ttl_secs: env::var("IDEMPOTENCY_TTL_SECS")
                .unwrap_or_else(|_| "86400".to_string())
                .parse()
                .context("invalid IDEMPOTENCY_TTL_SECS")?,
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

#[derive(Debug, Clone)]
pub struct LocationSettings {
    pub endpoint: String,
}

impl LocationSettings {
    fn from_env() -> Result<Self> {
        let host = env::var("FLEET_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port = env::var("FLEET_PORT").unwrap_or_else(|_| "50051".to_string());
        let endpoint = env::var("LOCATION_SERVICE_ENDPOINT")
            .unwrap_or_else(|_| format!("http://{host}:{port}"));
        Ok(Self { endpoint })
    }
}
