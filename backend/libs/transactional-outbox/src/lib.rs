//! Transactional outbox: atomic domain-write + event-publish, with a
//! claim-based relay for at-least-once delivery under concurrent relay
//! replicas and crash recovery.
//!
//! The insert side (`OutboxRepository::insert`) runs inside the caller's own
//! `sqlx::Transaction` so the outbox row and the domain row it describes
//! commit or roll back together. The relay (`OutboxRelay`) is a separate,
//! independent process component: it claims `PENDING` rows with
//! `FOR UPDATE SKIP LOCKED`, publishes them to the broker, and finalizes each
//! row to `PUBLISHED` or `FAILED`. A rescuer loop resets claims abandoned by a
//! crashed relay, re-queues retryable failures, and prunes old published
//! rows.
//!
//! This crate never publishes anywhere but through the outbox: there is no
//! direct-publish path, by design (a legacy shortcut some upstream call
//! sites took is deliberately not reproduced here).

mod error;
pub mod metrics;

pub use error::{OutboxError, OutboxResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use lapin::options::BasicPublishOptions;
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{BasicProperties, Channel};
use resilience::timeout::with_timeout_result;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle state of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Processing,
    Published,
    Failed,
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

impl FromStr for OutboxStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PROCESSING" => Ok(OutboxStatus::Processing),
            "PUBLISHED" => Ok(OutboxStatus::Published),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(OutboxError::UnknownStatus(other.to_string())),
        }
    }
}

/// A row in `outbox_events`, inserted in the same transaction as the
/// aggregate write and carried through to `PUBLISHED`/`FAILED` by the relay.
#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub event_version: i32,
    pub payload: Vec<u8>,
    pub topic: String,
    pub headers: Option<Vec<u8>>,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub error_msg: Option<String>,
    pub attempt_count: i32,
}

impl OutboxEvent {
    /// Build a fresh, unpersisted `PENDING` event.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        event_version: i32,
        payload: Vec<u8>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            event_version,
            payload,
            topic: topic.into(),
            headers: None,
            status: OutboxStatus::Pending,
            created_at: Utc::now(),
            claimed_at: None,
            published_at: None,
            error_msg: None,
            attempt_count: 0,
        }
    }

    /// Carry the caller's W3C `traceparent` through to the relay's publish
    /// (spec §4.2's "plus the extracted trace context"). A no-op when the
    /// caller had none to propagate.
    pub fn with_trace_parent(mut self, trace_parent: Option<&str>) -> Self {
        if let Some(trace_parent) = trace_parent.filter(|t| !t.is_empty()) {
            self.headers = serde_json::to_vec(&serde_json::json!({ "traceparent": trace_parent })).ok();
        }
        self
    }

    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        let status_str: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            event_version: row.try_get("event_version")?,
            payload: row.try_get("payload")?,
            topic: row.try_get("topic")?,
            headers: row.try_get("headers")?,
            status: status_str.parse().unwrap_or(OutboxStatus::Failed),
            created_at: row.try_get("created_at")?,
            claimed_at: row.try_get("claimed_at")?,
            published_at: row.try_get("published_at")?,
            error_msg: row.try_get("error_msg")?,
            attempt_count: row.try_get("attempt_count")?,
        })
    }
}

const OUTBOX_COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, event_version, \
     payload, topic, headers, status, created_at, claimed_at, published_at, error_msg, attempt_count";

/// Persistence operations on `outbox_events`.
///
/// `insert` participates in the caller's transaction; every other method
/// manages its own short-lived connection so relay bookkeeping never blocks
/// on, or gets rolled back by, an unrelated transaction.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> OutboxResult<()>;

    /// Claim up to `batch_size` `PENDING` rows, oldest first, flipping them
    /// to `PROCESSING` in the same statement so `SKIP LOCKED` and the status
    /// change are atomic with respect to concurrent relay replicas.
    async fn claim_batch(&self, batch_size: i64) -> OutboxResult<Vec<OutboxEvent>>;

    async fn mark_published(&self, event_id: Uuid) -> OutboxResult<()>;

    async fn mark_failed(&self, event_id: Uuid, error: &str) -> OutboxResult<()>;

    /// Reset `PROCESSING` rows whose claim is older than `claim_timeout` back
    /// to `PENDING`. Returns the number of rows reset.
    async fn reset_stuck_claims(&self, claim_timeout: Duration) -> OutboxResult<u64>;

    /// Re-queue `FAILED` rows with `attempt_count < max_attempts` back to
    /// `PENDING`. Returns the number of rows re-queued.
    async fn requeue_failed(&self, max_attempts: i32) -> OutboxResult<u64>;

    /// Delete `PUBLISHED` rows older than `older_than`. Returns rows deleted.
    async fn prune_published(&self, older_than: Duration) -> OutboxResult<u64>;

    /// Pending row count and the age in seconds of the oldest one (0 if none).
    async fn pending_stats(&self) -> OutboxResult<(i64, i64)>;
}

/// `sqlx`/Postgres implementation of [`OutboxRepository`].
pub struct SqlxOutboxRepository {
    pool: PgPool,
}

impl SqlxOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxRepository for SqlxOutboxRepository {
    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id, aggregate_type, aggregate_id, event_type, event_version,
                payload, topic, headers, status, created_at,
                claimed_at, published_at, error_msg, attempt_count
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(event.id)
        .bind(&event.aggregate_type)
        .bind(&event.aggregate_id)
        .bind(&event.event_type)
        .bind(event.event_version)
        .bind(&event.payload)
        .bind(&event.topic)
        .bind(&event.headers)
        .bind(event.status.to_string())
        .bind(event.created_at)
        .bind(event.claimed_at)
        .bind(event.published_at)
        .bind(&event.error_msg)
        .bind(event.attempt_count)
        .execute(&mut **tx)
        .await
        .map_err(OutboxError::DatabaseError)?;

        debug!(
            event_id = %event.id,
            aggregate_id = %event.aggregate_id,
            event_type = %event.event_type,
            "outbox event inserted"
        );
        Ok(())
    }

    async fn claim_batch(&self, batch_size: i64) -> OutboxResult<Vec<OutboxEvent>> {
        let query = format!(
            r#"
            WITH claimed AS (
                SELECT id FROM outbox_events
                WHERE status = 'PENDING'
                ORDER BY created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_events
            SET status = 'PROCESSING', claimed_at = NOW()
            WHERE id IN (SELECT id FROM claimed)
            RETURNING {OUTBOX_COLUMNS}
            "#
        );

        let rows = sqlx::query(&query)
            .bind(batch_size)
            .fetch_all(&self.pool)
            .await
            .map_err(OutboxError::DatabaseError)?;

        let events = rows
            .iter()
            .map(OutboxEvent::from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(OutboxError::DatabaseError)?;

        if !events.is_empty() {
            debug!(count = events.len(), "claimed outbox batch");
        }
        Ok(events)
    }

    async fn mark_published(&self, event_id: Uuid) -> OutboxResult<()> {
        let result = sqlx::query(
            "UPDATE outbox_events SET status = 'PUBLISHED', published_at = NOW() WHERE id = $1",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(OutboxError::DatabaseError)?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::EventNotFound(event_id));
        }
        debug!(event_id = %event_id, "outbox event published");
        Ok(())
    }

    async fn mark_failed(&self, event_id: Uuid, error: &str) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'FAILED', error_msg = $2, attempt_count = attempt_count + 1
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(OutboxError::DatabaseError)?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::EventNotFound(event_id));
        }
        warn!(event_id = %event_id, error = %error, "outbox event failed");
        Ok(())
    }

    async fn reset_stuck_claims(&self, claim_timeout: Duration) -> OutboxResult<u64> {
        let interval = format!("{} seconds", claim_timeout.as_secs());
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'PENDING', claimed_at = NULL
            WHERE status = 'PROCESSING' AND claimed_at < NOW() - $1::interval
            "#,
        )
        .bind(interval)
        .execute(&self.pool)
        .await
        .map_err(OutboxError::DatabaseError)?;

        Ok(result.rows_affected())
    }

    async fn requeue_failed(&self, max_attempts: i32) -> OutboxResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'PENDING'
            WHERE status = 'FAILED' AND attempt_count < $1
            "#,
        )
        .bind(max_attempts)
        .execute(&self.pool)
        .await
        .map_err(OutboxError::DatabaseError)?;

        Ok(result.rows_affected())
    }

    async fn prune_published(&self, older_than: Duration) -> OutboxResult<u64> {
        let interval = format!("{} seconds", older_than.as_secs());
        let result = sqlx::query(
            r#"
            DELETE FROM outbox_events
            WHERE status = 'PUBLISHED' AND published_at < NOW() - $1::interval
            "#,
        )
        .bind(interval)
        .execute(&self.pool)
        .await
        .map_err(OutboxError::DatabaseError)?;

        Ok(result.rows_affected())
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM outbox_events
            WHERE status = 'PENDING'
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(OutboxError::DatabaseError)?;

        let pending: i64 = row.try_get("pending").unwrap_or(0);
        let age: i64 = row.try_get("age_seconds").unwrap_or(0);
        Ok((pending, age))
    }
}

/// Publishes a claimed outbox row to the broker. Implementations must be
/// idempotent: the rescuer can cause the same row to be republished.
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    async fn publish(&self, event: &OutboxEvent) -> OutboxResult<()>;
}

/// Pull the `traceparent` value back out of `OutboxEvent::with_trace_parent`'s
/// JSON encoding, if the event carries one.
fn extract_trace_parent(headers: Option<&[u8]>) -> Option<String> {
    let raw = headers?;
    let value: serde_json::Value = serde_json::from_slice(raw).ok()?;
    value.get("traceparent")?.as_str().map(str::to_string)
}

/// Publishes via `lapin` to `orders_exchange`, routing by `event.topic`, with
/// the idempotency/tracing headers the consumer pipeline expects.
pub struct LapinOutboxPublisher {
    channel: Channel,
    exchange: String,
    publish_timeout: Duration,
}

impl LapinOutboxPublisher {
    pub fn new(channel: Channel, exchange: impl Into<String>) -> Self {
        Self {
            channel,
            exchange: exchange.into(),
            publish_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
}

#[async_trait]
impl OutboxPublisher for LapinOutboxPublisher {
    async fn publish(&self, event: &OutboxEvent) -> OutboxResult<()> {
        let mut headers = FieldTable::default();
        headers.insert(
            "x-event-id".into(),
            AMQPValue::LongString(LongString::from(event.id.to_string())),
        );
        headers.insert(
            "x-aggregate-id".into(),
            AMQPValue::LongString(LongString::from(event.aggregate_id.clone())),
        );
        headers.insert(
            "x-event-version".into(),
            AMQPValue::LongString(LongString::from(event.event_version.to_string())),
        );
        if let Some(trace_parent) = extract_trace_parent(event.headers.as_deref()) {
            headers.insert(
                "traceparent".into(),
                AMQPValue::LongString(LongString::from(trace_parent)),
            );
        }

        let properties = BasicProperties::default()
            .with_delivery_mode(2) // persistent
            .with_content_type("application/json".into())
            .with_headers(headers);

        let confirm = with_timeout_result(self.publish_timeout, async {
            self.channel
                .basic_publish(
                    &self.exchange,
                    &event.topic,
                    BasicPublishOptions::default(),
                    &event.payload,
                    properties,
                )
                .await?
                .await
        })
        .await
        .map_err(|e| OutboxError::PublishFailed(e.to_string()))?;

        if confirm.is_nack() {
            return Err(OutboxError::PublishFailed(format!(
                "broker nacked publish of event {}",
                event.id
            )));
        }

        info!(
            event_id = %event.id,
            topic = %event.topic,
            aggregate_id = %event.aggregate_id,
            "outbox event published"
        );
        Ok(())
    }
}

/// Tuning knobs for the relay's two loops.
#[derive(Debug, Clone)]
pub struct OutboxRelayConfig {
    pub batch_size: i64,
    pub poll_interval: Duration,
    pub publish_concurrency: usize,
    pub rescue_interval: Duration,
    pub claim_timeout: Duration,
    pub max_attempts: i32,
    pub prune_age: Duration,
}

impl Default for OutboxRelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval: Duration::from_millis(100),
            publish_concurrency: 10,
            rescue_interval: Duration::from_secs(5 * 60),
            claim_timeout: Duration::from_secs(5 * 60),
            max_attempts: 5,
            prune_age: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Drains `outbox_events` into the broker and rescues rows abandoned by a
/// crashed relay. The two loops (`run_dispatch_loop`, `run_rescuer_loop`) are
/// meant to be spawned as independent background tasks sharing one instance.
pub struct OutboxRelay<R: OutboxRepository, P: OutboxPublisher> {
    repository: Arc<R>,
    publisher: Arc<P>,
    config: OutboxRelayConfig,
    metrics: Option<metrics::OutboxMetrics>,
}

impl<R: OutboxRepository + 'static, P: OutboxPublisher + 'static> OutboxRelay<R, P> {
    pub fn new(repository: Arc<R>, publisher: Arc<P>, config: OutboxRelayConfig) -> Self {
        Self {
            repository,
            publisher,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: metrics::OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Claim + publish + finalize, ticking every `poll_interval` until
    /// `shutdown` fires. Intended to be `tokio::spawn`ed from `main`.
    pub async fn run_dispatch_loop(&self, mut shutdown: watch::Receiver<()>) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            "outbox dispatch loop starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("outbox dispatch loop shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.process_batch().await {
                        error!(error = ?e, "outbox dispatch batch failed");
                    }
                    if let Some(metrics) = &self.metrics {
                        if let Ok((pending, age)) = self.repository.pending_stats().await {
                            metrics.pending.set(pending);
                            metrics.oldest_pending_age_seconds.set(age);
                        }
                    }
                }
            }
        }
    }

    async fn process_batch(&self) -> OutboxResult<()> {
        let claimed = self.repository.claim_batch(self.config.batch_size).await?;
        if claimed.is_empty() {
            return Ok(());
        }

        if let Some(metrics) = &self.metrics {
            metrics.claim_batch_size.set(claimed.len() as i64);
        }

        let concurrency = self.config.publish_concurrency;
        let repository = self.repository.clone();
        let publisher = self.publisher.clone();
        let metrics = self.metrics.clone();

        stream::iter(claimed.into_iter())
            .for_each_concurrent(concurrency, move |event| {
                let repository = repository.clone();
                let publisher = publisher.clone();
                let metrics = metrics.clone();
                async move {
                    // Finalization never shares a context with the publish
                    // call: a shutdown mid-publish must still record
                    // terminal state for this row.
                    match publisher.publish(&event).await {
                        Ok(()) => {
                            if let Err(e) = repository.mark_published(event.id).await {
                                error!(event_id = %event.id, error = ?e, "failed to finalize published event");
                            } else if let Some(metrics) = &metrics {
                                metrics.published.inc();
                            }
                        }
                        Err(e) => {
                            warn!(event_id = %event.id, error = ?e, "failed to publish outbox event");
                            if let Err(mark_err) =
                                repository.mark_failed(event.id, &e.to_string()).await
                            {
                                error!(event_id = %event.id, error = ?mark_err, "failed to finalize failed event");
                            } else if let Some(metrics) = &metrics {
                                metrics.failed.inc();
                            }
                        }
                    }
                }
            })
            .await;

        Ok(())
    }

    /// Resets stuck claims, re-queues retryable failures, and prunes old
    /// published rows, ticking every `rescue_interval` until `shutdown`.
    pub async fn run_rescuer_loop(&self, mut shutdown: watch::Receiver<()>) {
        info!(
            rescue_interval_secs = self.config.rescue_interval.as_secs(),
            "outbox rescuer loop starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("outbox rescuer loop shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.config.rescue_interval) => {
                    match self.repository.reset_stuck_claims(self.config.claim_timeout).await {
                        Ok(n) if n > 0 => warn!(count = n, "reset stuck outbox claims"),
                        Ok(_) => {}
                        Err(e) => error!(error = ?e, "failed to reset stuck outbox claims"),
                    }

                    match self.repository.requeue_failed(self.config.max_attempts).await {
                        Ok(n) if n > 0 => info!(count = n, "re-queued failed outbox events"),
                        Ok(_) => {}
                        Err(e) => error!(error = ?e, "failed to requeue failed outbox events"),
                    }

                    match self.repository.prune_published(self.config.prune_age).await {
                        Ok(n) if n > 0 => debug!(count = n, "pruned published outbox events"),
                        Ok(_) => {}
                        Err(e) => error!(error = ?e, "failed to prune published outbox events"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_string() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Processing,
            OutboxStatus::Published,
            OutboxStatus::Failed,
        ] {
            let parsed: OutboxStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn unknown_status_string_is_rejected() {
        assert!(matches!(
            "BOGUS".parse::<OutboxStatus>(),
            Err(OutboxError::UnknownStatus(_))
        ));
    }

    #[test]
    fn new_event_starts_pending_with_zero_attempts() {
        let event = OutboxEvent::new(
            "Order",
            "o1",
            "OrderCreated",
            1,
            br#"{"id":"o1"}"#.to_vec(),
            "orders.created",
        );
        assert_eq!(event.status, OutboxStatus::Pending);
        assert_eq!(event.attempt_count, 0);
        assert!(event.claimed_at.is_none());
        assert!(event.published_at.is_none());
    }

    #[test]
    fn with_trace_parent_round_trips_through_headers() {
        let event = OutboxEvent::new(
            "Order",
            "o1",
            "OrderCreated",
            1,
            br#"{"id":"o1"}"#.to_vec(),
            "orders.created",
        )
        .with_trace_parent(Some("00-4bf92f-00f067-01"));

        assert_eq!(
            extract_trace_parent(event.headers.as_deref()),
            Some("00-4bf92f-00f067-01".to_string())
        );
    }

    #[test]
    fn with_trace_parent_is_a_no_op_when_absent() {
        let event = OutboxEvent::new(
            "Order",
            "o1",
            "OrderCreated",
            1,
            br#"{"id":"o1"}"#.to_vec(),
            "orders.created",
        )
        .with_trace_parent(None);

        assert!(event.headers.is_none());
        assert_eq!(extract_trace_parent(event.headers.as_deref()), None);
    }

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = OutboxRelayConfig::default();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.publish_concurrency, 10);
        assert_eq!(config.rescue_interval, Duration::from_secs(300));
        assert_eq!(config.prune_age, Duration::from_secs(7 * 24 * 3600));
    }
}
