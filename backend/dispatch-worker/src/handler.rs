//! The per-message pipeline (spec §4.5): idempotency guard, circuit-broken
//! location lookup, FSM transition, then an ack/nack/parking decision. One
//! call to [`handle_delivery`] per message; workers differ only in which
//! `Delivery` they're handed.

use crate::dispatch::Dispatch;
use crate::metrics::{ConsumerMetrics, MessageOutcome};
use crate::repository::OrderRepository;
use broker_topology::{death_count, publish_to_parking, QueueTopology};
use idempotent_consumer::{ClaimOutcome, IdempotencyGuard};
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use lapin::Channel;
use location_client::{LocationError, LocationServiceClient};
use serde::Deserialize;
use tracing::{error, info, warn, Span};

#[derive(Debug, Deserialize)]
struct OrderCreatedPayload {
    id: String,
    #[allow(dead_code)]
    final_price: rust_decimal::Decimal,
}

/// Handles one delivery end-to-end: decode, dedup, locate a driver, dispatch
/// or fall back, and finish with exactly one ack/nack/parking action.
pub struct MessageHandler<OR> {
    pub idempotency: IdempotencyGuard,
    pub location: LocationServiceClient,
    pub dispatch: Dispatch<OR>,
    pub topology: QueueTopology,
    pub max_retries: u32,
    pub metrics: ConsumerMetrics,
}

impl<OR: OrderRepository> MessageHandler<OR> {
    #[tracing::instrument(skip_all, fields(traceparent = tracing::field::Empty))]
    pub async fn handle_delivery(&self, channel: &Channel, delivery: Delivery) {
        if let Some(trace_parent) = header_str(&delivery, "traceparent") {
            Span::current().record("traceparent", trace_parent.as_str());
        }

        let event_key = IdempotencyGuard::event_key(
            header_str(&delivery, "x-event-id").as_deref(),
            &delivery.data,
        );

        let claim = match self.idempotency.claim(&event_key).await {
            Ok(claim) => claim,
            Err(e) => {
                // KV error: fail closed per §4.5 step 2 -- treat as transient.
                warn!(error = %e, event_key = %event_key, "idempotency guard unavailable, requeuing");
                self.nack_without_requeue(channel, &delivery).await;
                return;
            }
        };

        if claim == ClaimOutcome::Duplicate {
            info!(event_key = %event_key, "duplicate delivery, acking without reprocessing");
            self.metrics.record_outcome(MessageOutcome::Duplicate);
            self.ack(channel, &delivery).await;
            return;
        }

        match self.process(&delivery).await {
            Ok(outcome) => {
                self.metrics.record_outcome(outcome);
                self.ack(channel, &delivery).await;
            }
            Err(ProcessingError::BreakerOpen) => {
                info!(event_key = %event_key, "location circuit open, falling back to manual dispatch");
                match self.run_fallback(&delivery).await {
                    Ok(()) => {
                        self.metrics.record_outcome(MessageOutcome::SentToManual);
                        self.ack(channel, &delivery).await;
                    }
                    Err(e) => {
                        error!(error = %e, event_key = %event_key, "fallback failed, requeuing");
                        self.metrics.record_outcome(MessageOutcome::Requeued);
                        self.nack_without_requeue(channel, &delivery).await;
                    }
                }
            }
            Err(ProcessingError::Poison(reason)) => {
                error!(reason = %reason, event_key = %event_key, "undecodable message, discarding");
                self.metrics.record_outcome(MessageOutcome::Poisoned);
                self.ack(channel, &delivery).await;
            }
            Err(ProcessingError::Domain(e)) => {
                error!(error = %e, event_key = %event_key, "invalid state transition, acking poison message");
                self.metrics.record_outcome(MessageOutcome::Poisoned);
                self.ack(channel, &delivery).await;
            }
            Err(ProcessingError::Transient(e)) => {
                let deaths = death_count(delivery.properties.headers().as_ref(), &self.topology.queue);
                if should_park(deaths, self.max_retries) {
                    warn!(event_key = %event_key, deaths, "retries exhausted, parking");
                    if let Err(park_err) = publish_to_parking(
                        channel,
                        &self.topology,
                        &delivery.data,
                        "max-retries-exceeded",
                    )
                    .await
                    {
                        error!(error = %park_err, "failed to publish to parking queue");
                    }
                    self.metrics.record_outcome(MessageOutcome::Parked);
                    self.ack(channel, &delivery).await;
                } else {
                    warn!(error = %e, event_key = %event_key, deaths, "transient failure, requeuing via wait queue");
                    if let Err(release_err) = self.idempotency.release(&event_key).await {
                        warn!(error = %release_err, "failed to release idempotency claim before retry");
                    }
                    self.metrics.record_outcome(MessageOutcome::Requeued);
                    self.nack_without_requeue(channel, &delivery).await;
                }
            }
        }
    }

    async fn process(&self, delivery: &Delivery) -> Result<MessageOutcome, ProcessingError> {
        let payload: OrderCreatedPayload = serde_json::from_slice(&delivery.data)
            .map_err(|e| ProcessingError::Poison(e.to_string()))?;

        let result = self.location.search_driver(&payload.id).await;
        self.metrics
            .record_breaker_state("location-service", self.location.breaker_state());

        match result {
            Ok(driver) => self
                .dispatch
                .dispatch_to_driver(&payload.id, driver.driver_id)
                .await
                .map(|()| MessageOutcome::Dispatched)
                .map_err(ProcessingError::from),
            Err(LocationError::NotFound) => self
                .dispatch
                .send_to_manual(&payload.id)
                .await
                .map(|()| MessageOutcome::SentToManual)
                .map_err(ProcessingError::from),
            Err(e) if e.is_breaker_signal() => Err(ProcessingError::BreakerOpen),
            Err(e) => Err(ProcessingError::Transient(e.to_string())),
        }
    }

    async fn run_fallback(&self, delivery: &Delivery) -> Result<(), ProcessingError> {
        let payload: OrderCreatedPayload = serde_json::from_slice(&delivery.data)
            .map_err(|e| ProcessingError::Poison(e.to_string()))?;
        self.dispatch
            .send_to_manual(&payload.id)
            .await
            .map_err(ProcessingError::from)
    }

    async fn ack(&self, channel: &Channel, delivery: &Delivery) {
        if let Err(e) = channel
            .basic_ack(delivery.delivery_tag, BasicAckOptions::default())
            .await
        {
            error!(error = %e, "failed to ack delivery");
        }
    }

    async fn nack_without_requeue(&self, channel: &Channel, delivery: &Delivery) {
        if let Err(e) = channel
            .basic_nack(
                delivery.delivery_tag,
                BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                },
            )
            .await
        {
            error!(error = %e, "failed to nack delivery");
        }
    }
}

/// R in spec §4.5: once the broker's `x-death` count reaches `max_retries`
/// the message is parked rather than routed back through the wait queue.
fn should_park(deaths: u32, max_retries: u32) -> bool {
    deaths >= max_retries
}

fn header_str(delivery: &Delivery, name: &str) -> Option<String> {
    let headers = delivery.properties.headers().as_ref()?;
    match headers.inner().get(name)? {
        lapin::types::AMQPValue::LongString(s) => Some(s.to_string()),
        lapin::types::AMQPValue::ShortString(s) => Some(s.to_string()),
        _ => None,
    }
}

#[derive(Debug)]
enum ProcessingError {
    BreakerOpen,
    Poison(String),
    Domain(error_types::ServiceError),
    Transient(String),
}

impl From<error_types::ServiceError> for ProcessingError {
    fn from(err: error_types::ServiceError) -> Self {
        match err {
            domain @ error_types::ServiceError::DomainTransition(_) => ProcessingError::Domain(domain),
            transient if transient.is_transient() => ProcessingError::Transient(transient.to_string()),
            other => ProcessingError::Domain(other),
        }
    }
}

impl std::fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingError::BreakerOpen => write!(f, "circuit breaker open"),
            ProcessingError::Poison(reason) => write!(f, "poison message: {reason}"),
            ProcessingError::Domain(e) => write!(f, "domain error: {e}"),
            ProcessingError::Transient(reason) => write!(f, "transient error: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use error_types::ServiceError;

    #[test]
    fn event_key_from_header_wins_over_payload_hash() {
        let a = IdempotencyGuard::event_key(Some("evt-1"), b"{}");
        let b = IdempotencyGuard::event_key(Some("evt-1"), b"different payload");
        assert_eq!(a, b);
    }

    #[test]
    fn event_key_falls_back_to_payload_hash_when_header_missing() {
        let a = IdempotencyGuard::event_key(None, b"{\"id\":\"o1\"}");
        let b = IdempotencyGuard::event_key(None, b"{\"id\":\"o2\"}");
        assert_ne!(a, b);
    }

    #[test]
    fn database_errors_classify_as_transient() {
        let err: ProcessingError = ServiceError::Database("connection reset".into()).into();
        assert!(matches!(err, ProcessingError::Transient(_)));
    }

    #[test]
    fn domain_transition_errors_do_not_retry() {
        let domain_err = order_domain::OrderError::InvalidStateTransition {
            from: "PENDING".to_string(),
            event: "Deliver".to_string(),
        };
        let err: ProcessingError = ServiceError::from(domain_err).into();
        assert!(matches!(err, ProcessingError::Domain(_)));
    }

    #[test]
    fn not_found_does_not_retry() {
        let err: ProcessingError = ServiceError::NotFound("o1".into()).into();
        assert!(matches!(err, ProcessingError::Domain(_)));
    }

    #[test]
    fn deaths_at_or_above_max_retries_park_rather_than_requeue() {
        assert!(should_park(3, 3));
        assert!(!should_park(2, 3));
    }
}
