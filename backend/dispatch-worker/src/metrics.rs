//! Consumer-side Prometheus metrics, constructed once in `main` and threaded
//! into the message handler -- same instance-per-service shape as
//! `transactional_outbox::metrics::OutboxMetrics`, not the static `lazy_static`
//! default-registry macros `actix-middleware` uses for the HTTP surface.

use prometheus::{IntCounterVec, IntGaugeVec, Opts};
use tracing::warn;

/// How a delivery's pipeline run ended, for the `outcome` label on
/// `consumer_messages_processed_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Dispatched,
    SentToManual,
    Duplicate,
    Parked,
    Requeued,
    Poisoned,
}

impl MessageOutcome {
    fn label(self) -> &'static str {
        match self {
            MessageOutcome::Dispatched => "dispatched",
            MessageOutcome::SentToManual => "sent_to_manual",
            MessageOutcome::Duplicate => "duplicate",
            MessageOutcome::Parked => "parked",
            MessageOutcome::Requeued => "requeued",
            MessageOutcome::Poisoned => "poisoned",
        }
    }
}

#[derive(Clone)]
pub struct ConsumerMetrics {
    processed: IntCounterVec,
    breaker_state: IntGaugeVec,
}

impl ConsumerMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let processed = IntCounterVec::new(
            Opts::new(
                "consumer_messages_processed_total",
                "Total number of consumed messages by processing outcome",
            )
            .const_label("service", service.to_string()),
            &["outcome"],
        )
        .expect("valid metric opts for consumer_messages_processed_total");

        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_state",
                "Current circuit breaker state (0=closed, 1=half-open, 2=open) by dependency",
            )
            .const_label("service", service.to_string()),
            &["service"],
        )
        .expect("valid metric opts for circuit_breaker_state");

        for metric in [
            Box::new(processed.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(breaker_state.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register consumer metric: {}", e);
            }
        }

        Self {
            processed,
            breaker_state,
        }
    }

    pub fn record_outcome(&self, outcome: MessageOutcome) {
        self.processed.with_label_values(&[outcome.label()]).inc();
    }

    /// `dependency` names the breaker-guarded call, e.g. `"location-service"`.
    pub fn record_breaker_state(&self, dependency: &str, state: resilience::CircuitState) {
        let value = match state {
            resilience::CircuitState::Closed => 0,
            resilience::CircuitState::HalfOpen => 1,
            resilience::CircuitState::Open => 2,
        };
        self.breaker_state
            .with_label_values(&[dependency])
            .set(value);
    }
}
