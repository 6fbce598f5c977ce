use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct OutboxMetrics {
    pub pending: IntGauge,
    pub oldest_pending_age_seconds: IntGauge,
    pub published: IntCounter,
    pub failed: IntCounter,
    pub claim_batch_size: IntGauge,
}

impl OutboxMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let pending = IntGauge::with_opts(
            Opts::new(
                "outbox_pending_count",
                "Number of unpublished outbox events currently pending",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_pending_count");

        let oldest_pending_age_seconds = IntGauge::with_opts(
            Opts::new(
                "outbox_oldest_pending_age_seconds",
                "Age in seconds of the oldest pending outbox event",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_oldest_pending_age_seconds");

        let published = IntCounter::with_opts(
            Opts::new(
                "outbox_events_published_total",
                "Total number of outbox events marked as published",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_events_published_total");

        let failed = IntCounter::with_opts(
            Opts::new(
                "outbox_events_failed_total",
                "Total number of outbox publish attempts that failed",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_events_failed_total");

        let claim_batch_size = IntGauge::with_opts(
            Opts::new(
                "outbox_claim_batch_size",
                "Number of rows claimed by the most recent relay batch",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_claim_batch_size");

        for metric in [
            Box::new(pending.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(oldest_pending_age_seconds.clone()),
            Box::new(published.clone()),
            Box::new(failed.clone()),
            Box::new(claim_batch_size.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register outbox metric: {}", e);
            }
        }

        Self {
            pending,
            oldest_pending_age_seconds,
            published,
            failed,
            claim_batch_size,
        }
    }
}
