//! # Actix Middleware Library
//!
//! Ambient HTTP middleware shared by `dispatch-api`'s actix-web app.
//!
//! ## Modules
//! - `correlation_id`: stamps/echoes `X-Correlation-ID` on every request
//! - `logging`: structured request/response tracing
//! - `metrics`: Prometheus HTTP request counters and latency histograms

pub mod correlation_id;
pub mod logging;
pub mod metrics;

pub use correlation_id::{get_correlation_id, CorrelationIdMiddleware};
pub use logging::Logging;
pub use metrics::MetricsMiddleware;
