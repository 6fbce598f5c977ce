//! Client for the geospatial driver-location service: "nearest driver for
//! this order" over gRPC, wrapped in the same circuit-breaker + timeout
//! pattern this system applies to every inter-service call, narrowed here
//! to the single RPC dispatch-worker depends on.
//!
//! The location service itself (its sorted spatial index, its own
//! `UpdateDriverPosition` bootstrap path) is an external collaborator and out
//! of scope -- this crate only speaks its wire contract.

mod proto {
    tonic::include_proto!("fleetdispatch.location.v1");
}

use proto::location_service_client::LocationServiceClient as GrpcClient;
use proto::SearchDriverRequest;
use resilience::{presets, CircuitBreaker, CircuitBreakerError};
use std::time::Duration;
use thiserror::Error;
use tonic::transport::Channel;
use tonic::{Code, Request, Status};
use tracing::warn;

/// A driver located near an order, as returned by `SearchDriver`.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverLocation {
    pub driver_id: String,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Error)]
pub enum LocationError {
    /// No driver within radius. Non-retryable from the caller's point of
    /// view -- the dispatcher should fall back to manual dispatch.
    #[error("no driver found near order")]
    NotFound,

    /// Transient lookup failure (network blip, location service overloaded,
    /// or a request that didn't complete within the RPC timeout).
    #[error("location service unavailable: {0}")]
    Unavailable(String),

    /// The circuit is open: calls are failing fast rather than reaching the
    /// network at all.
    #[error("location service circuit breaker is open")]
    CircuitOpen,

    #[error("failed to connect to location service: {0}")]
    ConnectFailed(String),
}

impl LocationError {
    /// Only an actually-open breaker gets the fallback treatment (spec §7).
    /// A single `Unavailable` is an ordinary transient failure and must
    /// still traverse the wait queue for retry -- folding it in here would
    /// skip straight to manual dispatch on the first RPC hiccup instead of
    /// after the breaker trips on sustained failure.
    pub fn is_breaker_signal(&self) -> bool {
        matches!(self, LocationError::CircuitOpen)
    }
}

/// Outcome of one RPC attempt, as seen by the circuit breaker: `NotFound` is
/// a legitimate business result and must not count as a breaker failure, so
/// it is folded into `Ok` rather than `Err`.
enum RawOutcome {
    Found(DriverLocation),
    NotFound,
}

/// gRPC client for `SearchDriver`, circuit-broken and timeout-bounded per
/// [`presets::location_rpc_config`] (5s timeout, 5-failure/30s-cooldown
/// breaker, no retry -- a slow location service falls back to manual
/// dispatch instead of stalling the order).
#[derive(Clone)]
pub struct LocationServiceClient {
    inner: GrpcClient<Channel>,
    breaker: CircuitBreaker,
    timeout: Duration,
}

impl LocationServiceClient {
    pub async fn connect(endpoint: impl Into<String>) -> Result<Self, LocationError> {
        let endpoint = endpoint.into();
        let channel = Channel::from_shared(endpoint.clone())
            .map_err(|e| LocationError::ConnectFailed(e.to_string()))?
            .connect()
            .await
            .map_err(|e| LocationError::ConnectFailed(e.to_string()))?;

        let config = presets::location_rpc_config();
        Ok(Self {
            inner: GrpcClient::new(channel),
            breaker: CircuitBreaker::new(config.circuit_breaker),
            timeout: config.timeout.duration,
        })
    }

    /// Look up the nearest driver for `order_id`.
    ///
    /// `NotFound` from the location service is a legitimate business
    /// outcome, not an infrastructure failure, so it does not trip the
    /// circuit breaker. Any other error (transport failure, deadline
    /// exceeded) does.
    pub async fn search_driver(&self, order_id: &str) -> Result<DriverLocation, LocationError> {
        let mut client = self.inner.clone();
        let call_order_id = order_id.to_string();
        let timeout = self.timeout;

        let outcome = self
            .breaker
            .call(|| async move {
                let request = Request::new(SearchDriverRequest {
                    order_id: call_order_id,
                });
                match tokio::time::timeout(timeout, client.search_driver(request)).await {
                    Ok(Ok(response)) => {
                        let response = response.into_inner();
                        Ok(RawOutcome::Found(DriverLocation {
                            driver_id: response.driver_id,
                            name: response.name,
                            lat: response.lat,
                            lng: response.lng,
                        }))
                    }
                    Ok(Err(status)) if status.code() == Code::NotFound => Ok(RawOutcome::NotFound),
                    Ok(Err(status)) => Err(status_message(&status)),
                    Err(_elapsed) => Err(format!("location rpc timed out after {timeout:?}")),
                }
            })
            .await;

        match outcome {
            Ok(RawOutcome::Found(location)) => Ok(location),
            Ok(RawOutcome::NotFound) => Err(LocationError::NotFound),
            Err(CircuitBreakerError::Open) => {
                warn!(order_id = %order_id, "location rpc skipped: circuit open");
                Err(LocationError::CircuitOpen)
            }
            Err(CircuitBreakerError::CallFailed(message)) => Err(LocationError::Unavailable(message)),
        }
    }

    pub fn breaker_state(&self) -> resilience::CircuitState {
        self.breaker.state()
    }
}

fn status_message(status: &Status) -> String {
    format!("{:?}: {}", status.code(), status.message())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_signal_classification() {
        assert!(LocationError::CircuitOpen.is_breaker_signal());
        assert!(!LocationError::Unavailable("x".into()).is_breaker_signal());
        assert!(!LocationError::NotFound.is_breaker_signal());
        assert!(!LocationError::ConnectFailed("x".into()).is_breaker_signal());
    }
}
