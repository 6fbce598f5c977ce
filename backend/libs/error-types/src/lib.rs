//! Unified error type shared by `dispatch-api` and `dispatch-worker`.
//!
//! Provides `status_code`/`error_code`/`error_type`/`to_response`, extended
//! with this system's own domain variants so that an illegal FSM transition
//! or an unknown persisted status string is never laundered into a generic
//! `InternalError` before it reaches the HTTP boundary or the consumer's
//! ack/nack decision.

use order_domain::OrderError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Standard error response body for `dispatch-api`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
    pub error_type: String,
    pub code: String,
    pub details: Option<String>,
    pub timestamp: String,
}

/// Service-level error type, shared by both binaries.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Timeout")]
    Timeout,

    /// An FSM transition was attempted that is not legal from the order's
    /// current state. Never retried: the message is poison, not transient.
    #[error("Invalid order state transition: {0}")]
    DomainTransition(#[from] OrderError),

    /// A persisted `orders.status` value did not match any known
    /// `OrderStatus` variant. Distinct from `DomainTransition` because it
    /// indicates corrupted state rather than a bad request.
    #[error("Unknown order status: {0}")]
    UnknownState(String),
}

impl ServiceError {
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::NotFound(_) => 404,
            ServiceError::ValidationError(_) => 400,
            ServiceError::Conflict(_) => 409,
            ServiceError::ServiceUnavailable(_) => 503,
            ServiceError::Timeout => 408,
            ServiceError::DomainTransition(_) => 409,
            ServiceError::UnknownState(_) => 500,
            ServiceError::Database(_) | ServiceError::InternalError(_) => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::ValidationError(_) => "VALIDATION_ERROR",
            ServiceError::Conflict(_) => "CONFLICT",
            ServiceError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            ServiceError::Timeout => "TIMEOUT",
            ServiceError::DomainTransition(_) => "INVALID_STATE_TRANSITION",
            ServiceError::UnknownState(_) => "UNKNOWN_STATE",
            ServiceError::Database(_) => "DATABASE_ERROR",
            ServiceError::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ServiceError::Database(_) => "DatabaseError",
            ServiceError::NotFound(_) => "NotFoundError",
            ServiceError::ValidationError(_) => "ValidationError",
            ServiceError::Conflict(_) => "ConflictError",
            ServiceError::ServiceUnavailable(_) => "ServiceUnavailableError",
            ServiceError::Timeout => "TimeoutError",
            ServiceError::DomainTransition(_) => "DomainTransitionError",
            ServiceError::UnknownState(_) => "UnknownStateError",
            ServiceError::InternalError(_) => "InternalError",
        }
    }

    /// Transient infrastructure failures are the ones the outbox relay's
    /// rescuer and the consumer's wait-queue retry apply to; domain errors
    /// (validation, conflict, FSM) never are.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceError::Database(_)
                | ServiceError::ServiceUnavailable(_)
                | ServiceError::Timeout
                | ServiceError::InternalError(_)
        )
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.error_type().to_string(),
            message: self.to_string(),
            status: self.status_code(),
            error_type: self.error_type().to_string(),
            code: self.error_code().to_string(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ServiceError::NotFound("order not found".to_string()),
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                ServiceError::Conflict("order id already exists".to_string())
            }
            other => ServiceError::Database(other.to_string()),
        }
    }
}

impl actix_web::ResponseError for ServiceError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        actix_web::http::StatusCode::from_u16(ServiceError::status_code(self))
            .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> actix_web::HttpResponse {
        actix_web::HttpResponse::build(actix_web::ResponseError::status_code(self))
            .json(self.to_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_http_semantics() {
        assert_eq!(ServiceError::NotFound("o1".into()).status_code(), 404);
        assert_eq!(
            ServiceError::ValidationError("bad price".into()).status_code(),
            400
        );
        assert_eq!(ServiceError::Conflict("o1".into()).status_code(), 409);
        assert_eq!(
            ServiceError::ServiceUnavailable("db down".into()).status_code(),
            503
        );
    }

    #[test]
    fn domain_transition_is_conflict_not_retried() {
        let err = ServiceError::from(OrderError::InvalidStateTransition {
            from: "DELIVERED".into(),
            event: "Cancel".into(),
        });
        assert_eq!(err.status_code(), 409);
        assert!(!err.is_transient());
    }

    #[test]
    fn transient_classification() {
        assert!(ServiceError::Timeout.is_transient());
        assert!(ServiceError::Database("conn reset".into()).is_transient());
        assert!(!ServiceError::ValidationError("x".into()).is_transient());
        assert!(!ServiceError::Conflict("o1".into()).is_transient());
    }

    #[test]
    fn to_response_carries_code_and_status() {
        let err = ServiceError::NotFound("o1".into());
        let response = err.to_response();
        assert_eq!(response.status, 404);
        assert_eq!(response.code, "NOT_FOUND");
    }
}
