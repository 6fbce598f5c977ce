//! Error types for the idempotent consumer library.

use thiserror::Error;

/// Result type for idempotency operations.
pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

/// Errors that can occur while guarding a handler against duplicate delivery.
#[derive(Error, Debug)]
pub enum IdempotencyError {
    /// The Redis command failed or timed out. Fails closed: callers should
    /// negative-ack with requeue rather than risk a double side effect.
    #[error("Redis error: {0}")]
    Store(#[from] redis::RedisError),

    /// Event key validation failed (empty, too long).
    #[error("Invalid event key: {0}")]
    InvalidEventKey(String),
}
