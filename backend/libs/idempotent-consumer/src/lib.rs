//! Redis-backed idempotency guard for the consumer pipeline.
//!
//! Deduplicates deliveries of the same logical event before the handler's
//! business call runs. Keyed `dedup:<handler>:<event_id>`, claimed with
//! `SET ... NX EX <ttl>` so concurrent workers race safely: exactly one
//! claim wins, the rest observe a duplicate and skip the side effect.
//!
//! This deliberately trades a durable Postgres `processed_events` table
//! (durable across restarts, but another write on the hot path) for Redis:
//! the dedup window here is a 24h TTL, not forever, and the store already
//! sits in the critical path for every message, so an extra round trip to a
//! second system is the wrong shape. `release()` has no Postgres analogue --
//! it exists so error classification on the consumer side can give back a
//! claim when a delivery is going to be retried rather than parked.

mod error;

pub use error::{IdempotencyError, IdempotencyResult};

use redis::AsyncCommands;
use redis_utils::{with_timeout, SharedConnectionManager};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, warn};

const CLAIMED_MARKER: &str = "processing";

/// Outcome of attempting to claim an event for processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This call acquired the claim; the caller should proceed.
    Claimed,
    /// Another delivery already holds (or completed) this claim.
    Duplicate,
}

/// Guards a handler against concurrent or redelivered processing of the same
/// logical event.
#[derive(Clone)]
pub struct IdempotencyGuard {
    manager: SharedConnectionManager,
    handler: String,
    ttl: Duration,
}

impl IdempotencyGuard {
    /// `handler` namespaces the key space (e.g. `"orders.created"`) so two
    /// consumers deduplicating the same broker message don't collide.
    pub fn new(manager: SharedConnectionManager, handler: impl Into<String>, ttl: Duration) -> Self {
        Self {
            manager,
            handler: handler.into(),
            ttl,
        }
    }

    /// Default 24h TTL covers the broker's max redelivery window with room
    /// to spare.
    pub fn with_default_ttl(manager: SharedConnectionManager, handler: impl Into<String>) -> Self {
        Self::new(manager, handler, Duration::from_secs(24 * 3600))
    }

    /// Derive the dedup key: the `x-event-id` header when present, otherwise
    /// the SHA-256 of the raw payload.
    pub fn event_key(event_id: Option<&str>, payload: &[u8]) -> String {
        match event_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let mut hasher = Sha256::new();
                hasher.update(payload);
                hex::encode(hasher.finalize())
            }
        }
    }

    fn redis_key(&self, event_key: &str) -> String {
        format!("dedup:{}:{}", self.handler, event_key)
    }

    /// Attempt to claim `event_key` for processing.
    ///
    /// `SETNX` semantics: the first caller gets `Claimed`; any concurrent or
    /// later caller within the TTL window gets `Duplicate`. Callers that
    /// observe `Duplicate` must ack the message without running the
    /// business call.
    pub async fn claim(&self, event_key: &str) -> IdempotencyResult<ClaimOutcome> {
        Self::validate_key(event_key)?;
        let key = self.redis_key(event_key);
        let ttl_secs = self.ttl.as_secs().max(1);

        let acquired: bool = with_timeout(async {
            let mut conn = self.manager.lock().await;
            redis::cmd("SET")
                .arg(&key)
                .arg(CLAIMED_MARKER)
                .arg("NX")
                .arg("EX")
                .arg(ttl_secs)
                .query_async::<_, Option<String>>(&mut *conn)
                .await
                .map(|v| v.is_some())
        })
        .await?;

        if acquired {
            debug!(event_key = %event_key, handler = %self.handler, "idempotency claim acquired");
            Ok(ClaimOutcome::Claimed)
        } else {
            debug!(event_key = %event_key, handler = %self.handler, "duplicate delivery detected");
            Ok(ClaimOutcome::Duplicate)
        }
    }

    /// Release a previously acquired claim so a subsequent redelivery may
    /// reacquire it. Called when a handler fails transiently -- a retry must
    /// not find the dedup key permanently poisoned.
    pub async fn release(&self, event_key: &str) -> IdempotencyResult<()> {
        Self::validate_key(event_key)?;
        let key = self.redis_key(event_key);

        let deleted: i64 = with_timeout(async {
            let mut conn = self.manager.lock().await;
            conn.del(&key).await
        })
        .await?;

        if deleted > 0 {
            debug!(event_key = %event_key, handler = %self.handler, "idempotency claim released");
        } else {
            warn!(event_key = %event_key, handler = %self.handler, "release on a claim that was not held (expired or never claimed)");
        }

        Ok(())
    }

    fn validate_key(event_key: &str) -> IdempotencyResult<()> {
        if event_key.is_empty() {
            return Err(IdempotencyError::InvalidEventKey(
                "event key cannot be empty".to_string(),
            ));
        }
        if event_key.len() > 512 {
            return Err(IdempotencyError::InvalidEventKey(format!(
                "event key too long: {} chars (max 512)",
                event_key.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_key_prefers_header_id() {
        let key = IdempotencyGuard::event_key(Some("evt-123"), b"{\"id\":\"o1\"}");
        assert_eq!(key, "evt-123");
    }

    #[test]
    fn event_key_falls_back_to_payload_hash() {
        let key_a = IdempotencyGuard::event_key(None, b"{\"id\":\"o1\"}");
        let key_b = IdempotencyGuard::event_key(None, b"{\"id\":\"o1\"}");
        let key_c = IdempotencyGuard::event_key(None, b"{\"id\":\"o2\"}");
        assert_eq!(key_a, key_b, "identical payloads hash identically");
        assert_ne!(key_a, key_c, "different payloads hash differently");
        assert_eq!(key_a.len(), 64, "sha256 hex digest is 64 chars");
    }

    #[test]
    fn event_key_ignores_empty_header() {
        let key = IdempotencyGuard::event_key(Some(""), b"payload");
        assert_eq!(key, IdempotencyGuard::event_key(None, b"payload"));
    }

    #[test]
    fn validate_key_rejects_empty_and_oversized() {
        assert!(IdempotencyGuard::validate_key("evt-1").is_ok());
        assert!(matches!(
            IdempotencyGuard::validate_key("").unwrap_err(),
            IdempotencyError::InvalidEventKey(_)
        ));
        let oversized = "x".repeat(513);
        assert!(matches!(
            IdempotencyGuard::validate_key(&oversized).unwrap_err(),
            IdempotencyError::InvalidEventKey(_)
        ));
    }
}
