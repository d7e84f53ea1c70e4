use crate::pool::DropReason;
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// Events emitted by the admission core.
///
/// Each gate and the worker pool emit structured events describing what they
/// decided. Sinks can log, count, or forward them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionEvent {
    /// Rate limiter events
    RateLimit(RateLimitEvent),
    /// Idempotency cache events
    Idempotency(IdempotencyEvent),
    /// Worker pool events
    Pool(PoolEvent),
}

/// Events emitted around the sliding-window limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitEvent {
    /// A submitter was over its window and got turned away.
    Denied {
        /// Submitter identity used as the limiter key
        key: String,
        /// Time until the oldest counted request leaves the window
        retry_after: Duration,
    },
    /// The periodic sweep dropped keys whose windows were empty.
    Swept {
        /// Number of keys removed
        evicted: usize,
    },
}

/// Events emitted around the idempotency cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyEvent {
    /// A duplicate was detected and the stored outcome replayed.
    Replayed {
        /// Status code of the replayed outcome
        status_code: u16,
    },
    /// A fresh outcome was recorded for a fingerprint.
    Recorded {
        /// Status code of the recorded outcome
        status_code: u16,
    },
    /// The backing store could not answer.
    StoreFailed,
    /// A fingerprint was invalidated after its submission failed to persist.
    Forgotten,
    /// The periodic sweep evicted expired records.
    Swept {
        /// Number of records removed
        evicted: usize,
    },
}

/// Events emitted by the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    /// A submission was dropped at the pool boundary.
    Dropped {
        /// Why the pool refused it
        reason: DropReason,
    },
    /// A worker persisted an item.
    Persisted {
        /// Time spent in the persistence call
        duration: Duration,
    },
    /// A worker's persistence call returned an error or panicked.
    PersistFailed {
        /// Time spent before failure
        duration: Duration,
    },
    /// A worker's persistence call exceeded the per-item timeout.
    PersistTimedOut {
        /// The per-item timeout that was exceeded
        timeout: Duration,
    },
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::RateLimit(event) => write!(f, "RateLimit::{}", event),
            AdmissionEvent::Idempotency(event) => write!(f, "Idempotency::{}", event),
            AdmissionEvent::Pool(event) => write!(f, "Pool::{}", event),
        }
    }
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitEvent::Denied { key, retry_after } => {
                write!(f, "Denied(key={}, retry_after={:?})", key, retry_after)
            }
            RateLimitEvent::Swept { evicted } => write!(f, "Swept(evicted={})", evicted),
        }
    }
}

impl fmt::Display for IdempotencyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdempotencyEvent::Replayed { status_code } => write!(f, "Replayed({})", status_code),
            IdempotencyEvent::Recorded { status_code } => write!(f, "Recorded({})", status_code),
            IdempotencyEvent::StoreFailed => write!(f, "StoreFailed"),
            IdempotencyEvent::Forgotten => write!(f, "Forgotten"),
            IdempotencyEvent::Swept { evicted } => write!(f, "Swept(evicted={})", evicted),
        }
    }
}

impl fmt::Display for PoolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolEvent::Dropped { reason } => write!(f, "Dropped({})", reason),
            PoolEvent::Persisted { duration } => write!(f, "Persisted(duration={:?})", duration),
            PoolEvent::PersistFailed { duration } => {
                write!(f, "PersistFailed(duration={:?})", duration)
            }
            PoolEvent::PersistTimedOut { timeout } => {
                write!(f, "PersistTimedOut(timeout={:?})", timeout)
            }
        }
    }
}

#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert an AdmissionEvent into a JSON value for sinks.
pub fn event_to_json(event: &AdmissionEvent) -> serde_json::Value {
    match event {
        AdmissionEvent::RateLimit(r) => match r {
            RateLimitEvent::Denied { key, retry_after } => json!({
                "kind": "rate_limited",
                "key": key,
                "retry_after_ms": clamp_u64(retry_after.as_millis()),
            }),
            RateLimitEvent::Swept { evicted } => {
                json!({ "kind": "rate_limit_swept", "evicted": *evicted })
            }
        },
        AdmissionEvent::Idempotency(i) => match i {
            IdempotencyEvent::Replayed { status_code } => {
                json!({ "kind": "duplicate_replayed", "status": *status_code })
            }
            IdempotencyEvent::Recorded { status_code } => {
                json!({ "kind": "outcome_recorded", "status": *status_code })
            }
            IdempotencyEvent::StoreFailed => json!({ "kind": "idempotency_store_failed" }),
            IdempotencyEvent::Forgotten => json!({ "kind": "fingerprint_forgotten" }),
            IdempotencyEvent::Swept { evicted } => {
                json!({ "kind": "idempotency_swept", "evicted": *evicted })
            }
        },
        AdmissionEvent::Pool(p) => match p {
            PoolEvent::Dropped { reason } => {
                json!({ "kind": "pool_dropped", "reason": reason.as_str() })
            }
            PoolEvent::Persisted { duration } => json!({
                "kind": "persisted",
                "duration_ms": clamp_u64(duration.as_millis())
            }),
            PoolEvent::PersistFailed { duration } => json!({
                "kind": "persist_failed",
                "duration_ms": clamp_u64(duration.as_millis())
            }),
            PoolEvent::PersistTimedOut { timeout } => json!({
                "kind": "persist_timed_out",
                "timeout_ms": clamp_u64(timeout.as_millis())
            }),
        },
    }
}
