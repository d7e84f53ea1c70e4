//! Convenient re-exports for common fieldgate types.
pub use crate::{
    config::{AdmissionConfig, DropPolicy, FingerprintScope, IdempotencyConfig, LimiterConfig, PoolConfig},
    coordinator::{Admission, AdmissionCoordinator, AdmissionKind, Submission},
    error::{AdmissionError, ConfigError, PoolError},
    idempotency::{FingerprintGenerator, IdempotencyCache, IdempotencyStore, StoredOutcome},
    pool::{persist_fn, Persistence, Submitted, WorkerPool},
    rate_limit::{Decision, RateLimiter, SlidingWindowLimiter},
    telemetry::{Telemetry, TelemetrySink},
};
