#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # fieldgate
//!
//! Admission and processing core for field-reported status updates (crew
//! location and progress). Three pieces gate and drain inbound submissions:
//!
//! - **Sliding-window rate limiting** per submitter ([`SlidingWindowLimiter`])
//! - **Keyed idempotency** with TTL expiry and HMAC fingerprints ([`IdempotencyCache`])
//! - **A bounded worker pool** with drop-on-full backpressure and graceful drain ([`WorkerPool`])
//!
//! [`AdmissionCoordinator`] sequences them: duplicate check, then rate limit,
//! then hand-off to the pool.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fieldgate::{persist_fn, AdmissionConfig, AdmissionCoordinator, Submission};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AdmissionConfig::from_env()?;
//!     let persistence = persist_fn(|item: Submission| async move {
//!         println!("persisting {} bytes from {}", item.body.len(), item.submitter);
//!         Ok::<_, std::io::Error>(())
//!     });
//!
//!     let coordinator = AdmissionCoordinator::launch(config, persistence)?;
//!     let admission = coordinator.admit("crew-1", br#"{"status":"working"}"#).await?;
//!     println!("{} {:?}", admission.status_code(), admission.kind());
//!
//!     coordinator.shutdown(Duration::from_secs(30)).await?;
//!     Ok(())
//! }
//! ```

pub mod adaptive;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod idempotency;
pub mod pool;
pub mod prelude;
pub mod rate_limit;
pub mod sweep;
pub mod telemetry;
pub mod timeout;

// Re-exports
pub use adaptive::DynamicConfig;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{AdmissionConfig, DropPolicy, FingerprintScope, IdempotencyConfig, LimiterConfig, PoolConfig};
pub use coordinator::{Admission, AdmissionCoordinator, AdmissionKind, OutcomeLink, Submission};
pub use error::{AdmissionError, BoxError, ConfigError, PersistError, PoolError};
pub use idempotency::{
    FingerprintGenerator, IdempotencyCache, IdempotencyStore, InMemoryIdempotencyStore,
    StoredOutcome,
};
pub use pool::{persist_fn, DropReason, PersistFn, Persistence, QueuedItem, Submitted, WorkerPool};
pub use rate_limit::{Decision, RateLimiter, SlidingWindowLimiter};
pub use sweep::SweepTask;
pub use telemetry::Telemetry;
pub use timeout::TimeoutPolicy;
