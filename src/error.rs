//! Error types for the admission core.
//!
//! Nothing here is process-fatal. Rate-limit rejections and queue drops are not
//! errors at all (see [`Decision`](crate::Decision) and
//! [`Submitted`](crate::Submitted)); these types cover misconfiguration,
//! per-item persistence failure, pool lifecycle misuse, and an idempotency
//! backend that cannot answer.
use std::time::Duration;
use thiserror::Error;

/// Boxed error used where backends are erased.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced when validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Rate limit must admit at least one request per window.
    #[error("limit must be > 0 (got {provided})")]
    InvalidLimit {
        /// Value provided by caller.
        provided: usize,
    },
    /// Window must be non-zero.
    #[error("window must be > 0 (got {0:?})")]
    InvalidWindow(Duration),
    /// Idempotency TTL must be non-zero.
    #[error("idempotency ttl must be > 0 (got {0:?})")]
    InvalidTtl(Duration),
    /// Sweep interval must be non-zero.
    #[error("sweep interval must be > 0 (got {0:?})")]
    InvalidSweepInterval(Duration),
    /// The fingerprint secret must not be empty.
    #[error("idempotency secret must not be empty")]
    EmptySecret,
    /// Worker count must be > 0.
    #[error("num_workers must be > 0 (got {provided})")]
    InvalidWorkerCount {
        /// Value provided by caller.
        provided: usize,
    },
    /// Queue capacity must be > 0.
    #[error("buffer_size must be > 0 (got {provided})")]
    InvalidBufferSize {
        /// Value provided by caller.
        provided: usize,
    },
    /// Timeouts must be non-zero and finite.
    #[error("{name} must be non-zero and finite (got {value:?})")]
    InvalidTimeout {
        /// Which timeout was rejected.
        name: &'static str,
        /// Value provided by caller.
        value: Duration,
    },
    /// An enum-valued setting did not match any known variant.
    #[error("unknown value {value:?} for {key}")]
    UnknownVariant {
        /// Setting name.
        key: &'static str,
        /// Value provided by caller.
        value: String,
    },
}

/// Outcome of a single persistence attempt that did not succeed.
#[derive(Debug, Error)]
pub enum PersistError<E> {
    /// The persistence call exceeded the per-item timeout.
    #[error("persist timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },
    /// The persistence call panicked.
    #[error("persist panicked: {0}")]
    Panicked(String),
    /// The persistence backend reported an error.
    #[error("{0}")]
    Inner(#[source] E),
}

impl<E> PersistError<E> {
    /// Check if this error is due to the per-item timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error wraps a backend error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the backend error if this is an Inner variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Access timeout details as (elapsed, timeout).
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { elapsed, timeout } => Some((*elapsed, *timeout)),
            _ => None,
        }
    }
}

/// Worker pool lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// `start` was called on a running pool.
    #[error("worker pool already started")]
    AlreadyStarted,
    /// `start` was called after `shutdown`.
    #[error("worker pool has been shut down")]
    ShutDown,
    /// Workers were still busy when the shutdown timeout elapsed.
    ///
    /// In-flight items keep running to completion; no new items are picked up.
    #[error("worker pool shutdown timed out after {timeout:?} ({in_flight} item(s) still in flight)")]
    ShutdownTimedOut { timeout: Duration, in_flight: usize },
}

/// Errors surfaced by the admission coordinator.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// The idempotency backend failed, so duplicate status is unknown.
    ///
    /// The request must fail rather than proceed as either a duplicate or a
    /// fresh submission.
    #[error("duplicate status unknown: idempotency store failed: {0}")]
    IdempotencyUnavailable(#[source] BoxError),
    /// Configuration was rejected while assembling the coordinator.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The worker pool could not be started or stopped cleanly.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl AdmissionError {
    /// Check if the idempotency backend was unavailable.
    pub fn is_idempotency_unavailable(&self) -> bool {
        matches!(self, Self::IdempotencyUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;
    use std::io;

    #[test]
    fn persist_timeout_display() {
        let err: PersistError<io::Error> = PersistError::Timeout {
            elapsed: Duration::from_millis(10_050),
            timeout: Duration::from_secs(10),
        };
        let msg = err.to_string();
        assert!(msg.contains("timed out"));
        assert!(msg.contains("10.05"));
        assert!(err.is_timeout());
        assert!(!err.is_inner());
        assert_eq!(
            err.timeout_details(),
            Some((Duration::from_millis(10_050), Duration::from_secs(10)))
        );
    }

    #[test]
    fn persist_inner_is_transparent() {
        let err = PersistError::Inner(io::Error::new(io::ErrorKind::Other, "disk full"));
        assert_eq!(err.to_string(), "disk full");
        assert!(err.is_inner());
        assert_eq!(err.into_inner().unwrap().to_string(), "disk full");
    }

    #[test]
    fn shutdown_timeout_display_mentions_in_flight() {
        let err = PoolError::ShutdownTimedOut { timeout: Duration::from_millis(200), in_flight: 2 };
        let msg = err.to_string();
        assert!(msg.contains("200ms"));
        assert!(msg.contains("2 item(s)"));
    }

    #[test]
    fn idempotency_unavailable_keeps_source() {
        let err = AdmissionError::IdempotencyUnavailable(Box::new(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "cache down",
        )));
        assert!(err.is_idempotency_unavailable());
        assert!(err.to_string().contains("cache down"));
        assert!(err.source().is_some());
    }

    #[test]
    fn config_errors_convert_into_admission_errors() {
        let err: AdmissionError = ConfigError::InvalidLimit { provided: 0 }.into();
        assert!(matches!(err, AdmissionError::Config(ConfigError::InvalidLimit { provided: 0 })));
        assert_eq!(err.to_string(), "limit must be > 0 (got 0)");
    }
}
