//! Per-item persistence timeout

use crate::error::{ConfigError, PersistError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Bounds how long one persistence call may occupy a worker.
///
/// Independent of the pool shutdown timeout: a stuck item is abandoned after
/// this duration and the worker moves on to the next item.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    /// Create a timeout policy. Rejects zero and `Duration::MAX`.
    pub fn new(duration: Duration) -> Result<Self, ConfigError> {
        if duration == Duration::ZERO || duration == Duration::MAX {
            return Err(ConfigError::InvalidTimeout { name: "item_timeout", value: duration });
        }
        Ok(Self { duration })
    }

    /// For durations already known to be non-zero and finite.
    pub(crate) const fn from_valid(duration: Duration) -> Self {
        Self { duration }
    }

    /// Inspect the configured timeout duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Drive `operation` to completion or until the timeout elapses.
    ///
    /// On timeout the operation future is dropped.
    pub async fn execute<T, E, Fut>(&self, operation: Fut) -> Result<T, PersistError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();

        match tokio::time::timeout(self.duration, operation).await {
            Ok(result) => result.map_err(PersistError::Inner),
            Err(_) => Err(PersistError::Timeout { elapsed: start.elapsed(), timeout: self.duration }),
        }
    }
}
