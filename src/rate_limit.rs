//! Rate limiting primitives.
//!
//! - [`RateLimiter`]: the admission-gate interface the coordinator talks to.
//! - [`Decision`]: the result of a check (Allowed/Denied), carrying what a
//!   transport needs for `X-RateLimit-Remaining` and `Retry-After`.
//! - [`SlidingWindowLimiter`]: per-key sliding-window log kept in memory.
//!
//! Limits are per process. Two instances behind a load balancer each admit up
//! to `limit` per key.

use async_trait::async_trait;
use std::time::Duration;

pub mod sliding_window;
pub use sliding_window::SlidingWindowLimiter;

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request was counted and may proceed.
    Allowed {
        /// Requests this key may still make in the current window.
        remaining: usize,
    },
    /// The key is at its limit. Nothing was counted.
    Denied {
        /// Time until the oldest counted request leaves the window.
        retry_after: Duration,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Requests left in the window; zero when denied.
    pub fn remaining(&self) -> usize {
        match self {
            Decision::Allowed { remaining } => *remaining,
            Decision::Denied { .. } => 0,
        }
    }

    /// Suggested wait before retrying, if denied.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Decision::Allowed { .. } => None,
            Decision::Denied { retry_after } => Some(*retry_after),
        }
    }
}

/// Per-key admission gate.
///
/// Implementations must be safe to call concurrently from many request
/// handlers; calls for the same key are serialized.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count a request for `key` if it fits in the window.
    fn check(&self, key: &str) -> Decision;

    /// How many more requests `key` may make right now. Counts nothing.
    fn remaining(&self, key: &str) -> usize;

    /// Boolean form of [`check`](Self::check).
    fn allow(&self, key: &str) -> bool {
        self.check(key).is_allowed()
    }

    /// Stop any background maintenance and wait for it to exit.
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_accessors() {
        let allowed = Decision::Allowed { remaining: 4 };
        assert!(allowed.is_allowed());
        assert_eq!(allowed.remaining(), 4);
        assert_eq!(allowed.retry_after(), None);

        let denied = Decision::Denied { retry_after: Duration::from_millis(300) };
        assert!(!denied.is_allowed());
        assert_eq!(denied.remaining(), 0);
        assert_eq!(denied.retry_after(), Some(Duration::from_millis(300)));
    }
}
