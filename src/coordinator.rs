//! Admission coordinator: idempotency check, then rate limit, then the pool.
//!
//! ```text
//! admit(submitter, body)
//!   fingerprint = HMAC(secret, submitter ":" body)
//!   recorded outcome for fingerprint?   -> Replayed (no further work)
//!   limiter.check(submitter) denied?    -> RateLimited (429)
//!   record 202 under fingerprint, submit to pool
//!   pool dropped it and policy = Reject -> forget record, Rejected (503)
//!                                       -> Accepted (202)
//! ```
//!
//! A duplicate is answered before the limiter sees it, so client retries of an
//! already-accepted update never spend the submitter's budget.

use crate::config::{AdmissionConfig, DropPolicy, FingerprintScope};
use crate::error::AdmissionError;
use crate::idempotency::{
    FingerprintGenerator, IdempotencyCache, IdempotencyStore, InMemoryIdempotencyStore, StoredOutcome,
};
use crate::pool::{DropReason, Persistence, Submitted, WorkerPool};
use crate::rate_limit::{Decision, RateLimiter, SlidingWindowLimiter};
use crate::telemetry::{AdmissionEvent, RateLimitEvent, Telemetry};
use async_trait::async_trait;
use serde_json::json;
use std::fmt;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const JSON: &str = "application/json";

/// An admitted status update on its way to persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Caller-supplied routing key (crew identifier).
    pub submitter: String,
    /// Idempotency fingerprint it was admitted under.
    pub fingerprint: String,
    /// Raw payload bytes, unparsed.
    pub body: Vec<u8>,
    pub received_at: SystemTime,
}

/// Result of [`AdmissionCoordinator::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// New submission, queued for persistence.
    Accepted {
        outcome: StoredOutcome,
        /// Requests the submitter may still make this window.
        remaining: usize,
    },
    /// Seen before; `outcome` is what the first submission got.
    Replayed { outcome: StoredOutcome },
    /// Submitter is over its limit. Nothing was queued or recorded.
    RateLimited { outcome: StoredOutcome, retry_after: Duration },
    /// The pool refused the item and [`DropPolicy::Reject`] is in force.
    Rejected { outcome: StoredOutcome, reason: DropReason },
}

/// Discriminant of [`Admission`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdmissionKind {
    Accepted,
    Replayed,
    RateLimited,
    Rejected,
}

impl Admission {
    /// The response to hand back to the caller.
    pub fn outcome(&self) -> &StoredOutcome {
        match self {
            Admission::Accepted { outcome, .. }
            | Admission::Replayed { outcome }
            | Admission::RateLimited { outcome, .. }
            | Admission::Rejected { outcome, .. } => outcome,
        }
    }

    pub fn into_outcome(self) -> StoredOutcome {
        match self {
            Admission::Accepted { outcome, .. }
            | Admission::Replayed { outcome }
            | Admission::RateLimited { outcome, .. }
            | Admission::Rejected { outcome, .. } => outcome,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.outcome().status_code
    }

    pub fn kind(&self) -> AdmissionKind {
        match self {
            Admission::Accepted { .. } => AdmissionKind::Accepted,
            Admission::Replayed { .. } => AdmissionKind::Replayed,
            Admission::RateLimited { .. } => AdmissionKind::RateLimited,
            Admission::Rejected { .. } => AdmissionKind::Rejected,
        }
    }
}

/// Persistence wrapper that can invalidate a fingerprint when its submission
/// fails to persist.
///
/// With forgetting enabled, a backend error deletes the idempotency record so
/// the client's retry is processed rather than replayed. Timeouts and panics
/// leave the record alone: the write may still have landed.
pub struct OutcomeLink<P, S> {
    inner: P,
    forget: Option<IdempotencyCache<S>>,
}

impl<P, S> OutcomeLink<P, S> {
    /// Pass-through; records are never invalidated.
    pub fn detached(inner: P) -> Self {
        Self { inner, forget: None }
    }

    /// Invalidate records in `cache` when `inner` fails.
    pub fn forgetting(inner: P, cache: IdempotencyCache<S>) -> Self {
        Self { inner, forget: Some(cache) }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn forgets_failures(&self) -> bool {
        self.forget.is_some()
    }
}

#[async_trait]
impl<P, S> Persistence<Submission> for OutcomeLink<P, S>
where
    P: Persistence<Submission>,
    S: IdempotencyStore,
{
    type Error = P::Error;

    async fn store(&self, item: Submission) -> Result<(), P::Error> {
        let Some(cache) = &self.forget else {
            return self.inner.store(item).await;
        };
        let fingerprint = item.fingerprint.clone();
        let result = self.inner.store(item).await;
        if result.is_err() {
            if let Err(err) = cache.delete(&fingerprint).await {
                warn!(
                    target: "fieldgate::admission",
                    error = %err,
                    "could not invalidate fingerprint of failed submission"
                );
            }
        }
        result
    }

    async fn health_check(&self) -> Result<(), P::Error> {
        self.inner.health_check().await
    }

    async fn close(&self) -> Result<(), P::Error> {
        self.inner.close().await
    }
}

/// Sequences the idempotency cache, the rate limiter, and the worker pool.
pub struct AdmissionCoordinator<P, S = InMemoryIdempotencyStore, L = SlidingWindowLimiter>
where
    P: Persistence<Submission>,
    S: IdempotencyStore,
    L: RateLimiter,
{
    limiter: L,
    cache: IdempotencyCache<S>,
    pool: WorkerPool<Submission, OutcomeLink<P, S>>,
    scope: FingerprintScope,
    drop_policy: DropPolicy,
    shutdown_timeout: Duration,
    telemetry: Telemetry,
}

impl<P> AdmissionCoordinator<P>
where
    P: Persistence<Submission>,
{
    /// Build the in-memory limiter and store, start their sweeps, and start
    /// the worker pool. Must be called from within a Tokio runtime.
    pub fn launch(config: AdmissionConfig, persistence: P) -> Result<Self, AdmissionError> {
        Self::launch_with_telemetry(config, persistence, Telemetry::null())
    }

    pub fn launch_with_telemetry(
        config: AdmissionConfig,
        persistence: P,
        telemetry: Telemetry,
    ) -> Result<Self, AdmissionError> {
        if config.idempotency.uses_default_secret() {
            warn!(
                target: "fieldgate::admission",
                "IDEMPOTENCY_SECRET not set; using the built-in placeholder secret"
            );
        }
        let keys = FingerprintGenerator::new(config.idempotency.secret())?;
        let limiter = SlidingWindowLimiter::new(config.limiter)
            .with_telemetry(telemetry.clone())
            .start();
        let store = InMemoryIdempotencyStore::new(config.idempotency.ttl())
            .with_telemetry(telemetry.clone())
            .start(config.idempotency.sweep_interval());
        let cache = IdempotencyCache::new(store, keys).with_telemetry(telemetry.clone());
        Self::assemble(&config, limiter, cache, persistence, telemetry)
    }
}

impl<P, S, L> AdmissionCoordinator<P, S, L>
where
    P: Persistence<Submission>,
    S: IdempotencyStore,
    L: RateLimiter,
{
    /// Wire caller-built gates to a new worker pool and start it.
    pub fn assemble(
        config: &AdmissionConfig,
        limiter: L,
        cache: IdempotencyCache<S>,
        persistence: P,
        telemetry: Telemetry,
    ) -> Result<Self, AdmissionError> {
        let link = if config.forget_failed_submissions {
            OutcomeLink::forgetting(persistence, cache.clone())
        } else {
            OutcomeLink::detached(persistence)
        };
        let pool = WorkerPool::new(config.pool, link).with_telemetry(telemetry.clone());
        pool.start()?;
        info!(
            target: "fieldgate::admission",
            limit = config.limiter.limit(),
            window = ?config.limiter.window(),
            ttl = ?config.idempotency.ttl(),
            workers = config.pool.num_workers(),
            buffer = config.pool.buffer_size(),
            drop_policy = ?config.drop_policy,
            "admission coordinator ready"
        );
        Ok(Self {
            limiter,
            cache,
            pool,
            scope: config.idempotency.scope(),
            drop_policy: config.drop_policy,
            shutdown_timeout: config.pool.shutdown_timeout(),
            telemetry,
        })
    }

    /// Decide what happens to one inbound status update.
    ///
    /// Errors only when the idempotency store cannot say whether this is a
    /// duplicate or cannot record the outcome; nothing is queued and the
    /// caller should answer 503 and let the client retry.
    pub async fn admit(
        &self,
        submitter: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<Admission, AdmissionError> {
        let body = body.into();
        let fingerprint = match self.scope {
            FingerprintScope::Body => self.cache.generate_key(&body),
            FingerprintScope::Submitter => self.cache.generate_key_with_context(&body, submitter),
        };

        let recorded = self
            .cache
            .check_duplicate(&fingerprint)
            .await
            .map_err(|err| AdmissionError::IdempotencyUnavailable(Box::new(err)))?;
        if let Some(outcome) = recorded {
            debug!(target: "fieldgate::admission", submitter, "replaying recorded outcome");
            return Ok(Admission::Replayed { outcome });
        }

        let remaining = match self.limiter.check(submitter) {
            Decision::Allowed { remaining } => remaining,
            Decision::Denied { retry_after } => {
                debug!(target: "fieldgate::admission", submitter, ?retry_after, "rate limited");
                self.telemetry
                    .emit(AdmissionEvent::RateLimit(RateLimitEvent::Denied {
                        key: submitter.to_owned(),
                        retry_after,
                    }))
                    .await;
                return Ok(Admission::RateLimited {
                    outcome: rate_limited_outcome(retry_after),
                    retry_after,
                });
            }
        };

        // Record before queueing so a failed persist can always invalidate it.
        // Without a record a retry would be processed again, so an unrecorded
        // submission is never queued.
        let outcome = accepted_outcome(submitter);
        self.cache
            .store_outcome(&fingerprint, outcome.clone())
            .await
            .map_err(|err| AdmissionError::IdempotencyUnavailable(Box::new(err)))?;

        let submission = Submission {
            submitter: submitter.to_owned(),
            fingerprint: fingerprint.clone(),
            body,
            received_at: SystemTime::now(),
        };
        if let Submitted::Dropped(reason) = self.pool.submit(submission).await {
            if self.drop_policy == DropPolicy::Reject {
                if let Err(err) = self.cache.delete(&fingerprint).await {
                    warn!(
                        target: "fieldgate::admission",
                        error = %err,
                        "could not invalidate fingerprint of rejected submission"
                    );
                }
                return Ok(Admission::Rejected { outcome: unavailable_outcome(reason), reason });
            }
        }

        debug!(target: "fieldgate::admission", submitter, remaining, "accepted");
        Ok(Admission::Accepted { outcome, remaining })
    }

    /// Requests `submitter` may still make this window.
    pub fn remaining(&self, submitter: &str) -> usize {
        self.limiter.remaining(submitter)
    }

    /// [`shutdown`](Self::shutdown) with the configured shutdown timeout.
    pub async fn close(&self) -> Result<(), AdmissionError> {
        self.shutdown(self.shutdown_timeout).await
    }

    /// Drain the pool within `timeout`, then stop the limiter's sweep and
    /// close the idempotency store.
    ///
    /// The limiter and store are closed even when draining times out.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), AdmissionError> {
        let drained = self.pool.shutdown(timeout).await;
        self.limiter.close().await;
        if let Err(err) = self.cache.close().await {
            warn!(target: "fieldgate::admission", error = %err, "idempotency store close failed");
        }
        drained?;
        info!(target: "fieldgate::admission", "admission coordinator stopped");
        Ok(())
    }

    pub fn limiter(&self) -> &L {
        &self.limiter
    }

    pub fn cache(&self) -> &IdempotencyCache<S> {
        &self.cache
    }

    pub fn pool(&self) -> &WorkerPool<Submission, OutcomeLink<P, S>> {
        &self.pool
    }
}

impl<P, S, L> fmt::Debug for AdmissionCoordinator<P, S, L>
where
    P: Persistence<Submission>,
    S: IdempotencyStore,
    L: RateLimiter,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionCoordinator")
            .field("scope", &self.scope)
            .field("drop_policy", &self.drop_policy)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

fn accepted_outcome(submitter: &str) -> StoredOutcome {
    let body = json!({
        "success": true,
        "message": "Status update accepted",
        "request_id": submitter,
    });
    StoredOutcome::new(202, body.to_string(), JSON)
}

fn rate_limited_outcome(retry_after: Duration) -> StoredOutcome {
    let body = json!({
        "success": false,
        "error": "Rate limit exceeded",
        "retry_after_ms": u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
    });
    StoredOutcome::new(429, body.to_string(), JSON)
}

fn unavailable_outcome(reason: DropReason) -> StoredOutcome {
    let body = json!({
        "success": false,
        "error": "Status update not accepted; retry later",
        "reason": reason.as_str(),
    });
    StoredOutcome::new(503, body.to_string(), JSON)
}
