//! Telemetry for the admission core.
//!
//! Gates and workers describe what they decided as [`AdmissionEvent`]s. Events
//! flow through a [`TelemetrySink`], which is a `tower::Service<AdmissionEvent>`
//! so sinks compose with ordinary tower middleware.
//!
//! # Event Types
//!
//! - **Rate limiter**: `Denied`, `Swept`
//! - **Idempotency**: `Replayed`, `Recorded`, `StoreFailed`, `Forgotten`, `Swept`
//! - **Worker pool**: `Dropped`, `Persisted`, `PersistFailed`, `PersistTimedOut`
//!
//! Emission is best-effort: a slow or failing sink never changes an admission
//! decision.

pub mod events;
pub mod sinks;

pub use events::{event_to_json, AdmissionEvent, IdempotencyEvent, PoolEvent, RateLimitEvent};
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, StreamingSink, TelemetrySink};

use crate::error::BoxError;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tower::util::BoxCloneService;
use tower::ServiceExt as _;

/// Type-erased, cloneable handle to whichever sink the host installed.
///
/// Components hold one of these instead of being generic over the sink type.
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<Mutex<BoxCloneService<AdmissionEvent, (), BoxError>>>,
}

impl Telemetry {
    /// Wrap a sink.
    pub fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        let erased = sink.map_err(|err| Box::new(err) as BoxError);
        Self { sink: Arc::new(Mutex::new(BoxCloneService::new(erased))) }
    }

    /// Discard every event.
    pub fn null() -> Self {
        Self::new(NullSink)
    }

    /// Deliver `event` to the sink, ignoring sink failures.
    pub async fn emit(&self, event: AdmissionEvent) {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
        emit_best_effort(sink, event).await;
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn telemetry_handle_forwards_to_sink() {
        let sink = MemorySink::new();
        let telemetry = Telemetry::new(sink.clone());
        let clone = telemetry.clone();

        clone.emit(AdmissionEvent::Idempotency(IdempotencyEvent::StoreFailed)).await;
        telemetry.emit(AdmissionEvent::RateLimit(RateLimitEvent::Swept { evicted: 3 })).await;

        assert_eq!(
            sink.events(),
            vec![
                AdmissionEvent::Idempotency(IdempotencyEvent::StoreFailed),
                AdmissionEvent::RateLimit(RateLimitEvent::Swept { evicted: 3 }),
            ]
        );
    }
}
