//! Duplicate suppression keyed by content fingerprints.
//!
//! A retried submission is recognised by its fingerprint and answered with the
//! outcome recorded the first time, instead of being processed again.
//!
//! - [`FingerprintGenerator`]: keyed HMAC-SHA256 fingerprints.
//! - [`IdempotencyStore`]: where outcomes live, with a TTL; fallible so a
//!   networked backend can stand in for [`InMemoryIdempotencyStore`].
//! - [`IdempotencyCache`]: the two together, plus logging and telemetry.
//!
//! A record moves `absent -> recorded -> expired -> absent`. It is replaced
//! wholesale, never edited.

pub mod fingerprint;
pub mod store;

pub use fingerprint::FingerprintGenerator;
pub use store::{IdempotencyStore, InMemoryIdempotencyStore, StoredOutcome};

use crate::telemetry::{AdmissionEvent, IdempotencyEvent, Telemetry};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Fingerprinting plus outcome storage.
///
/// Cheap to clone; clones share the store.
pub struct IdempotencyCache<S> {
    store: Arc<S>,
    keys: FingerprintGenerator,
    telemetry: Telemetry,
}

impl<S> Clone for IdempotencyCache<S> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store), keys: self.keys.clone(), telemetry: self.telemetry.clone() }
    }
}

impl<S: IdempotencyStore> IdempotencyCache<S> {
    pub fn new(store: S, keys: FingerprintGenerator) -> Self {
        Self::from_shared(Arc::new(store), keys)
    }

    /// Use a store that something else also holds.
    pub fn from_shared(store: Arc<S>, keys: FingerprintGenerator) -> Self {
        Self { store, keys, telemetry: Telemetry::null() }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn generate_key(&self, body: &[u8]) -> String {
        self.keys.generate_key(body)
    }

    pub fn generate_key_with_context(&self, body: &[u8], context: &str) -> String {
        self.keys.generate_key_with_context(body, context)
    }

    pub fn fingerprints(&self) -> &FingerprintGenerator {
        &self.keys
    }

    /// The outcome recorded for `key`, if it is still live.
    ///
    /// An error means duplicate status is unknown; callers must fail the
    /// request rather than treat it as fresh.
    pub async fn check_duplicate(&self, key: &str) -> Result<Option<StoredOutcome>, S::Error> {
        match self.store.get(key).await {
            Ok(Some(outcome)) => {
                debug!(
                    target: "fieldgate::idempotency",
                    status = outcome.status_code,
                    "duplicate detected"
                );
                self.telemetry
                    .emit(AdmissionEvent::Idempotency(IdempotencyEvent::Replayed {
                        status_code: outcome.status_code,
                    }))
                    .await;
                Ok(Some(outcome))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                warn!(target: "fieldgate::idempotency", error = %err, "idempotency lookup failed");
                self.telemetry.emit(AdmissionEvent::Idempotency(IdempotencyEvent::StoreFailed)).await;
                Err(err)
            }
        }
    }

    /// Record the response for `key`, replacing any earlier one.
    pub async fn store_result(
        &self,
        key: &str,
        status_code: u16,
        body: impl Into<Vec<u8>>,
        content_type: impl Into<String>,
    ) -> Result<(), S::Error> {
        self.store_outcome(key, StoredOutcome::new(status_code, body, content_type)).await
    }

    pub async fn store_outcome(&self, key: &str, outcome: StoredOutcome) -> Result<(), S::Error> {
        let status_code = outcome.status_code;
        match self.store.set(key, outcome).await {
            Ok(()) => {
                self.telemetry
                    .emit(AdmissionEvent::Idempotency(IdempotencyEvent::Recorded { status_code }))
                    .await;
                Ok(())
            }
            Err(err) => {
                warn!(target: "fieldgate::idempotency", error = %err, "failed to record outcome");
                self.telemetry.emit(AdmissionEvent::Idempotency(IdempotencyEvent::StoreFailed)).await;
                Err(err)
            }
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool, S::Error> {
        self.store.exists(key).await
    }

    /// Invalidate `key` so the next submission with it is processed afresh.
    pub async fn delete(&self, key: &str) -> Result<(), S::Error> {
        self.store.delete(key).await?;
        debug!(target: "fieldgate::idempotency", "fingerprint invalidated");
        self.telemetry.emit(AdmissionEvent::Idempotency(IdempotencyEvent::Forgotten)).await;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), S::Error> {
        self.store.close().await
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: fmt::Debug> fmt::Debug for IdempotencyCache<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyCache").field("store", &self.store).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::telemetry::MemorySink;
    use async_trait::async_trait;
    use std::io;
    use std::time::Duration;

    fn cache(ttl: Duration) -> (IdempotencyCache<InMemoryIdempotencyStore>, ManualClock) {
        let clock = ManualClock::new();
        let store = InMemoryIdempotencyStore::with_clock(ttl, Arc::new(clock.clone()));
        let keys = FingerprintGenerator::new("test-secret").unwrap();
        (IdempotencyCache::new(store, keys), clock)
    }

    #[tokio::test]
    async fn stored_result_replays_until_deleted() {
        let sink = MemorySink::new();
        let (cache, _) = cache(Duration::from_secs(60));
        let cache = cache.with_telemetry(Telemetry::new(sink.clone()));
        let key = cache.generate_key_with_context(b"{\"lat\":1}", "crew-1");

        assert_eq!(cache.check_duplicate(&key).await.unwrap(), None);
        cache.store_result(&key, 202, "{\"success\":true}", "application/json").await.unwrap();

        let replay = cache.check_duplicate(&key).await.unwrap().unwrap();
        assert_eq!(replay.status_code, 202);
        assert_eq!(replay.content_type, "application/json");

        cache.delete(&key).await.unwrap();
        assert!(!cache.exists(&key).await.unwrap());
        assert_eq!(
            sink.events(),
            vec![
                AdmissionEvent::Idempotency(IdempotencyEvent::Recorded { status_code: 202 }),
                AdmissionEvent::Idempotency(IdempotencyEvent::Replayed { status_code: 202 }),
                AdmissionEvent::Idempotency(IdempotencyEvent::Forgotten),
            ]
        );
    }

    #[tokio::test]
    async fn ttl_scenario() {
        let (cache, clock) = cache(Duration::from_millis(100));
        cache.store_result("k", 200, "ok", "text/plain").await.unwrap();
        assert!(cache.exists("k").await.unwrap());
        clock.advance(Duration::from_millis(150));
        assert!(!cache.exists("k").await.unwrap());
        assert_eq!(cache.check_duplicate("k").await.unwrap(), None);
    }

    #[derive(Debug)]
    struct Unreachable;

    #[async_trait]
    impl IdempotencyStore for Unreachable {
        type Error = io::Error;

        async fn get(&self, _key: &str) -> Result<Option<StoredOutcome>, io::Error> {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "cache down"))
        }
        async fn set(&self, _key: &str, _outcome: StoredOutcome) -> Result<(), io::Error> {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "cache down"))
        }
        async fn exists(&self, _key: &str) -> Result<bool, io::Error> {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "cache down"))
        }
        async fn delete(&self, _key: &str) -> Result<(), io::Error> {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "cache down"))
        }
    }

    #[tokio::test]
    async fn backend_errors_surface_and_are_reported() {
        let sink = MemorySink::new();
        let cache = IdempotencyCache::new(Unreachable, FingerprintGenerator::new("s").unwrap())
            .with_telemetry(Telemetry::new(sink.clone()));

        assert!(cache.check_duplicate("k").await.is_err());
        assert!(cache.store_result("k", 200, "", "text/plain").await.is_err());
        assert_eq!(
            sink.events(),
            vec![AdmissionEvent::Idempotency(IdempotencyEvent::StoreFailed); 2]
        );
    }
}
