use crate::clock::{Clock, MonotonicClock};
use crate::sweep::{SweepSlot, SweepTask};
use crate::telemetry::{AdmissionEvent, IdempotencyEvent, Telemetry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// The response produced the first time a fingerprint was processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOutcome {
    pub status_code: u16,
    pub body: Vec<u8>,
    pub content_type: String,
    pub created_at: SystemTime,
}

impl StoredOutcome {
    pub fn new(status_code: u16, body: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        Self {
            status_code,
            body: body.into(),
            content_type: content_type.into(),
            created_at: SystemTime::now(),
        }
    }

    /// Body as UTF-8, if it is.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// Backend holding idempotency records.
///
/// Every operation can fail so a networked backend can be substituted. The
/// store owns the TTL: a record set now is reported absent once the TTL has
/// passed, whether or not it has been evicted yet.
#[async_trait]
pub trait IdempotencyStore: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// The live record for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<StoredOutcome>, Self::Error>;

    /// Record `outcome` under `key`, replacing any previous record.
    async fn set(&self, key: &str, outcome: StoredOutcome) -> Result<(), Self::Error>;

    /// Whether a live record exists for `key`.
    async fn exists(&self, key: &str) -> Result<bool, Self::Error>;

    /// Remove the record for `key`. Absent keys are not an error.
    async fn delete(&self, key: &str) -> Result<(), Self::Error>;

    /// Release backend resources.
    async fn close(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}

struct Record {
    outcome: StoredOutcome,
    expires_at: u64,
}

struct RecordState {
    records: RwLock<HashMap<String, Record>>,
    ttl: Duration,
    ttl_millis: u64,
    clock: Arc<dyn Clock>,
}

impl RecordState {
    fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|_, record| now <= record.expires_at);
        before - records.len()
    }
}

/// Process-local [`IdempotencyStore`].
///
/// Reads take a shared lock and treat expired records as absent without
/// removing them; [`sweep`](Self::sweep) (or the task spawned by
/// [`start`](Self::start)) reclaims the memory. Contents are lost on restart.
#[derive(Clone)]
pub struct InMemoryIdempotencyStore {
    state: Arc<RecordState>,
    sweeper: Arc<SweepSlot>,
    telemetry: Telemetry,
}

impl InMemoryIdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(RecordState {
                records: RwLock::new(HashMap::new()),
                ttl,
                ttl_millis: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
                clock,
            }),
            sweeper: Arc::new(SweepSlot::default()),
            telemetry: Telemetry::null(),
        }
    }

    /// Report sweeps to `telemetry`.
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Spawn the expiry sweep. Must be called from within a Tokio runtime.
    pub fn start(self, sweep_interval: Duration) -> Self {
        let state = self.state.clone();
        let telemetry = self.telemetry.clone();
        self.sweeper.install_with(|| {
            SweepTask::spawn("idempotency", sweep_interval, move || {
                let state = state.clone();
                let telemetry = telemetry.clone();
                async move {
                    let evicted = state.sweep();
                    if evicted > 0 {
                        debug!(target: "fieldgate::idempotency", evicted, "swept expired records");
                        telemetry
                            .emit(AdmissionEvent::Idempotency(IdempotencyEvent::Swept { evicted }))
                            .await;
                    }
                }
            })
        });
        self
    }

    /// Evict expired records. Returns how many went.
    pub fn sweep(&self) -> usize {
        self.state.sweep()
    }

    /// Records held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.state.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ttl(&self) -> Duration {
        self.state.ttl
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper.is_running()
    }

    fn live(&self, key: &str) -> Option<StoredOutcome> {
        let now = self.state.clock.now_millis();
        let records = self.state.records.read().unwrap_or_else(PoisonError::into_inner);
        records
            .get(key)
            .filter(|record| now <= record.expires_at)
            .map(|record| record.outcome.clone())
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    type Error = Infallible;

    async fn get(&self, key: &str) -> Result<Option<StoredOutcome>, Infallible> {
        Ok(self.live(key))
    }

    async fn set(&self, key: &str, outcome: StoredOutcome) -> Result<(), Infallible> {
        let expires_at = self.state.clock.now_millis().saturating_add(self.state.ttl_millis);
        self.state
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), Record { outcome, expires_at });
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, Infallible> {
        let now = self.state.clock.now_millis();
        let records = self.state.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(key).is_some_and(|record| now <= record.expires_at))
    }

    async fn delete(&self, key: &str) -> Result<(), Infallible> {
        self.state.records.write().unwrap_or_else(PoisonError::into_inner).remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<(), Infallible> {
        self.sweeper.close().await;
        Ok(())
    }
}

impl fmt::Debug for InMemoryIdempotencyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryIdempotencyStore")
            .field("ttl", &self.state.ttl)
            .field("len", &self.len())
            .field("sweeping", &self.is_sweeping())
            .finish()
    }
}
