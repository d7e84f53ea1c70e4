//! Bounded worker pool that drains accepted submissions into persistence.
//!
//! A fixed number of workers share one bounded queue. [`WorkerPool::submit`]
//! never waits for capacity: a full queue or a pool that is shutting down
//! drops the item and reports why. [`WorkerPool::shutdown`] stops accepting,
//! lets workers drain what is already queued, and gives up waiting after a
//! timeout without interrupting persistence calls already in progress.
//!
//! ```rust
//! use fieldgate::{persist_fn, PoolConfig, Submitted, WorkerPool};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let persistence = persist_fn(|line: String| async move {
//!     println!("stored {line}");
//!     Ok::<(), std::io::Error>(())
//! });
//! let pool = WorkerPool::new(PoolConfig::new(2, 8)?, persistence);
//! pool.start()?;
//! assert_eq!(pool.submit("crew-1 at checkpoint 4".to_string()).await, Submitted::Enqueued);
//! pool.shutdown(Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::PoolConfig;
use crate::error::{PersistError, PoolError};
use crate::telemetry::{AdmissionEvent, PoolEvent, Telemetry};
use crate::timeout::TimeoutPolicy;
use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Durable storage the pool hands each accepted item to.
///
/// Called concurrently from every worker. Failures are logged by the pool and
/// never retried.
#[async_trait]
pub trait Persistence<T: Send + 'static>: Send + Sync + 'static {
    /// Error reported by the backend.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Persist one item.
    async fn store(&self, item: T) -> Result<(), Self::Error>;

    /// Report whether the backend is reachable.
    async fn health_check(&self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Release backend resources. Called once after the pool has drained.
    async fn close(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[async_trait]
impl<T, P> Persistence<T> for Arc<P>
where
    T: Send + 'static,
    P: Persistence<T>,
{
    type Error = P::Error;

    async fn store(&self, item: T) -> Result<(), Self::Error> {
        (**self).store(item).await
    }

    async fn health_check(&self) -> Result<(), Self::Error> {
        (**self).health_check().await
    }

    async fn close(&self) -> Result<(), Self::Error> {
        (**self).close().await
    }
}

/// [`Persistence`] backed by an async closure. See [`persist_fn`].
#[derive(Clone)]
pub struct PersistFn<F> {
    f: F,
}

/// Build a [`Persistence`] from an async closure.
pub fn persist_fn<F>(f: F) -> PersistFn<F> {
    PersistFn { f }
}

impl<F> fmt::Debug for PersistFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistFn").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T, F, Fut, E> Persistence<T> for PersistFn<F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    type Error = E;

    async fn store(&self, item: T) -> Result<(), E> {
        (self.f)(item).await
    }
}

/// An accepted payload waiting for a worker.
#[derive(Debug)]
pub struct QueuedItem<T> {
    /// The submitted payload.
    pub payload: T,
    /// When the pool accepted it.
    pub enqueued_at: Instant,
}

impl<T> QueuedItem<T> {
    fn new(payload: T) -> Self {
        Self { payload, enqueued_at: Instant::now() }
    }
}

/// Why [`WorkerPool::submit`] dropped an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Every queue slot was taken.
    QueueFull,
    /// The pool had stopped accepting work.
    ShuttingDown,
}

impl DropReason {
    /// Stable snake_case name for logs and JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::QueueFull => "queue_full",
            DropReason::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a submitted item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// The item is queued and a worker will persist it.
    Enqueued,
    /// The item was discarded at the pool boundary.
    Dropped(DropReason),
}

impl Submitted {
    pub fn is_enqueued(&self) -> bool {
        matches!(self, Submitted::Enqueued)
    }

    pub fn drop_reason(&self) -> Option<DropReason> {
        match self {
            Submitted::Enqueued => None,
            Submitted::Dropped(reason) => Some(*reason),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    persisted: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Fixed-size pool of workers draining a bounded queue into [`Persistence`].
pub struct WorkerPool<T, P>
where
    T: Send + 'static,
    P: Persistence<T>,
{
    config: PoolConfig,
    persistence: Arc<P>,
    sender: Mutex<Option<mpsc::Sender<QueuedItem<T>>>>,
    receiver: Arc<AsyncMutex<mpsc::Receiver<QueuedItem<T>>>>,
    stop: watch::Sender<bool>,
    state: AtomicU8,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
    telemetry: Telemetry,
}

impl<T, P> WorkerPool<T, P>
where
    T: Send + 'static,
    P: Persistence<T>,
{
    /// Create a pool. Workers are not spawned until [`start`](Self::start).
    pub fn new(config: PoolConfig, persistence: P) -> Self {
        let (sender, receiver) = mpsc::channel(config.buffer_size());
        let (stop, _) = watch::channel(false);
        Self {
            config,
            persistence: Arc::new(persistence),
            sender: Mutex::new(Some(sender)),
            receiver: Arc::new(AsyncMutex::new(receiver)),
            stop,
            state: AtomicU8::new(STATE_IDLE),
            workers: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
            telemetry: Telemetry::null(),
        }
    }

    /// Report pool events to `telemetry`. Call before [`start`](Self::start).
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Spawn `num_workers` workers on the current Tokio runtime.
    pub fn start(&self) -> Result<(), PoolError> {
        match self.state.compare_exchange(
            STATE_IDLE,
            STATE_RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(STATE_RUNNING) => return Err(PoolError::AlreadyStarted),
            Err(_) => return Err(PoolError::ShutDown),
        }

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for id in 0..self.config.num_workers() {
            let worker = Worker {
                id,
                receiver: self.receiver.clone(),
                persistence: self.persistence.clone(),
                item_timeout: self.config.item_timeout_policy(),
                counters: self.counters.clone(),
                telemetry: self.telemetry.clone(),
                stop: self.stop.subscribe(),
            };
            workers.push(tokio::spawn(worker.run()));
        }
        info!(
            target: "fieldgate::pool",
            workers = self.config.num_workers(),
            buffer = self.config.buffer_size(),
            "worker pool started"
        );
        Ok(())
    }

    /// Offer `payload` to the queue without waiting for capacity.
    ///
    /// Items offered before [`start`](Self::start) wait in the queue for the
    /// workers. Only telemetry delivery is awaited.
    pub async fn submit(&self, payload: T) -> Submitted {
        let outcome = {
            let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            match sender.as_ref() {
                None => Submitted::Dropped(DropReason::ShuttingDown),
                Some(sender) => {
                    self.counters.queued.fetch_add(1, Ordering::AcqRel);
                    match sender.try_send(QueuedItem::new(payload)) {
                        Ok(()) => Submitted::Enqueued,
                        Err(err) => {
                            self.counters.queued.fetch_sub(1, Ordering::AcqRel);
                            match err {
                                TrySendError::Full(_) => Submitted::Dropped(DropReason::QueueFull),
                                TrySendError::Closed(_) => {
                                    Submitted::Dropped(DropReason::ShuttingDown)
                                }
                            }
                        }
                    }
                }
            }
        };

        if let Submitted::Dropped(reason) = outcome {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "fieldgate::pool",
                reason = %reason,
                queued = self.queued(),
                capacity = self.config.buffer_size(),
                "submission dropped"
            );
            self.telemetry.emit(AdmissionEvent::Pool(PoolEvent::Dropped { reason })).await;
        }
        outcome
    }

    /// Stop accepting work, drain the queue, and wait up to `timeout` for
    /// workers to exit.
    ///
    /// On timeout the workers are told to stop after their current item and
    /// [`PoolError::ShutdownTimedOut`] is returned; persistence calls in
    /// progress are not interrupted. Calling again after the first call
    /// returns `Ok(())`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), PoolError> {
        if self.state.swap(STATE_STOPPED, Ordering::AcqRel) == STATE_STOPPED {
            return Ok(());
        }

        // Dropping the only sender closes the queue once it is drained.
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        drop(sender);

        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        info!(
            target: "fieldgate::pool",
            queued = self.queued(),
            in_flight = self.in_flight(),
            ?timeout,
            "worker pool draining"
        );
        if handles.is_empty() && self.queued() > 0 {
            warn!(
                target: "fieldgate::pool",
                queued = self.queued(),
                "worker pool shut down before start; queued items discarded"
            );
        }

        match tokio::time::timeout(timeout, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(err) = result {
                        if err.is_panic() {
                            warn!(target: "fieldgate::pool", "worker task panicked");
                        }
                    }
                }
                if let Err(err) = self.persistence.close().await {
                    warn!(target: "fieldgate::pool", error = %err, "persistence close failed");
                }
                info!(
                    target: "fieldgate::pool",
                    persisted = self.persisted(),
                    failed = self.failed(),
                    dropped = self.dropped(),
                    "worker pool stopped"
                );
                Ok(())
            }
            Err(_) => {
                let _ = self.stop.send(true);
                let in_flight = self.in_flight();
                warn!(
                    target: "fieldgate::pool",
                    ?timeout,
                    in_flight,
                    queued = self.queued(),
                    "worker pool shutdown timed out"
                );
                Err(PoolError::ShutdownTimedOut { timeout, in_flight })
            }
        }
    }

    /// Ask the backend whether it is reachable.
    pub async fn health_check(&self) -> Result<(), P::Error> {
        self.persistence.health_check().await
    }

    /// Items accepted but not yet claimed by a worker.
    pub fn queued(&self) -> usize {
        self.counters.queued.load(Ordering::Acquire)
    }

    /// Items a worker is persisting right now.
    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::Acquire)
    }

    /// Items persisted successfully so far.
    pub fn persisted(&self) -> u64 {
        self.counters.persisted.load(Ordering::Relaxed)
    }

    /// Items whose persistence failed, timed out, or panicked.
    pub fn failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    /// Items dropped by [`submit`](Self::submit).
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn persistence(&self) -> &P {
        &self.persistence
    }
}

impl<T, P> fmt::Debug for WorkerPool<T, P>
where
    T: Send + 'static,
    P: Persistence<T>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("queued", &self.queued())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

struct Worker<T, P> {
    id: usize,
    receiver: Arc<AsyncMutex<mpsc::Receiver<QueuedItem<T>>>>,
    persistence: Arc<P>,
    item_timeout: TimeoutPolicy,
    counters: Arc<Counters>,
    telemetry: Telemetry,
    stop: watch::Receiver<bool>,
}

impl<T, P> Worker<T, P>
where
    T: Send + 'static,
    P: Persistence<T>,
{
    async fn run(mut self) {
        debug!(target: "fieldgate::pool", worker = self.id, "worker started");
        loop {
            let item = {
                let mut receiver = self.receiver.lock().await;
                tokio::select! {
                    biased;
                    Ok(()) = self.stop.changed() => None,
                    item = receiver.recv() => item,
                }
            };
            let Some(item) = item else { break };
            self.counters.queued.fetch_sub(1, Ordering::AcqRel);
            self.persist(item).await;
        }
        debug!(target: "fieldgate::pool", worker = self.id, "worker exited");
    }

    async fn persist(&self, item: QueuedItem<T>) {
        self.counters.in_flight.fetch_add(1, Ordering::AcqRel);
        let waited = item.enqueued_at.elapsed();
        let started = Instant::now();

        let call = AssertUnwindSafe(self.persistence.store(item.payload)).catch_unwind();
        let result = match self.item_timeout.execute(call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(PersistError::Inner(err)),
            Err(PersistError::Inner(panic)) => Err(PersistError::Panicked(panic_message(&*panic))),
            Err(PersistError::Timeout { elapsed, timeout }) => {
                Err(PersistError::Timeout { elapsed, timeout })
            }
            Err(PersistError::Panicked(message)) => Err(PersistError::Panicked(message)),
        };
        let duration = started.elapsed();
        self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);

        let event = match result {
            Ok(()) => {
                self.counters.persisted.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "fieldgate::pool",
                    worker = self.id,
                    ?waited,
                    ?duration,
                    "item persisted"
                );
                PoolEvent::Persisted { duration }
            }
            Err(PersistError::Timeout { timeout, .. }) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "fieldgate::pool",
                    worker = self.id,
                    ?timeout,
                    "persist timed out; item abandoned"
                );
                PoolEvent::PersistTimedOut { timeout }
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "fieldgate::pool",
                    worker = self.id,
                    error = %err,
                    ?duration,
                    "persist failed"
                );
                PoolEvent::PersistFailed { duration }
            }
        };
        self.telemetry.emit(AdmissionEvent::Pool(event)).await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
