//! Background sweep tasks owned by the stores they maintain.
//!
//! Sweeps only bound memory. Correctness never depends on one having run:
//! the limiter prunes on every call and the idempotency store checks expiry on
//! every read.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Handle to a periodic sweep running on the tokio runtime.
///
/// Dropping the handle stops the task at its next wake-up; [`SweepTask::close`]
/// stops it and waits for it to exit.
#[derive(Debug)]
pub struct SweepTask {
    name: &'static str,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SweepTask {
    /// Run `tick` every `interval`, starting one interval from now.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F, Fut>(name: &'static str, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    // Err means the handle was dropped; stop either way.
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => tick().await,
                }
            }
            debug!(target: "fieldgate::sweep", sweep = name, "sweep task stopped");
        });
        debug!(target: "fieldgate::sweep", sweep = name, ?interval, "sweep task started");
        Self { name, stop, handle }
    }

    /// Which store this sweep maintains.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop the sweep and wait for the task to exit.
    pub async fn close(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.handle.await {
            if err.is_panic() {
                warn!(target: "fieldgate::sweep", sweep = self.name, "sweep task panicked");
            }
        }
    }
}

/// Slot a store keeps its sweep in, so `close` can take it exactly once.
#[derive(Debug, Default)]
pub(crate) struct SweepSlot(Mutex<Option<SweepTask>>);

impl SweepSlot {
    /// Install a sweep unless one is already running. Returns whether it spawned.
    pub(crate) fn install_with(&self, spawn: impl FnOnce() -> SweepTask) -> bool {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(spawn());
        true
    }

    pub(crate) fn is_running(&self) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    pub(crate) async fn close(&self) {
        let task = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.close().await;
        }
    }
}
