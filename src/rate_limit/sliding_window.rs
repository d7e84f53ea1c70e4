use crate::adaptive::DynamicConfig;
use crate::clock::{Clock, MonotonicClock};
use crate::config::LimiterConfig;
use crate::error::ConfigError;
use crate::rate_limit::{Decision, RateLimiter};
use crate::sweep::{SweepSlot, SweepTask};
use crate::telemetry::{AdmissionEvent, RateLimitEvent, Telemetry};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// Sliding-window log limiter.
///
/// Each key keeps the timestamps of its admitted requests. A timestamp counts
/// while `now - timestamp < window`; one exactly `window` old has left. A
/// denied request is not recorded, so hammering a full window does not extend
/// it.
///
/// Clones share state. Call [`start`](Self::start) to run the background
/// sweep that forgets idle keys, and [`close`](Self::close) to stop it.
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    state: Arc<WindowState>,
    sweeper: Arc<SweepSlot>,
    telemetry: Telemetry,
}

struct WindowState {
    windows: RwLock<HashMap<String, VecDeque<u64>>>,
    limit: DynamicConfig<usize>,
    window: Duration,
    window_millis: u64,
    clock: Arc<dyn Clock>,
}

impl WindowState {
    fn prune(&self, stamps: &mut VecDeque<u64>, now: u64) {
        while let Some(&oldest) = stamps.front() {
            if now.saturating_sub(oldest) < self.window_millis {
                break;
            }
            stamps.pop_front();
        }
    }

    fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let mut windows = self.windows.write().unwrap_or_else(PoisonError::into_inner);
        let before = windows.len();
        windows.retain(|_, stamps| {
            self.prune(stamps, now);
            !stamps.is_empty()
        });
        before - windows.len()
    }
}

impl SlidingWindowLimiter {
    /// Limiter on the runtime's monotonic clock.
    pub fn new(config: LimiterConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    /// Limiter on an explicit clock.
    pub fn with_clock(config: LimiterConfig, clock: Arc<dyn Clock>) -> Self {
        let window = config.window();
        Self {
            state: Arc::new(WindowState {
                windows: RwLock::new(HashMap::new()),
                limit: DynamicConfig::new(config.limit()),
                window,
                window_millis: u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1),
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

    /// Spawn the idle-key sweep, running every two windows.
    ///
    /// Must be called from within a Tokio runtime. Starting twice is a no-op.
    pub fn start(self) -> Self {
        let state = self.state.clone();
        let telemetry = self.telemetry.clone();
        let interval = self.state.window.saturating_mul(2);
        self.sweeper.install_with(|| {
            SweepTask::spawn("rate_limit", interval, move || {
                let state = state.clone();
                let telemetry = telemetry.clone();
                async move {
                    let evicted = state.sweep();
                    if evicted > 0 {
                        debug!(target: "fieldgate::rate_limit", evicted, "swept idle keys");
                        telemetry.emit(AdmissionEvent::RateLimit(RateLimitEvent::Swept { evicted })).await;
                    }
                }
            })
        });
        self
    }

    /// Forget keys with no request inside the window. Returns how many went.
    pub fn sweep(&self) -> usize {
        self.state.sweep()
    }

    /// Stop the background sweep, if running, and wait for it.
    pub async fn close(&self) {
        self.sweeper.close().await;
    }

    /// Whether the background sweep is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper.is_running()
    }

    /// Current per-window limit.
    pub fn limit(&self) -> usize {
        self.state.limit.load()
    }

    /// Change the limit for every key, effective on the next call.
    pub fn set_limit(&self, limit: usize) -> Result<(), ConfigError> {
        if limit == 0 {
            return Err(ConfigError::InvalidLimit { provided: limit });
        }
        self.state.limit.set(limit);
        Ok(())
    }

    /// Live handle to the limit, for operators wiring up a control surface.
    pub fn limit_handle(&self) -> DynamicConfig<usize> {
        self.state.limit.clone()
    }

    pub fn window(&self) -> Duration {
        self.state.window
    }

    /// Number of keys currently holding a window.
    pub fn tracked_keys(&self) -> usize {
        self.state.windows.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    fn check(&self, key: &str) -> Decision {
        let state = &*self.state;
        let limit = state.limit.load();
        let mut windows = state.windows.write().unwrap_or_else(PoisonError::into_inner);
        // Read the clock under the lock so timestamps stay ordered per key.
        let now = state.clock.now_millis();
        if !windows.contains_key(key) {
            windows.insert(key.to_owned(), VecDeque::new());
        }
        let Some(stamps) = windows.get_mut(key) else {
            return Decision::Denied { retry_after: state.window };
        };
        state.prune(stamps, now);

        if stamps.len() < limit {
            stamps.push_back(now);
            return Decision::Allowed { remaining: limit - stamps.len() };
        }

        let retry_after = stamps
            .front()
            .map(|&oldest| {
                Duration::from_millis(oldest.saturating_add(state.window_millis).saturating_sub(now))
            })
            .unwrap_or(state.window);
        debug!(
            target: "fieldgate::rate_limit",
            key,
            limit,
            ?retry_after,
            "request over limit"
        );
        Decision::Denied { retry_after }
    }

    fn remaining(&self, key: &str) -> usize {
        let state = &*self.state;
        let limit = state.limit.load();
        let windows = state.windows.read().unwrap_or_else(PoisonError::into_inner);
        let now = state.clock.now_millis();
        let live = windows.get(key).map_or(0, |stamps| {
            stamps.iter().filter(|&&ts| now.saturating_sub(ts) < state.window_millis).count()
        });
        limit.saturating_sub(live)
    }

    async fn close(&self) {
        self.sweeper.close().await;
    }
}

impl fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("limit", &self.limit())
            .field("window", &self.state.window)
            .field("tracked_keys", &self.tracked_keys())
            .field("sweeping", &self.is_sweeping())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(limit: usize, window: Duration) -> (SlidingWindowLimiter, ManualClock) {
        let clock = ManualClock::new();
        let config = LimiterConfig::new(limit, window).unwrap();
        (SlidingWindowLimiter::with_clock(config, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn remaining_counts_down_and_unknown_keys_are_full() {
        let (limiter, _) = limiter(5, Duration::from_secs(1));
        assert_eq!(limiter.remaining("nobody"), 5);
        for expected in (2..5).rev() {
            assert_eq!(limiter.check("crew-1"), Decision::Allowed { remaining: expected });
        }
        assert_eq!(limiter.remaining("crew-1"), 2);
        assert_eq!(limiter.remaining("crew-2"), 5);
    }

    #[test]
    fn boundary_timestamp_has_left_the_window() {
        let (limiter, clock) = limiter(1, Duration::from_millis(1_000));
        assert!(limiter.allow("crew-1"));
        clock.advance(Duration::from_millis(999));
        assert!(!limiter.allow("crew-1"));
        clock.advance(Duration::from_millis(1));
        assert!(limiter.allow("crew-1"));
    }

    #[test]
    fn denial_reports_time_until_oldest_expires_and_records_nothing() {
        let (limiter, clock) = limiter(2, Duration::from_secs(1));
        assert!(limiter.allow("crew-1"));
        clock.advance(Duration::from_millis(400));
        assert!(limiter.allow("crew-1"));
        clock.advance(Duration::from_millis(100));

        for _ in 0..10 {
            assert_eq!(
                limiter.check("crew-1"),
                Decision::Denied { retry_after: Duration::from_millis(500) }
            );
        }
        clock.advance(Duration::from_millis(500));
        assert_eq!(limiter.check("crew-1"), Decision::Allowed { remaining: 0 });
    }

    #[test]
    fn sweep_forgets_idle_keys_only() {
        let (limiter, clock) = limiter(3, Duration::from_secs(1));
        limiter.check("idle");
        clock.advance(Duration::from_millis(800));
        limiter.check("busy");
        clock.advance(Duration::from_millis(300));

        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(limiter.remaining("busy"), 2);
    }

    #[test]
    fn limit_can_be_tuned_live() {
        let (limiter, _) = limiter(1, Duration::from_secs(60));
        assert!(limiter.allow("crew-1"));
        assert!(!limiter.allow("crew-1"));

        limiter.set_limit(3).unwrap();
        assert_eq!(limiter.remaining("crew-1"), 2);
        assert!(limiter.allow("crew-1"));

        limiter.limit_handle().set(1);
        assert!(!limiter.allow("crew-1"));
        assert_eq!(limiter.set_limit(0), Err(ConfigError::InvalidLimit { provided: 0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_runs_every_two_windows() {
        let config = LimiterConfig::new(2, Duration::from_secs(1)).unwrap();
        let limiter = SlidingWindowLimiter::new(config).start();
        assert!(limiter.is_sweeping());
        limiter.check("crew-1");

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(limiter.tracked_keys(), 0);

        limiter.close().await;
        assert!(!limiter.is_sweeping());
    }
}
