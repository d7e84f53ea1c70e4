//! Validated configuration for the limiter, the idempotency cache, and the
//! worker pool.
//!
//! Every struct validates in its constructor, so a value that exists is
//! usable. Structs deserialize through the same validation, and
//! [`AdmissionConfig::from_env`] reads the deployment's environment variables.

use crate::error::ConfigError;
use crate::timeout::TimeoutPolicy;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Secret used when none is configured. Logged loudly when in use.
pub const DEFAULT_SECRET: &str = "idempotency-secret-change-in-production";

/// Per-key sliding-window limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "LimiterSettings")]
pub struct LimiterConfig {
    limit: usize,
    window: Duration,
}

#[derive(Deserialize)]
struct LimiterSettings {
    limit: usize,
    window_ms: u64,
}

impl TryFrom<LimiterSettings> for LimiterConfig {
    type Error = ConfigError;

    fn try_from(raw: LimiterSettings) -> Result<Self, Self::Error> {
        Self::new(raw.limit, Duration::from_millis(raw.window_ms))
    }
}

impl LimiterConfig {
    /// `limit` requests per `window`, both non-zero.
    pub fn new(limit: usize, window: Duration) -> Result<Self, ConfigError> {
        if limit == 0 {
            return Err(ConfigError::InvalidLimit { provided: limit });
        }
        if window.is_zero() {
            return Err(ConfigError::InvalidWindow(window));
        }
        Ok(Self { limit, window })
    }

    pub fn per_minute(limit: usize) -> Result<Self, ConfigError> {
        Self::new(limit, Duration::from_secs(60))
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for LimiterConfig {
    /// 100 requests per minute.
    fn default() -> Self {
        Self { limit: 100, window: Duration::from_secs(60) }
    }
}

/// What a fingerprint covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintScope {
    /// The body alone. Identical bodies from different submitters collide.
    Body,
    /// Submitter identity joined to the body.
    #[default]
    Submitter,
}

impl FromStr for FingerprintScope {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "body" => Ok(Self::Body),
            "submitter" => Ok(Self::Submitter),
            _ => Err(ConfigError::UnknownVariant { key: "fingerprint scope", value: s.to_owned() }),
        }
    }
}

/// Idempotency record lifetime, sweep cadence, and fingerprint key.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "IdempotencySettings")]
pub struct IdempotencyConfig {
    ttl: Duration,
    sweep_interval: Duration,
    secret: String,
    scope: FingerprintScope,
}

#[derive(Deserialize)]
struct IdempotencySettings {
    secret: String,
    #[serde(default = "default_ttl_ms")]
    ttl_ms: u64,
    #[serde(default = "default_sweep_ms")]
    sweep_interval_ms: u64,
    #[serde(default)]
    scope: FingerprintScope,
}

fn default_ttl_ms() -> u64 {
    5 * 60 * 1_000
}

fn default_sweep_ms() -> u64 {
    60 * 1_000
}

impl TryFrom<IdempotencySettings> for IdempotencyConfig {
    type Error = ConfigError;

    fn try_from(raw: IdempotencySettings) -> Result<Self, Self::Error> {
        Ok(Self::new(raw.secret)?
            .with_ttl(Duration::from_millis(raw.ttl_ms))?
            .with_sweep_interval(Duration::from_millis(raw.sweep_interval_ms))?
            .with_scope(raw.scope))
    }
}

impl IdempotencyConfig {
    /// Defaults (TTL 5m, sweep every minute, per-submitter scope) with the
    /// given non-empty secret.
    pub fn new(secret: impl Into<String>) -> Result<Self, ConfigError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(ConfigError::EmptySecret);
        }
        Ok(Self {
            ttl: Duration::from_millis(default_ttl_ms()),
            sweep_interval: Duration::from_millis(default_sweep_ms()),
            secret,
            scope: FingerprintScope::default(),
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Result<Self, ConfigError> {
        if ttl.is_zero() {
            return Err(ConfigError::InvalidTtl(ttl));
        }
        self.ttl = ttl;
        Ok(self)
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::InvalidSweepInterval(interval));
        }
        self.sweep_interval = interval;
        Ok(self)
    }

    pub fn with_scope(mut self, scope: FingerprintScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub fn scope(&self) -> FingerprintScope {
        self.scope
    }

    pub(crate) fn secret(&self) -> &str {
        &self.secret
    }

    /// Whether the built-in placeholder secret is in use.
    pub fn uses_default_secret(&self) -> bool {
        self.secret == DEFAULT_SECRET
    }
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(default_ttl_ms()),
            sweep_interval: Duration::from_millis(default_sweep_ms()),
            secret: DEFAULT_SECRET.to_owned(),
            scope: FingerprintScope::default(),
        }
    }
}

impl fmt::Debug for IdempotencyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyConfig")
            .field("ttl", &self.ttl)
            .field("sweep_interval", &self.sweep_interval)
            .field("secret", &"<redacted>")
            .field("scope", &self.scope)
            .finish()
    }
}

/// Worker count, queue capacity, and timeouts for the pool.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(try_from = "PoolSettings")]
pub struct PoolConfig {
    num_workers: usize,
    buffer_size: usize,
    item_timeout: TimeoutPolicy,
    shutdown_timeout: Duration,
}

#[derive(Deserialize)]
struct PoolSettings {
    num_workers: usize,
    buffer_size: usize,
    #[serde(default = "default_item_timeout_ms")]
    item_timeout_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    shutdown_timeout_ms: u64,
}

fn default_item_timeout_ms() -> u64 {
    10_000
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

impl TryFrom<PoolSettings> for PoolConfig {
    type Error = ConfigError;

    fn try_from(raw: PoolSettings) -> Result<Self, Self::Error> {
        Self::new(raw.num_workers, raw.buffer_size)?
            .with_item_timeout(Duration::from_millis(raw.item_timeout_ms))?
            .with_shutdown_timeout(Duration::from_millis(raw.shutdown_timeout_ms))
    }
}

impl PoolConfig {
    /// `num_workers` workers over a queue of `buffer_size`, default timeouts.
    pub fn new(num_workers: usize, buffer_size: usize) -> Result<Self, ConfigError> {
        if num_workers == 0 {
            return Err(ConfigError::InvalidWorkerCount { provided: num_workers });
        }
        if buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize { provided: buffer_size });
        }
        Ok(Self {
            num_workers,
            buffer_size,
            item_timeout: TimeoutPolicy::from_valid(Duration::from_millis(default_item_timeout_ms())),
            shutdown_timeout: Duration::from_millis(default_shutdown_timeout_ms()),
        })
    }

    /// Bound on a single persistence call.
    pub fn with_item_timeout(mut self, timeout: Duration) -> Result<Self, ConfigError> {
        self.item_timeout = TimeoutPolicy::new(timeout)?;
        Ok(self)
    }

    /// How long shutdown waits for workers to drain.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Result<Self, ConfigError> {
        if timeout.is_zero() || timeout == Duration::MAX {
            return Err(ConfigError::InvalidTimeout { name: "shutdown_timeout", value: timeout });
        }
        self.shutdown_timeout = timeout;
        Ok(self)
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn item_timeout(&self) -> Duration {
        self.item_timeout.duration()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub(crate) fn item_timeout_policy(&self) -> TimeoutPolicy {
        self.item_timeout
    }
}

impl Default for PoolConfig {
    /// 10 workers, 100 queue slots, 10s per item, 30s to drain.
    fn default() -> Self {
        Self {
            num_workers: 10,
            buffer_size: 100,
            item_timeout: TimeoutPolicy::from_valid(Duration::from_millis(default_item_timeout_ms())),
            shutdown_timeout: Duration::from_millis(default_shutdown_timeout_ms()),
        }
    }
}

/// What the coordinator tells a caller whose accepted submission the pool
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Answer as accepted; the drop is only logged.
    #[default]
    Acknowledge,
    /// Answer 503 and record nothing, so a retry is processed afresh.
    Reject,
}

impl FromStr for DropPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "acknowledge" => Ok(Self::Acknowledge),
            "reject" => Ok(Self::Reject),
            _ => Err(ConfigError::UnknownVariant { key: "drop policy", value: s.to_owned() }),
        }
    }
}

/// Everything the admission coordinator needs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub limiter: LimiterConfig,
    pub idempotency: IdempotencyConfig,
    pub pool: PoolConfig,
    pub drop_policy: DropPolicy,
    /// Invalidate a fingerprint when persisting its submission fails, so the
    /// client's retry is processed instead of replayed.
    pub forget_failed_submissions: bool,
}

impl AdmissionConfig {
    /// Read the process environment. See [`from_lookup`](Self::from_lookup).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from a key lookup.
    ///
    /// Numeric settings that are absent or unparsable fall back to their
    /// defaults; enum settings that do not match a variant are rejected.
    ///
    /// | key | default |
    /// |---|---|
    /// | `RATE_LIMIT_PER_MIN` | 100 |
    /// | `RATE_LIMIT_WINDOW_SECS` | 60 |
    /// | `IDEMPOTENCY_SECRET` | placeholder, logged |
    /// | `IDEMPOTENCY_TTL_SECS` | 300 |
    /// | `IDEMPOTENCY_SWEEP_INTERVAL_SECS` | 60 |
    /// | `IDEMPOTENCY_SCOPE` | `submitter` |
    /// | `WORKER_NUM_WORKERS` | 10 |
    /// | `WORKER_BUFFER_SIZE` | 100 |
    /// | `WORKER_ITEM_TIMEOUT_SECS` | 10 |
    /// | `WORKER_SHUTDOWN_TIMEOUT_SECS` | 30 |
    /// | `WORKER_DROP_POLICY` | `acknowledge` |
    /// | `FORGET_FAILED_SUBMISSIONS` | `false` |
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let limiter = LimiterConfig::new(
            setting(&lookup, "RATE_LIMIT_PER_MIN", 100),
            Duration::from_secs(setting(&lookup, "RATE_LIMIT_WINDOW_SECS", 60)),
        )?;

        let secret = lookup("IDEMPOTENCY_SECRET")
            .filter(|secret| !secret.is_empty())
            .unwrap_or_else(|| DEFAULT_SECRET.to_owned());
        let scope = match lookup("IDEMPOTENCY_SCOPE") {
            Some(raw) => raw.parse()?,
            None => FingerprintScope::default(),
        };
        let idempotency = IdempotencyConfig::new(secret)?
            .with_ttl(Duration::from_secs(setting(&lookup, "IDEMPOTENCY_TTL_SECS", 300)))?
            .with_sweep_interval(Duration::from_secs(setting(
                &lookup,
                "IDEMPOTENCY_SWEEP_INTERVAL_SECS",
                60,
            )))?
            .with_scope(scope);

        let pool = PoolConfig::new(
            setting(&lookup, "WORKER_NUM_WORKERS", 10),
            setting(&lookup, "WORKER_BUFFER_SIZE", 100),
        )?
        .with_item_timeout(Duration::from_secs(setting(&lookup, "WORKER_ITEM_TIMEOUT_SECS", 10)))?
        .with_shutdown_timeout(Duration::from_secs(setting(
            &lookup,
            "WORKER_SHUTDOWN_TIMEOUT_SECS",
            30,
        )))?;

        let drop_policy = match lookup("WORKER_DROP_POLICY") {
            Some(raw) => raw.parse()?,
            None => DropPolicy::default(),
        };
        let forget_failed_submissions = setting(&lookup, "FORGET_FAILED_SUBMISSIONS", false);

        Ok(Self { limiter, idempotency, pool, drop_policy, forget_failed_submissions })
    }
}

fn setting<T, F>(lookup: &F, key: &'static str, default: T) -> T
where
    T: FromStr + Copy + fmt::Debug,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(target: "fieldgate::config", key, value = %raw, ?default, "unparsable setting; using default");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn constructors_reject_degenerate_values() {
        assert_eq!(
            LimiterConfig::new(0, Duration::from_secs(1)),
            Err(ConfigError::InvalidLimit { provided: 0 })
        );
        assert_eq!(
            LimiterConfig::new(1, Duration::ZERO),
            Err(ConfigError::InvalidWindow(Duration::ZERO))
        );
        assert_eq!(IdempotencyConfig::new("").unwrap_err(), ConfigError::EmptySecret);
        assert_eq!(
            IdempotencyConfig::new("s").unwrap().with_ttl(Duration::ZERO).unwrap_err(),
            ConfigError::InvalidTtl(Duration::ZERO)
        );
        assert!(matches!(
            PoolConfig::new(0, 1),
            Err(ConfigError::InvalidWorkerCount { provided: 0 })
        ));
        assert!(matches!(
            PoolConfig::new(1, 0),
            Err(ConfigError::InvalidBufferSize { provided: 0 })
        ));
        assert!(matches!(
            PoolConfig::new(1, 1).unwrap().with_shutdown_timeout(Duration::ZERO),
            Err(ConfigError::InvalidTimeout { name: "shutdown_timeout", .. })
        ));
    }

    #[test]
    fn defaults_match_deployment() {
        let config = AdmissionConfig::default();
        assert_eq!(config.limiter.limit(), 100);
        assert_eq!(config.limiter.window(), Duration::from_secs(60));
        assert_eq!(config.idempotency.ttl(), Duration::from_secs(300));
        assert_eq!(config.idempotency.sweep_interval(), Duration::from_secs(60));
        assert!(config.idempotency.uses_default_secret());
        assert_eq!(config.pool.num_workers(), 10);
        assert_eq!(config.pool.buffer_size(), 100);
        assert_eq!(config.pool.item_timeout(), Duration::from_secs(10));
        assert_eq!(config.pool.shutdown_timeout(), Duration::from_secs(30));
        assert_eq!(config.drop_policy, DropPolicy::Acknowledge);
        assert!(!config.forget_failed_submissions);
    }

    #[test]
    fn lookup_overrides_and_falls_back() {
        let config = AdmissionConfig::from_lookup(lookup(&[
            ("RATE_LIMIT_PER_MIN", "3"),
            ("RATE_LIMIT_WINDOW_SECS", "not-a-number"),
            ("IDEMPOTENCY_SECRET", "prod-secret"),
            ("IDEMPOTENCY_SCOPE", "Body"),
            ("WORKER_NUM_WORKERS", "2"),
            ("WORKER_DROP_POLICY", "reject"),
            ("FORGET_FAILED_SUBMISSIONS", "true"),
        ]))
        .unwrap();

        assert_eq!(config.limiter.limit(), 3);
        assert_eq!(config.limiter.window(), Duration::from_secs(60));
        assert!(!config.idempotency.uses_default_secret());
        assert_eq!(config.idempotency.scope(), FingerprintScope::Body);
        assert_eq!(config.pool.num_workers(), 2);
        assert_eq!(config.pool.buffer_size(), 100);
        assert_eq!(config.drop_policy, DropPolicy::Reject);
        assert!(config.forget_failed_submissions);
    }

    #[test]
    fn lookup_validates_after_parsing() {
        assert_eq!(
            AdmissionConfig::from_lookup(lookup(&[("RATE_LIMIT_PER_MIN", "0")])).unwrap_err(),
            ConfigError::InvalidLimit { provided: 0 }
        );
        assert_eq!(
            AdmissionConfig::from_lookup(lookup(&[("WORKER_DROP_POLICY", "block")])).unwrap_err(),
            ConfigError::UnknownVariant { key: "drop policy", value: "block".into() }
        );
    }

    #[test]
    fn deserializes_through_validation() {
        let config: AdmissionConfig = serde_json::from_value(serde_json::json!({
            "limiter": { "limit": 3, "window_ms": 1000 },
            "idempotency": { "secret": "s3cret", "ttl_ms": 100 },
            "pool": { "num_workers": 2, "buffer_size": 1 },
            "drop_policy": "reject"
        }))
        .unwrap();
        assert_eq!(config.limiter, LimiterConfig::new(3, Duration::from_secs(1)).unwrap());
        assert_eq!(config.idempotency.ttl(), Duration::from_millis(100));
        assert_eq!(config.idempotency.sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.pool.shutdown_timeout(), Duration::from_secs(30));
        assert_eq!(config.drop_policy, DropPolicy::Reject);

        let err = serde_json::from_value::<LimiterConfig>(serde_json::json!({
            "limit": 0, "window_ms": 1000
        }))
        .unwrap_err();
        assert!(err.to_string().contains("limit must be > 0"));
    }

    #[test]
    fn debug_redacts_secret() {
        let config = IdempotencyConfig::new("hunter2").unwrap();
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
