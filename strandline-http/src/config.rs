use std::time::Duration;

use strandline_h2::Settings;

use crate::error::HttpError;

/// Configuration for an [`HttpClient`](crate::HttpClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// TCP connect deadline in milliseconds. 0 means no deadline.
    pub connect_timeout_ms: u64,
    /// Per-read and per-write deadline in milliseconds. 0 means no deadline.
    pub io_timeout_ms: u64,
    /// Largest accepted HTTP/1.1 response header section, in bytes.
    pub max_header_bytes: usize,
    /// Sent as `User-Agent` unless the request sets one. Empty disables it.
    pub user_agent: String,
    /// Idle connection pool.
    pub pool: PoolConfig,
    /// SETTINGS announced on HTTP/2 connections.
    pub h2: Settings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            io_timeout_ms: 30_000,
            max_header_bytes: 64 * 1024,
            user_agent: concat!("strandline/", env!("CARGO_PKG_VERSION")).to_string(),
            pool: PoolConfig::default(),
            h2: Settings::client_default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), HttpError> {
        if self.max_header_bytes < 64 {
            return Err(HttpError::Config("max_header_bytes must be >= 64".into()));
        }
        if self.user_agent.contains(['\r', '\n']) {
            return Err(HttpError::Config(
                "user_agent must not contain line breaks".into(),
            ));
        }
        if self.h2.enable_push {
            return Err(HttpError::Config("h2.enable_push is not supported".into()));
        }
        self.h2
            .validate()
            .map_err(|e| HttpError::Config(format!("h2 settings: {e}")))?;
        self.pool.validate()
    }

    pub(crate) fn connect_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.connect_timeout_ms)
    }

    pub(crate) fn io_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.io_timeout_ms)
    }
}

/// Idle connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// When false, every HTTP/1.1 connection is closed after one request.
    pub enabled: bool,
    /// Idle connections kept per target. Oldest are closed first.
    pub max_idle_per_target: usize,
    /// Idle connections older than this are closed instead of reused.
    /// 0 means they never expire.
    pub idle_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_idle_per_target: 8,
            idle_timeout_ms: 90_000,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), HttpError> {
        if self.enabled && self.max_idle_per_target == 0 {
            return Err(HttpError::Config(
                "pool.max_idle_per_target must be > 0 when pooling is enabled".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn idle_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.idle_timeout_ms)
    }
}

/// Retry and circuit breaker settings for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. At least 1.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay_ms: u64,
    /// Upper bound for any delay. 0 means unbounded.
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays. At least 1.
    pub backoff_multiplier: f64,
    /// Consecutive failures that open the breaker. 0 disables it.
    pub circuit_breaker_threshold: u32,
    /// How long an open breaker rejects attempts.
    pub circuit_breaker_cooldown_ms: u64,
    /// Successful probes needed to close a half-open breaker. At least 1.
    pub circuit_breaker_half_open_successes: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            circuit_breaker_threshold: 0,
            circuit_breaker_cooldown_ms: 30_000,
            circuit_breaker_half_open_successes: 1,
        }
    }
}

impl RetryPolicy {
    /// A policy allowing `max_attempts` attempts with default backoff.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), HttpError> {
        if self.max_attempts == 0 {
            return Err(HttpError::Config("max_attempts must be >= 1".into()));
        }
        if !(self.backoff_multiplier >= 1.0 && self.backoff_multiplier.is_finite()) {
            return Err(HttpError::Config(
                "backoff_multiplier must be a finite value >= 1".into(),
            ));
        }
        if self.circuit_breaker_half_open_successes == 0 {
            return Err(HttpError::Config(
                "circuit_breaker_half_open_successes must be >= 1".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn breaker_enabled(&self) -> bool {
        self.circuit_breaker_threshold > 0
    }

    pub(crate) fn cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_cooldown_ms)
    }
}

fn non_zero_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
