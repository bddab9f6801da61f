//! Capped exponential backoff between attempts.

use std::time::Duration;

use crate::config::RetryPolicy;

/// Delay schedule for one call. The first retry waits `initial_delay_ms`,
/// each later one `backoff_multiplier` times longer, capped at
/// `max_delay_ms` unless that is 0.
#[derive(Debug, Clone)]
pub struct Backoff {
    next_ms: f64,
    multiplier: f64,
    max_ms: Option<f64>,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        let max_ms = (policy.max_delay_ms > 0).then_some(policy.max_delay_ms as f64);
        let first = policy.initial_delay_ms as f64;
        Self {
            next_ms: max_ms.map_or(first, |max| first.min(max)),
            multiplier: policy.backoff_multiplier,
            max_ms,
        }
    }

    /// Delay before the next retry.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next_ms;
        let grown = delay * self.multiplier;
        self.next_ms = match self.max_ms {
            Some(max) => grown.min(max),
            None => grown.min(u64::MAX as f64),
        };
        Duration::from_millis(delay as u64)
    }
}
