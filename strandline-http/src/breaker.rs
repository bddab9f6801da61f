//! Per-target circuit breakers.
//!
//! Thresholds come from the [`RetryPolicy`] of each call; the registry only
//! keeps counters. Resetting clears counters and never touches sockets.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::metrics;
use crate::target::Target;

/// Observable breaker state for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_successes: u32,
    /// A half-open probe has been admitted and not yet reported.
    probe_in_flight: bool,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_successes: 0,
            probe_in_flight: false,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.half_open_successes = 0;
        self.probe_in_flight = false;
        metrics::BREAKER_OPENED.increment();
    }
}

/// Breaker state for every target a client has talked to.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<Target, Breaker>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an attempt against `target` may proceed.
    pub fn allow(&self, target: &Target, policy: &RetryPolicy) -> bool {
        self.allow_at(target, policy, Instant::now())
    }

    pub fn record_success(&self, target: &Target, policy: &RetryPolicy) {
        if !policy.breaker_enabled() {
            return;
        }
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(breaker) = breakers.get_mut(target) else {
            return;
        };
        let closed = match breaker.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => {
                breaker.probe_in_flight = false;
                breaker.half_open_successes += 1;
                let done = breaker.half_open_successes >= policy.circuit_breaker_half_open_successes;
                if done {
                    debug!(%target, "circuit closed");
                }
                done
            }
            // Admitted before the breaker opened.
            BreakerState::Open => false,
        };
        // A closed breaker with no failures is the same as no entry.
        if closed {
            breakers.remove(target);
        }
    }

    pub fn record_failure(&self, target: &Target, policy: &RetryPolicy) {
        self.record_failure_at(target, policy, Instant::now());
    }

    /// Forget all breaker state.
    pub fn reset(&self) {
        self.breakers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Current state for `target`. Targets never seen are closed.
    pub fn state(&self, target: &Target) -> BreakerState {
        self.breakers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(target)
            .map_or(BreakerState::Closed, |b| b.state)
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.breakers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub(crate) fn allow_at(&self, target: &Target, policy: &RetryPolicy, now: Instant) -> bool {
        if !policy.breaker_enabled() {
            return true;
        }
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(breaker) = breakers.get_mut(target) else {
            return true;
        };
        let allowed = match breaker.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = breaker
                    .opened_at
                    .is_none_or(|at| now.saturating_duration_since(at) >= policy.cooldown());
                if elapsed {
                    debug!(%target, "circuit half-open");
                    breaker.state = BreakerState::HalfOpen;
                    breaker.half_open_successes = 0;
                    breaker.probe_in_flight = true;
                }
                elapsed
            }
            BreakerState::HalfOpen => !std::mem::replace(&mut breaker.probe_in_flight, true),
        };
        if !allowed {
            metrics::BREAKER_REJECTED.increment();
        }
        allowed
    }

    pub(crate) fn record_failure_at(&self, target: &Target, policy: &RetryPolicy, now: Instant) {
        if !policy.breaker_enabled() {
            return;
        }
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let breaker = breakers.entry(target.clone()).or_insert_with(Breaker::new);
        match breaker.state {
            BreakerState::Closed => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= policy.circuit_breaker_threshold {
                    warn!(
                        %target,
                        failures = breaker.consecutive_failures,
                        "circuit opened"
                    );
                    breaker.open(now);
                }
            }
            BreakerState::HalfOpen => {
                warn!(%target, "half-open probe failed, circuit reopened");
                breaker.open(now);
            }
            BreakerState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn policy(threshold: u32, successes: u32) -> RetryPolicy {
        RetryPolicy {
            circuit_breaker_threshold: threshold,
            circuit_breaker_cooldown_ms: 1_000,
            circuit_breaker_half_open_successes: successes,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn disabled_always_allows() {
        let registry = BreakerRegistry::new();
        let target = Target::plain("a", 80);
        let policy = policy(0, 1);
        for _ in 0..10 {
            registry.record_failure(&target, &policy);
        }
        assert!(registry.allow(&target, &policy));
        assert_eq!(registry.state(&target), BreakerState::Closed);
    }

    #[test]
    fn opens_at_threshold_and_rejects_during_cooldown() {
        let registry = BreakerRegistry::new();
        let target = Target::plain("a", 80);
        let policy = policy(2, 1);
        let t0 = Instant::now();

        registry.record_failure_at(&target, &policy, t0);
        assert!(registry.allow_at(&target, &policy, t0));
        registry.record_failure_at(&target, &policy, t0);
        assert_eq!(registry.state(&target), BreakerState::Open);
        assert!(!registry.allow_at(&target, &policy, t0 + Duration::from_millis(999)));
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let registry = BreakerRegistry::new();
        let target = Target::plain("a", 80);
        let policy = policy(2, 1);
        registry.record_failure(&target, &policy);
        registry.record_success(&target, &policy);
        registry.record_failure(&target, &policy);
        assert_eq!(registry.state(&target), BreakerState::Closed);
    }

    #[test]
    fn success_forgets_closed_target() {
        let registry = BreakerRegistry::new();
        let policy = policy(3, 1);
        for port in 0..100 {
            let target = Target::plain("a", port);
            registry.record_failure(&target, &policy);
            registry.record_success(&target, &policy);
        }
        assert_eq!(registry.tracked(), 0);
    }

    #[test]
    fn closing_from_half_open_forgets_target() {
        let registry = BreakerRegistry::new();
        let target = Target::plain("a", 80);
        let policy = policy(1, 1);
        let t0 = Instant::now();
        registry.record_failure_at(&target, &policy, t0);
        assert_eq!(registry.tracked(), 1);

        assert!(registry.allow_at(&target, &policy, t0 + Duration::from_secs(1)));
        registry.record_success(&target, &policy);
        assert_eq!(registry.state(&target), BreakerState::Closed);
        assert_eq!(registry.tracked(), 0);
    }

    #[test]
    fn half_open_admits_one_probe_then_closes() {
        let registry = BreakerRegistry::new();
        let target = Target::plain("a", 80);
        let policy = policy(1, 1);
        let t0 = Instant::now();
        registry.record_failure_at(&target, &policy, t0);

        let later = t0 + Duration::from_millis(1_000);
        assert!(registry.allow_at(&target, &policy, later));
        assert_eq!(registry.state(&target), BreakerState::HalfOpen);
        assert!(!registry.allow_at(&target, &policy, later));

        registry.record_success(&target, &policy);
        assert_eq!(registry.state(&target), BreakerState::Closed);
        assert!(registry.allow_at(&target, &policy, later));
    }

    #[test]
    fn half_open_needs_configured_successes() {
        let registry = BreakerRegistry::new();
        let target = Target::plain("a", 80);
        let policy = policy(1, 2);
        let t0 = Instant::now();
        registry.record_failure_at(&target, &policy, t0);

        let later = t0 + Duration::from_secs(2);
        assert!(registry.allow_at(&target, &policy, later));
        registry.record_success(&target, &policy);
        assert_eq!(registry.state(&target), BreakerState::HalfOpen);
        assert!(registry.allow_at(&target, &policy, later));
        registry.record_success(&target, &policy);
        assert_eq!(registry.state(&target), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let registry = BreakerRegistry::new();
        let target = Target::plain("a", 80);
        let policy = policy(1, 1);
        let t0 = Instant::now();
        registry.record_failure_at(&target, &policy, t0);

        let t1 = t0 + Duration::from_secs(1);
        assert!(registry.allow_at(&target, &policy, t1));
        registry.record_failure_at(&target, &policy, t1);
        assert_eq!(registry.state(&target), BreakerState::Open);
        assert!(!registry.allow_at(&target, &policy, t1 + Duration::from_millis(500)));
        assert!(registry.allow_at(&target, &policy, t1 + Duration::from_secs(1)));
    }

    #[test]
    fn targets_are_isolated() {
        let registry = BreakerRegistry::new();
        let policy = policy(1, 1);
        let plain = Target::plain("a", 443);
        let secure = Target::secure("a", 443);
        registry.record_failure(&plain, &policy);
        assert!(!registry.allow(&plain, &policy));
        assert!(registry.allow(&secure, &policy));
    }

    #[test]
    fn reset_clears_state() {
        let registry = BreakerRegistry::new();
        let target = Target::plain("a", 80);
        let policy = policy(1, 1);
        registry.record_failure(&target, &policy);
        assert!(!registry.allow(&target, &policy));
        registry.reset();
        assert!(registry.allow(&target, &policy));
    }
}
