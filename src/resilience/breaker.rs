//! Process-local circuit breaker, one per logical upstream.

use dashmap::DashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker with TTL-based recovery.
///
/// closed → open at `failure_threshold` consecutive failures;
/// open → half_open after `recovery_timeout`; half_open → closed on the
/// first success and straight back to open on any failure.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            failure_threshold,
            recovery_timeout,
        }
    }

    /// Current state after applying the recovery timeout. When the
    /// recovery window has elapsed an open breaker moves to half-open,
    /// letting exactly the next call probe the upstream.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    tracing::info!("circuit breaker half-open, probing upstream");
                }
            }
        }
        inner.state
    }

    /// True when calls must short-circuit without touching the network.
    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != BreakerState::Closed {
            tracing::info!("circuit breaker closed after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures += 1;

        let should_open = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.consecutive_failures >= self.failure_threshold,
            BreakerState::Open => false,
        };

        if should_open {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            tracing::warn!(
                failures = inner.consecutive_failures,
                "circuit breaker opened"
            );
        } else if inner.state == BreakerState::Open {
            // Keep the window anchored to the most recent failure.
            inner.opened_at = Some(Instant::now());
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().unwrap().consecutive_failures
    }
}

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// One breaker per upstream label, created on demand.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: DashMap<String, std::sync::Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, upstream: &str) -> std::sync::Arc<CircuitBreaker> {
        self.breakers
            .entry(upstream.to_string())
            .or_insert_with(|| {
                std::sync::Arc::new(CircuitBreaker::new(
                    DEFAULT_FAILURE_THRESHOLD,
                    DEFAULT_RECOVERY_TIMEOUT,
                ))
            })
            .clone()
    }

    /// Test isolation only. Production code never resets breakers.
    pub fn reset(&self) {
        self.breakers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_at_threshold() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(cb.is_open());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_recovery_to_half_open() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(0));
        cb.record_failure();
        // Zero recovery window: immediately eligible for a probe.
        assert_eq!(cb.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn test_half_open_success_closes() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(0));
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new(5, Duration::from_millis(0));
        for _ in 0..5 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_failure();
        // Probe failed: back to open regardless of threshold.
        let inner_state = {
            // state() would flip to half-open again under the 0ms window,
            // so assert through is_open before the window re-elapses.
            cb.inner.lock().unwrap().state
        };
        assert_eq!(inner_state, BreakerState::Open);
    }

    #[test]
    fn test_registry_returns_same_breaker() {
        let reg = BreakerRegistry::new();
        let a = reg.get("PNCP");
        a.record_failure();
        let b = reg.get("PNCP");
        assert_eq!(b.consecutive_failures(), 1);
        assert_eq!(reg.get("Portal").consecutive_failures(), 0);
    }
}
