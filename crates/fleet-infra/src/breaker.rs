//! Count-based circuit breaker for external dependencies.
//!
//! Standard three-state machine: `closed` counts consecutive failures and
//! trips at a threshold; `open` fails fast until the cooldown elapses;
//! `half_open` admits a bounded number of probes and either closes (probe
//! success) or re-opens (probe failure).
//!
//! The breaker uses a plain std mutex and never suspends while holding it.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Numeric code for the state gauge: 0 closed, 1 open, 2 half-open.
    pub fn code(self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_probes: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    cooldown: Duration,
    half_open_max_probes: u32,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, cooldown: Duration) -> Self {
        CircuitBreaker {
            name,
            failure_threshold,
            cooldown,
            half_open_max_probes: 1,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_probes: 0,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether a call may proceed. Transitions open → half-open when the
    /// cooldown has elapsed.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map_or(Duration::ZERO, |at| at.elapsed());
                if elapsed >= self.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_probes = 1;
                    tracing::info!(breaker = self.name, "cooldown elapsed, half-open probe");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_probes < self.half_open_max_probes {
                    inner.half_open_probes += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        if inner.state != BreakerState::Closed {
            tracing::info!(breaker = self.name, "closing after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.half_open_probes = 0;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        breaker = self.name,
                        failures = inner.consecutive_failures,
                        "breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_probes = 0;
                tracing::warn!(breaker = self.name, "probe failed, breaker re-opened");
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker mutex poisoned").state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_threshold() {
        let breaker = CircuitBreaker::new("db", 3, Duration::from_secs(30));
        assert!(breaker.allow());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new("db", 3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_after_cooldown_then_closes_on_success() {
        let breaker = CircuitBreaker::new("db", 1, Duration::ZERO);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        // Zero cooldown: the next allow() is the half-open probe.
        assert!(breaker.allow());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // Only one probe admitted while half-open.
        assert!(!breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new("broker", 1, Duration::ZERO);
        breaker.record_failure();
        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
