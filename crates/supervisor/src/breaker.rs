//! Failure-windowed circuit breaker.
//!
//! Gate for backend restarts: `closed` allows them, `open` rejects them, and
//! `half_open` admits a single probe after the recovery time.  Time is passed
//! in by the caller so the state machine stays deterministic under test.

use std::collections::VecDeque;
use std::time::Instant;

use bc_domain::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    /// Failure timestamps inside the rolling window.
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            half_open_successes: 0,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether a restart attempt is admitted right now.  An open breaker
    /// whose recovery time has elapsed moves to half-open and admits one
    /// probe.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                if now.duration_since(opened_at).as_millis() as u64 >= self.config.recovery_time_ms {
                    self.state = BreakerState::HalfOpen;
                    self.half_open_successes = 0;
                    tracing::info!("circuit breaker half-open, admitting probe");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        match self.state {
            BreakerState::HalfOpen => {
                // First failure while probing re-opens immediately.
                self.trip(now);
            }
            BreakerState::Closed => {
                self.failures.push_back(now);
                self.prune(now);
                if self.failures.len() as u32 >= self.config.failure_threshold {
                    self.trip(now);
                }
            }
            BreakerState::Open => {
                self.failures.push_back(now);
                self.prune(now);
            }
        }
    }

    pub fn record_success(&mut self, _now: Instant) {
        if self.state == BreakerState::HalfOpen {
            self.half_open_successes += 1;
            if self.half_open_successes >= self.config.success_threshold {
                tracing::info!("circuit breaker closed after successful probes");
                self.state = BreakerState::Closed;
                self.failures.clear();
                self.opened_at = None;
                self.half_open_successes = 0;
            }
        }
    }

    fn trip(&mut self, now: Instant) {
        tracing::warn!(
            failures = self.failures.len(),
            window_ms = self.config.window_ms,
            "circuit breaker opened"
        );
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.half_open_successes = 0;
    }

    fn prune(&mut self, now: Instant) {
        let window = std::time::Duration::from_millis(self.config.window_ms);
        while let Some(first) = self.failures.front() {
            if now.duration_since(*first) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn make_breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            window_ms: 60_000,
            recovery_time_ms: 30_000,
            success_threshold: 2,
        })
    }

    #[test]
    fn starts_closed_and_allows() {
        let mut breaker = make_breaker();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow(Instant::now()));
    }

    #[test]
    fn opens_at_threshold_within_window() {
        let mut breaker = make_breaker();
        let now = Instant::now();
        breaker.record_failure(now);
        breaker.record_failure(now + Duration::from_secs(1));
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure(now + Duration::from_secs(2));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow(now + Duration::from_secs(3)));
    }

    #[test]
    fn failures_outside_window_do_not_trip() {
        let mut breaker = make_breaker();
        let now = Instant::now();
        breaker.record_failure(now);
        breaker.record_failure(now + Duration::from_secs(30));
        // First failure has aged out by the time the third lands.
        breaker.record_failure(now + Duration::from_secs(90));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_after_recovery_time() {
        let mut breaker = make_breaker();
        let now = Instant::now();
        for i in 0..3 {
            breaker.record_failure(now + Duration::from_secs(i));
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        assert!(!breaker.allow(now + Duration::from_secs(10)));
        assert!(breaker.allow(now + Duration::from_secs(40)));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_failure_reopens() {
        let mut breaker = make_breaker();
        let now = Instant::now();
        for i in 0..3 {
            breaker.record_failure(now + Duration::from_secs(i));
        }
        assert!(breaker.allow(now + Duration::from_secs(40)));
        breaker.record_failure(now + Duration::from_secs(41));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow(now + Duration::from_secs(42)));
    }

    #[test]
    fn closes_after_success_threshold() {
        let mut breaker = make_breaker();
        let now = Instant::now();
        for i in 0..3 {
            breaker.record_failure(now + Duration::from_secs(i));
        }
        assert!(breaker.allow(now + Duration::from_secs(40)));
        breaker.record_success(now + Duration::from_secs(41));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success(now + Duration::from_secs(42));
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow(now + Duration::from_secs(43)));
    }

    #[test]
    fn success_in_closed_state_is_inert() {
        let mut breaker = make_breaker();
        let now = Instant::now();
        breaker.record_success(now);
        breaker.record_failure(now);
        breaker.record_failure(now);
        breaker.record_failure(now);
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
