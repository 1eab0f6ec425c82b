//! Per-target circuit breaker.
//!
//! A plain state machine: `closed -> open` after `failure_threshold`
//! consecutive failures, `open -> half_open` once `timeout` has passed since
//! the last failure, `half_open -> closed` after `half_open_max_calls`
//! successes and `half_open -> open` on any failure.
//!
//! The breaker does no locking of its own. The publisher keeps one per
//! target behind a mutex, so concurrent publish tasks on a multi-threaded
//! runtime never interleave a check with an update.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    #[default]
    Closed,
    /// Calls are rejected.
    Open,
    /// A limited number of trial calls are let through.
    HalfOpen,
}

impl CircuitState {
    /// Returns the state as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Numeric encoding exported as a gauge.
    #[must_use]
    pub const fn gauge_value(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failure-isolation state machine for one target.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    half_open_calls: u32,
    half_open_successes: u32,
}

impl CircuitBreaker {
    /// Creates a closed breaker for the named target.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            half_open_calls: 0,
            half_open_successes: 0,
        }
    }

    /// Name of the target this breaker protects.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, without advancing time-based transitions.
    #[must_use]
    pub const fn state(&self) -> CircuitState {
        self.state
    }

    /// Consecutive failures counted so far.
    #[must_use]
    pub const fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// When the most recent failure was recorded.
    #[must_use]
    pub const fn last_failure_time(&self) -> Option<Instant> {
        self.last_failure_time
    }

    /// Trial calls admitted in the current half-open period.
    #[must_use]
    pub const fn half_open_calls(&self) -> u32 {
        self.half_open_calls
    }

    /// Decides whether a call may proceed, admitting it if so.
    ///
    /// An open breaker whose timeout has elapsed moves to half-open here.
    pub fn can_execute(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = self
                    .last_failure_time
                    .is_none_or(|t| t.elapsed() >= self.config.timeout());
                if !elapsed {
                    return false;
                }
                self.transition_to(CircuitState::HalfOpen);
                self.admit_half_open()
            }
            CircuitState::HalfOpen => self.admit_half_open(),
        }
    }

    /// Records a successful call.
    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.half_open_max_calls {
                    self.transition_to(CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                // A call admitted before the circuit opened finished late.
                debug!(target_name = %self.name, "success recorded while open, ignoring");
            }
        }
    }

    /// Records a failed call.
    pub fn record_failure(&mut self) {
        self.last_failure_time = Some(Instant::now());
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.failure_count += 1;
                self.transition_to(CircuitState::Open);
            }
            CircuitState::Open => {
                self.failure_count += 1;
            }
        }
    }

    /// Returns a half-open trial slot taken by a call that ended without an
    /// outcome, such as one that was cancelled.
    pub fn release_half_open(&mut self) {
        if self.state == CircuitState::HalfOpen && self.half_open_calls > 0 {
            self.half_open_calls -= 1;
            debug!(target_name = %self.name, "half-open trial released without outcome");
        }
    }

    /// Forces the breaker back to closed with all counters cleared.
    pub fn reset(&mut self) {
        self.transition_to(CircuitState::Closed);
        self.last_failure_time = None;
    }

    fn admit_half_open(&mut self) -> bool {
        if self.half_open_calls < self.config.half_open_max_calls {
            self.half_open_calls += 1;
            true
        } else {
            false
        }
    }

    fn transition_to(&mut self, next: CircuitState) {
        let previous = self.state;
        self.state = next;
        self.half_open_calls = 0;
        self.half_open_successes = 0;
        if next == CircuitState::Closed {
            self.failure_count = 0;
        }
        if previous == next {
            return;
        }
        match next {
            CircuitState::Open => warn!(
                target_name = %self.name,
                failures = self.failure_count,
                from = %previous,
                "circuit breaker opened"
            ),
            CircuitState::HalfOpen => {
                info!(target_name = %self.name, "circuit breaker half-open, probing target");
            }
            CircuitState::Closed => {
                info!(target_name = %self.name, from = %previous, "circuit breaker closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(threshold: u32, timeout_secs: u64, half_open: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            timeout_secs,
            half_open_max_calls: half_open,
        }
    }

    fn open_breaker() -> CircuitBreaker {
        let mut breaker = CircuitBreaker::new("pagerduty", config(3, 60, 2));
        for _ in 0..3 {
            breaker.record_failure();
        }
        breaker
    }

    #[test]
    fn starts_closed_and_allows() {
        let mut breaker = CircuitBreaker::new("t", CircuitBreakerConfig::default());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute());
    }

    #[test]
    fn opens_after_threshold_failures() {
        let mut breaker = CircuitBreaker::new("t", config(3, 60, 2));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn success_resets_failure_count() {
        let mut breaker = CircuitBreaker::new("t", config(3, 60, 2));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stays_open_until_timeout() {
        let mut breaker = open_breaker();
        tokio::time::advance(Duration::from_secs(59)).await;

        assert!(!breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_timeout() {
        let mut breaker = open_breaker();
        tokio::time::advance(Duration::from_secs(60)).await;

        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.half_open_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_limits_trial_calls() {
        let mut breaker = open_breaker();
        tokio::time::advance(Duration::from_secs(60)).await;

        assert!(breaker.can_execute());
        assert!(breaker.can_execute());
        assert!(!breaker.can_execute());
    }

    #[tokio::test(start_paused = true)]
    async fn released_trial_can_be_retaken() {
        let mut breaker = open_breaker();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(breaker.can_execute());
        assert!(breaker.can_execute());

        breaker.release_half_open();

        assert_eq!(breaker.half_open_calls(), 1);
        assert!(breaker.can_execute());
        assert!(!breaker.can_execute());
    }

    #[test]
    fn release_outside_half_open_is_ignored() {
        let mut breaker = open_breaker();
        breaker.release_half_open();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.half_open_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_closes_after_enough_successes() {
        let mut breaker = open_breaker();
        tokio::time::advance(Duration::from_secs(60)).await;

        assert!(breaker.can_execute());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(breaker.can_execute());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_immediately() {
        let mut breaker = open_breaker();
        tokio::time::advance(Duration::from_secs(60)).await;

        assert!(breaker.can_execute());
        breaker.record_success();
        assert!(breaker.can_execute());
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
    }

    #[tokio::test(start_paused = true)]
    async fn reopened_breaker_waits_full_timeout_again() {
        let mut breaker = open_breaker();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(breaker.can_execute());
        breaker.record_failure();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!breaker.can_execute());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.can_execute());
    }

    #[test]
    fn reset_closes() {
        let mut breaker = open_breaker();
        breaker.reset();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.last_failure_time().is_none());
        assert!(breaker.can_execute());
    }

    #[test]
    fn gauge_values_order_by_badness() {
        assert!(CircuitState::Closed.gauge_value() < CircuitState::HalfOpen.gauge_value());
        assert!(CircuitState::HalfOpen.gauge_value() < CircuitState::Open.gauge_value());
    }
}
