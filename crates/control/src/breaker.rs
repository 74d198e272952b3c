//! Process-wide circuit breaker.
//!
//! `Closed` counts consecutive failures and opens at the threshold. `Open`
//! refuses work until `reset_timeout` has passed since it opened, then reads
//! as `HalfOpen`. That move is evaluated lazily whenever the state is read;
//! there is no background timer. A success in `HalfOpen` closes the circuit,
//! a failure re-opens it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use warden_core::{BreakerConfig, Clock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Snapshot of the breaker for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<DateTime<Utc>>,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: chrono::Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_timeout: chrono::Duration::from_std(reset_timeout).unwrap_or(chrono::Duration::MAX),
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
            }),
        }
    }

    pub fn from_config(config: &BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            config.failure_threshold,
            Duration::from_millis(config.reset_timeout_ms),
            clock,
        )
    }

    /// Lock and apply the lazy `Open -> HalfOpen` move.
    fn settle(&self) -> MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state == CircuitState::Open {
            let elapsed_enough = inner
                .opened_at
                .map_or(true, |at| self.clock.now() - at >= self.reset_timeout);
            if elapsed_enough {
                inner.state = CircuitState::HalfOpen;
                info!("circuit half-open, allowing probe");
            }
        }
        inner
    }

    pub fn state(&self) -> CircuitState {
        self.settle().state
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.settle();
        CircuitBreakerState {
            state: inner.state,
            failure_count: inner.failure_count,
            opened_at: inner.opened_at,
        }
    }

    pub fn can_execute(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn record_failure(&self) {
        let mut inner = self.settle();
        inner.failure_count = inner.failure_count.saturating_add(1);
        match inner.state {
            CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(self.clock.now());
                warn!(failures = inner.failure_count, "circuit opened");
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(self.clock.now());
                warn!(failures = inner.failure_count, "probe failed, circuit re-opened");
            }
            // Failures while open keep counting but do not push the deadline.
            _ => {}
        }
    }

    /// A success closes a half-open circuit and clears the failure streak
    /// while closed. It does not cut short an open circuit's timeout.
    pub fn record_success(&self) {
        let mut inner = self.settle();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.opened_at = None;
                info!("circuit closed");
            }
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    /// Force `Closed` with a clean slate.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::ManualClock;

    fn breaker(threshold: u32, reset_ms: u64) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_epoch());
        let b = CircuitBreaker::new(threshold, Duration::from_millis(reset_ms), clock.clone());
        (b, clock)
    }

    #[test]
    fn single_failure_threshold_round_trip() {
        let (b, clock) = breaker(1, 1_000);
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.can_execute());

        clock.advance_ms(1_000);
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.can_execute());

        b.record_success();
        let snap = b.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
        assert!(snap.opened_at.is_none());
    }

    #[test]
    fn stays_open_until_timeout() {
        let (b, clock) = breaker(1, 1_000);
        b.record_failure();
        clock.advance_ms(999);
        assert_eq!(b.state(), CircuitState::Open);
        b.record_success();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn opens_after_consecutive_failures_only() {
        let (b, _) = breaker(3, 1_000);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().failure_count, 2);
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_failure_rearms_timer() {
        let (b, clock) = breaker(1, 1_000);
        b.record_failure();
        clock.advance_ms(1_000);
        assert_eq!(b.state(), CircuitState::HalfOpen);

        b.record_failure();
        let snap = b.snapshot();
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.opened_at, Some(clock.now()));

        clock.advance_ms(500);
        assert_eq!(b.state(), CircuitState::Open);
        clock.advance_ms(500);
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn reset_forces_closed() {
        let (b, _) = breaker(1, 60_000);
        b.record_failure();
        b.reset();
        assert_eq!(b.snapshot().state, CircuitState::Closed);
        assert_eq!(b.snapshot().failure_count, 0);
        assert!(b.can_execute());
    }

    #[test]
    fn out_of_range_timeout_keeps_circuit_open() {
        let clock = Arc::new(ManualClock::at_epoch());
        let b = CircuitBreaker::new(1, Duration::MAX, clock.clone());
        b.record_failure();
        clock.advance(Duration::from_secs(365 * 24 * 3_600));
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn state_serializes_as_screaming_snake_case() {
        let json = serde_json::to_string(&CircuitState::HalfOpen).unwrap();
        assert_eq!(json, "\"HALF_OPEN\"");
    }
}
