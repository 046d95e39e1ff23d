//! Per-service circuit breaker gating recovery attempts.
//!
//! The breaker is a plain state machine: callers pass the current instant so
//! the transitions stay deterministic under test.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Attempts allowed.
    Closed,
    /// Attempts denied until the recovery timeout elapses.
    Open,
    /// A limited number of trial attempts allowed.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker for one service.
#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    state: BreakerState,
    failure_count: u32,
    failure_threshold: u32,
    recovery_timeout: Duration,
    last_failure_time: Option<Instant>,
    last_success_time: Option<Instant>,
    half_open_calls: u32,
    half_open_successes: u32,
    half_open_max_calls: u32,
}

/// Serializable view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub half_open_calls: u32,
    pub half_open_max_calls: u32,
    /// Seconds until an Open breaker admits a trial attempt.
    pub retry_after_secs: Option<u64>,
}

impl CircuitBreakerState {
    /// New Closed breaker. Zero thresholds are raised to one.
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, half_open_max_calls: u32) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            last_failure_time: None,
            last_success_time: None,
            half_open_calls: 0,
            half_open_successes: 0,
            half_open_max_calls: half_open_max_calls.max(1),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_failure_time(&self) -> Option<Instant> {
        self.last_failure_time
    }

    pub fn last_success_time(&self) -> Option<Instant> {
        self.last_success_time
    }

    /// Ask for permission to run one recovery attempt.
    ///
    /// An Open breaker whose timeout has elapsed moves to HalfOpen here;
    /// HalfOpen admits at most `half_open_max_calls` attempts.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if self.state == BreakerState::Open {
            let elapsed = self
                .last_failure_time
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or(self.recovery_timeout);
            if elapsed < self.recovery_timeout {
                return false;
            }
            info!("Circuit breaker half-open after {:?}", elapsed);
            self.state = BreakerState::HalfOpen;
            self.half_open_calls = 0;
            self.half_open_successes = 0;
        }

        match self.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen if self.half_open_calls < self.half_open_max_calls => {
                self.half_open_calls += 1;
                true
            }
            _ => false,
        }
    }

    /// Record a successful recovery.
    pub fn record_success(&mut self, now: Instant) {
        self.last_success_time = Some(now);
        match self.state {
            BreakerState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.half_open_max_calls {
                    info!("Circuit breaker closed");
                    self.close();
                }
            }
            BreakerState::Closed => self.failure_count = 0,
            BreakerState::Open => {}
        }
    }

    /// Record a failed recovery.
    pub fn record_failure(&mut self, now: Instant) {
        self.failure_count += 1;
        self.last_failure_time = Some(now);
        match self.state {
            BreakerState::Closed if self.failure_count >= self.failure_threshold => {
                warn!(
                    "Circuit breaker opened after {} failures",
                    self.failure_count
                );
                self.state = BreakerState::Open;
            }
            BreakerState::HalfOpen => {
                warn!("Circuit breaker re-opened by failed trial attempt");
                self.state = BreakerState::Open;
            }
            _ => {}
        }
    }

    /// Force the breaker back to Closed.
    pub fn reset(&mut self) {
        self.close();
        self.last_failure_time = None;
    }

    fn close(&mut self) {
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.half_open_calls = 0;
        self.half_open_successes = 0;
    }

    /// Snapshot for status reporting.
    pub fn snapshot(&self, now: Instant) -> CircuitBreakerSnapshot {
        let retry_after_secs = match (self.state, self.last_failure_time) {
            (BreakerState::Open, Some(t)) => Some(
                self.recovery_timeout
                    .saturating_sub(now.saturating_duration_since(t))
                    .as_secs(),
            ),
            _ => None,
        };
        CircuitBreakerSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            failure_threshold: self.failure_threshold,
            recovery_timeout_secs: self.recovery_timeout.as_secs(),
            half_open_calls: self.half_open_calls,
            half_open_max_calls: self.half_open_max_calls,
            retry_after_secs,
        }
    }
}
