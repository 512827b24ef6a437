//! Circuit breaker around an index backend.
//!
//! Trips after consecutive transient failures and short-circuits calls until
//! the cooldown passes; then a single trial call decides whether to close
//! again. A trial that never reports back (its caller was cancelled) lapses
//! after another cooldown so the breaker cannot wedge half-open.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::clock::{to_chrono, SharedClock};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Backend considered down, calls short-circuited
    Open,
    /// Cooldown passed, one trial call allowed
    HalfOpen,
}

pub struct CircuitBreaker {
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    failure_threshold: u32,
    opened_at: RwLock<Option<DateTime<Utc>>>,
    /// When the outstanding half-open trial call was admitted
    trial_started_at: Mutex<Option<DateTime<Utc>>>,
    cooldown: Duration,
    clock: SharedClock,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejected: AtomicU64,
}

impl CircuitBreaker {
    /// A threshold of zero disables the breaker.
    pub fn new(failure_threshold: u32, cooldown: Duration, clock: SharedClock) -> Self {
        Self {
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            failure_threshold,
            opened_at: RwLock::new(None),
            trial_started_at: Mutex::new(None),
            cooldown,
            clock,
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        }
    }

    /// Whether a call may go through. While half-open only the caller that
    /// takes the trial permit is admitted.
    pub fn can_execute(&self) -> bool {
        let allowed = match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => self.take_trial_permit(),
            CircuitState::Open => {
                if self.remaining_cooldown().is_zero() {
                    {
                        let mut state = self.state.write();
                        if *state == CircuitState::Open {
                            *state = CircuitState::HalfOpen;
                            tracing::info!("Index circuit breaker half-open, allowing trial call");
                        }
                    }
                    self.take_trial_permit()
                } else {
                    false
                }
            }
        };

        if !allowed {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    fn take_trial_permit(&self) -> bool {
        let now = self.clock.now();
        let mut trial = self.trial_started_at.lock();
        match *trial {
            Some(started) if now - started < to_chrono(self.cooldown) => false,
            _ => {
                *trial = Some(now);
                true
            }
        }
    }

    /// How long until an open breaker admits a trial call. Zero unless open.
    pub fn remaining_cooldown(&self) -> Duration {
        if self.state() != CircuitState::Open {
            return Duration::ZERO;
        }
        match *self.opened_at.read() {
            Some(opened_at) => (opened_at + to_chrono(self.cooldown) - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO),
            None => Duration::ZERO,
        }
    }

    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        self.failure_count.store(0, Ordering::Relaxed);

        if *self.state.read() != CircuitState::Closed {
            *self.state.write() = CircuitState::Closed;
            *self.opened_at.write() = None;
            *self.trial_started_at.lock() = None;
            tracing::info!("Index circuit breaker closed");
        }
    }

    /// Record a transient failure. Rejections of bad input are not failures of
    /// the backend and should not be recorded here.
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        if self.failure_threshold == 0 {
            return;
        }

        let state = *self.state.read();
        match state {
            CircuitState::HalfOpen => self.trip("trial call failed"),
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.failure_threshold {
                    self.trip("consecutive failures");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self, reason: &str) {
        *self.state.write() = CircuitState::Open;
        *self.opened_at.write() = Some(self.clock.now());
        *self.trial_started_at.lock() = None;
        tracing::warn!(
            reason,
            failures = self.failure_count.load(Ordering::Relaxed),
            cooldown = ?self.cooldown,
            "Index circuit breaker opened"
        );
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            state: self.state(),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            failure_threshold: self.failure_threshold,
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
}
