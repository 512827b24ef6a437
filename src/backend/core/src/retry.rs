//! Retry and failure policy.
//!
//! Every dispatch outcome maps to exactly one [`Action`]:
//!
//! - success → `Acknowledge`
//! - transient backend error → `Retry(backoff)` until the attempt budget is
//!   spent, then `DeadLetter(RetriesExhausted)`
//! - malformed or rejected input → `DeadLetter(Validation)` immediately
//! - short-circuited by an open breaker → `Defer(cooldown)`, no attempt spent
//! - fenced by a newer version in the backend → `Escalate`
//!
//! Engine errors go through [`RetryPolicy::classify_error`]. Systemic ones
//! (lost lease, storage errors) map to `Escalate`, aborting the cycle.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::dispatch::OperationOutcome;
use crate::error::RelayError;
use crate::outbox::DeadLetterReason;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// How the delay grows between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    /// `initial + increment * attempt`
    Linear {
        #[serde(with = "humantime_serde")]
        initial: Duration,
        #[serde(with = "humantime_serde")]
        increment: Duration,
    },
    /// `initial * multiplier^attempt`
    Exponential {
        #[serde(with = "humantime_serde")]
        initial: Duration,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Uncapped delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Linear { initial, increment } => {
                initial.saturating_add(increment.saturating_mul(attempt))
            }
            Self::Exponential { initial, multiplier } => {
                let secs = initial.as_secs_f64() * multiplier.powi(attempt.min(i32::MAX as u32) as i32);
                Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
            }
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    pub fn exponential(initial: Duration) -> Self {
        Self::Exponential {
            initial,
            multiplier: 2.0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// What to do with the events behind an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Acknowledge,
    /// Release with this delay before the next attempt
    Retry(Duration),
    /// Backend was not contacted. Hand back after this delay without
    /// spending an attempt.
    Defer(Duration),
    DeadLetter(DeadLetterReason),
    /// Abort the cycle without acknowledging anything
    Escalate,
}

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total delivery attempts, the first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: BackoffStrategy,

    /// Cap applied to every computed delay
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
}

fn default_max_attempts() -> u32 { 5 }
fn default_max_delay() -> Duration { Duration::from_secs(300) }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffStrategy::default(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Dead-letter on the first transient failure.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delay after `retry_count` failed attempts, capped at `max_delay`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.backoff.delay_for_attempt(retry_count).min(self.max_delay)
    }

    /// Whether another attempt is allowed after `retry_count` earlier failures
    /// plus the one just observed.
    pub fn can_retry(&self, retry_count: u32) -> bool {
        retry_count.saturating_add(1) < self.max_attempts
    }

    /// Decide what happens to an operation's events.
    ///
    /// The highest retry count among the source events drives both the
    /// backoff exponent and the cutoff.
    pub fn classify(&self, outcome: &OperationOutcome) -> Action {
        let error = match &outcome.result {
            Ok(()) => return Action::Acknowledge,
            Err(e) => e,
        };

        if let Some(delay) = outcome.deferred {
            return Action::Defer(delay.min(self.max_delay));
        }
        if error.is_systemic() {
            return Action::Escalate;
        }
        if !error.is_transient() {
            return Action::DeadLetter(DeadLetterReason::Validation);
        }

        let retry_count = outcome.operation.max_retry_count;
        if self.can_retry(retry_count) {
            Action::Retry(self.delay_for(retry_count))
        } else {
            Action::DeadLetter(DeadLetterReason::RetriesExhausted)
        }
    }

    /// Action for an error raised by the engine itself rather than a backend.
    pub fn classify_error(&self, error: &RelayError) -> Action {
        if error.is_systemic() {
            Action::Escalate
        } else if error.is_retryable() {
            Action::Retry(self.delay_for(0))
        } else {
            Action::Escalate
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coalesce::{CoalescedOperation, IndexAction};
    use crate::dispatch::IndexError;
    use crate::error::ErrorCode;
    use crate::lease::ShardId;
    use crate::outbox::{EntityRef, EventId};

    fn outcome(result: Result<(), IndexError>, retry_count: u32) -> OperationOutcome {
        OperationOutcome::attempted(
            CoalescedOperation {
                entity: EntityRef::new("Book", "1"),
                action: IndexAction::Update,
                routing_key: None,
                source_events: vec![EventId(1)],
                max_retry_count: retry_count,
                last_position: 0,
            },
            result,
            Duration::from_millis(3),
        )
    }

    #[test]
    fn test_backoff_strategies() {
        let fixed = BackoffStrategy::fixed(Duration::from_secs(7));
        assert_eq!(fixed.delay_for_attempt(9), Duration::from_secs(7));

        let linear = BackoffStrategy::Linear {
            initial: Duration::from_secs(2),
            increment: Duration::from_secs(3),
        };
        assert_eq!(linear.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(linear.delay_for_attempt(4), Duration::from_secs(14));

        let exp = BackoffStrategy::exponential(Duration::from_secs(1));
        assert_eq!(exp.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(exp.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(exp.delay_for_attempt(10_000), Duration::MAX);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 100,
            backoff: BackoffStrategy::exponential(Duration::from_secs(1)),
            max_delay: Duration::from_secs(60),
        };
        assert_eq!(policy.delay_for(20), Duration::from_secs(60));
    }

    #[test]
    fn test_transient_error_retries_until_budget_spent() {
        let policy = RetryPolicy::default().with_max_attempts(3);
        let transient = || Err(IndexError::timeout("slow"));

        assert_eq!(policy.classify(&outcome(transient(), 0)), Action::Retry(Duration::from_secs(1)));
        assert_eq!(policy.classify(&outcome(transient(), 1)), Action::Retry(Duration::from_secs(2)));
        assert_eq!(
            policy.classify(&outcome(transient(), 2)),
            Action::DeadLetter(DeadLetterReason::RetriesExhausted)
        );
    }

    #[test]
    fn test_validation_error_dead_letters_immediately() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.classify(&outcome(Err(IndexError::malformed("bad field")), 0)),
            Action::DeadLetter(DeadLetterReason::Validation)
        );
        assert_eq!(policy.classify(&outcome(Ok(()), 4)), Action::Acknowledge);
    }

    #[test]
    fn test_short_circuit_defers_without_spending_budget() {
        let policy = RetryPolicy::default().with_max_attempts(2);
        let mut deferred = outcome(Err(IndexError::unavailable("circuit open")), 5);
        deferred.deferred = Some(Duration::from_secs(20));
        assert_eq!(policy.classify(&deferred), Action::Defer(Duration::from_secs(20)));

        deferred.deferred = Some(Duration::from_secs(3600));
        assert_eq!(policy.classify(&deferred), Action::Defer(Duration::from_secs(300)));
    }

    #[test]
    fn test_fenced_write_escalates() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.classify(&outcome(Err(IndexError::fenced("version 12 already indexed")), 0)),
            Action::Escalate
        );
    }

    #[test]
    fn test_systemic_errors_escalate() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.classify_error(&RelayError::lease_lost(ShardId(0), "stale epoch")),
            Action::Escalate
        );
        assert_eq!(
            policy.classify_error(&RelayError::new(ErrorCode::StorageError, "db down")),
            Action::Escalate
        );
        assert_eq!(
            policy.classify_error(&RelayError::new(ErrorCode::IndexBackendTimeout, "slow")),
            Action::Retry(Duration::from_secs(1))
        );
    }
}
