//! Dispatch of coalesced operations to index backends.
//!
//! ```text
//! Vec<CoalescedOperation>
//!        │  buffer_unordered(parallelism)
//!        ▼
//!   ┌──────────┐   timeout    ┌──────────────┐
//!   │ breaker  │ ───────────▶ │ IndexWriter  │ ──▶ OperationOutcome
//!   └──────────┘              └──────────────┘
//! ```
//!
//! Each operation covers a distinct entity, so they may run in any order.
//! While the breaker is open an operation is not attempted at all; its
//! outcome carries the remaining cooldown so the events can be deferred
//! without spending a delivery attempt.

pub mod breaker;
pub mod fanout;
pub mod http;
pub mod memory;

pub use breaker::{CircuitBreaker, CircuitBreakerMetrics, CircuitState};
pub use fanout::FanoutIndexWriter;
pub use http::{HttpIndexConfig, HttpIndexWriter};
pub use memory::{default_mapper, DocumentMapper, InMemoryIndex, IndexedDocument};

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::coalesce::CoalescedOperation;
use crate::outbox::EventId;

// ═══════════════════════════════════════════════════════════════════════════════
// Index Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure categories an index backend can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexErrorKind {
    Timeout,
    ConnectionReset,
    Overloaded,
    Unavailable,
    /// The document could not be built or was malformed
    Malformed,
    /// The backend refused the operation as invalid
    Rejected,
    /// The backend already holds a newer version written by someone else
    Fenced,
}

impl IndexErrorKind {
    /// Worth retrying after a delay.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IndexErrorKind::Timeout
                | IndexErrorKind::ConnectionReset
                | IndexErrorKind::Overloaded
                | IndexErrorKind::Unavailable
        )
    }

    /// Ownership confusion rather than a problem with this operation.
    pub fn is_systemic(&self) -> bool {
        matches!(self, IndexErrorKind::Fenced)
    }

    /// Higher is worse. Permanent failures outrank transient ones.
    pub fn severity(&self) -> u8 {
        match self {
            IndexErrorKind::Timeout => 1,
            IndexErrorKind::ConnectionReset => 2,
            IndexErrorKind::Overloaded => 3,
            IndexErrorKind::Unavailable => 4,
            IndexErrorKind::Rejected => 5,
            IndexErrorKind::Malformed => 6,
            IndexErrorKind::Fenced => 7,
        }
    }
}

impl fmt::Display for IndexErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IndexErrorKind::Timeout => "timeout",
            IndexErrorKind::ConnectionReset => "connection_reset",
            IndexErrorKind::Overloaded => "overloaded",
            IndexErrorKind::Unavailable => "unavailable",
            IndexErrorKind::Malformed => "malformed",
            IndexErrorKind::Rejected => "rejected",
            IndexErrorKind::Fenced => "fenced",
        };
        f.write_str(s)
    }
}

/// An error reported by an index backend for one operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct IndexError {
    pub kind: IndexErrorKind,
    pub message: String,
}

impl IndexError {
    pub fn new(kind: IndexErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(IndexErrorKind::Timeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(IndexErrorKind::Unavailable, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(IndexErrorKind::Malformed, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(IndexErrorKind::Rejected, message)
    }

    pub fn fenced(message: impl Into<String>) -> Self {
        Self::new(IndexErrorKind::Fenced, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    pub fn is_systemic(&self) -> bool {
        self.kind.is_systemic()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Index Writer
// ═══════════════════════════════════════════════════════════════════════════════

/// A search-index backend.
#[async_trait]
pub trait IndexWriter: Send + Sync {
    /// Backend name for logs and metrics.
    fn name(&self) -> &str;

    /// Apply one net operation. Must be idempotent: the same operation may be
    /// delivered more than once.
    async fn apply(&self, operation: &CoalescedOperation) -> Result<(), IndexError>;

    /// Whether the backend is reachable.
    async fn health_check(&self) -> bool {
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dispatcher
// ═══════════════════════════════════════════════════════════════════════════════

/// Dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum operations in flight at once
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Upper bound on a single backend call
    #[serde(with = "humantime_serde", default = "default_operation_timeout")]
    pub operation_timeout: Duration,

    /// Consecutive transient failures before the breaker opens (0 disables)
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    #[serde(with = "humantime_serde", default = "default_breaker_cooldown")]
    pub breaker_cooldown: Duration,
}

fn default_parallelism() -> usize { 8 }
fn default_operation_timeout() -> Duration { Duration::from_secs(10) }
fn default_breaker_threshold() -> u32 { 5 }
fn default_breaker_cooldown() -> Duration { Duration::from_secs(30) }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            operation_timeout: default_operation_timeout(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown: default_breaker_cooldown(),
        }
    }
}

/// Result of dispatching one operation.
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub operation: CoalescedOperation,
    pub result: Result<(), IndexError>,
    pub elapsed: Duration,
    /// Set when the breaker short-circuited the call: the backend was never
    /// contacted and may be tried again after this long.
    pub deferred: Option<Duration>,
}

impl OperationOutcome {
    /// Outcome of an operation that reached the backend.
    pub fn attempted(operation: CoalescedOperation, result: Result<(), IndexError>, elapsed: Duration) -> Self {
        Self {
            operation,
            result,
            elapsed,
            deferred: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Whether the backend was never called for this operation.
    pub fn is_short_circuited(&self) -> bool {
        self.deferred.is_some()
    }

    /// Events this outcome settles.
    pub fn event_ids(&self) -> &[EventId] {
        &self.operation.source_events
    }

    pub fn error(&self) -> Option<&IndexError> {
        self.result.as_ref().err()
    }
}

/// Submits operations to an [`IndexWriter`] with bounded parallelism.
pub struct Dispatcher {
    writer: Arc<dyn IndexWriter>,
    config: DispatchConfig,
    breaker: CircuitBreaker,
}

impl Dispatcher {
    pub fn new(writer: Arc<dyn IndexWriter>, config: DispatchConfig, clock: SharedClock) -> Self {
        let breaker = CircuitBreaker::new(config.breaker_threshold, config.breaker_cooldown, clock);
        Self {
            writer,
            config,
            breaker,
        }
    }

    pub fn writer(&self) -> &Arc<dyn IndexWriter> {
        &self.writer
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Dispatch every operation; outcomes come back in input order.
    #[tracing::instrument(skip_all, fields(backend = self.writer.name(), operations = operations.len()))]
    pub async fn dispatch(&self, operations: Vec<CoalescedOperation>) -> Vec<OperationOutcome> {
        let parallelism = self.config.parallelism.max(1);

        let mut outcomes: Vec<(usize, OperationOutcome)> = stream::iter(operations.into_iter().enumerate())
            .map(|(i, op)| async move { (i, self.dispatch_one(op).await) })
            .buffer_unordered(parallelism)
            .collect()
            .await;

        outcomes.sort_by_key(|(i, _)| *i);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }

    async fn dispatch_one(&self, operation: CoalescedOperation) -> OperationOutcome {
        let start = Instant::now();

        if !self.breaker.can_execute() {
            let retry_in = self.breaker.remaining_cooldown();
            tracing::debug!(
                entity = %operation.entity,
                retry_in_ms = retry_in.as_millis() as u64,
                "Index circuit open, deferring operation"
            );
            return OperationOutcome {
                operation,
                result: Err(IndexError::unavailable(format!(
                    "circuit open for backend {}",
                    self.writer.name()
                ))),
                elapsed: start.elapsed(),
                deferred: Some(retry_in),
            };
        }

        let result = match tokio::time::timeout(self.config.operation_timeout, self.writer.apply(&operation)).await {
            Ok(result) => result,
            Err(_) => Err(IndexError::timeout(format!(
                "no response within {:?}",
                self.config.operation_timeout
            ))),
        };

        match &result {
            Ok(()) => self.breaker.record_success(),
            Err(e) if e.is_transient() => self.breaker.record_failure(),
            // The backend answered; only the input was bad.
            Err(_) => self.breaker.record_success(),
        }

        let elapsed = start.elapsed();
        metrics::histogram!("relay_dispatch_duration_seconds", "backend" => self.writer.name().to_string())
            .record(elapsed.as_secs_f64());

        if let Err(e) = &result {
            tracing::debug!(
                entity = %operation.entity,
                action = %operation.action,
                error = %e,
                "Index operation failed"
            );
        }

        OperationOutcome::attempted(operation, result, elapsed)
    }
}
