#![allow(clippy::result_large_err)]
//! # Relay Core
//!
//! Durable change-event outbox and polling coordinator that keeps a search
//! index in step with a primary database.
//!
//! ## Architecture
//!
//! - **Outbox**: append-only event log with claim, acknowledge, release and
//!   dead-letter operations, fenced by shard lease epochs
//! - **Leases**: agent registry plus non-preemptive, epoch-fenced shard leases
//! - **Coalescing**: folds a batch into at most one index operation per entity
//! - **Dispatch**: bounded-parallel index writes with timeouts and a circuit
//!   breaker
//! - **Retry**: maps each outcome to acknowledge, retry, dead-letter or escalate
//! - **Scheduler**: the adaptive polling loop tying the above together
//! - **Admin API / Health / Telemetry**: operator surface, probes, logs and
//!   Prometheus metrics

pub mod api;
pub mod clock;
pub mod coalesce;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod lease;
pub mod outbox;
pub mod retry;
pub mod scheduler;
pub mod telemetry;

pub use error::{ErrorCode, ErrorDetails, ErrorSeverity, RelayError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SharedClock, SystemClock};
    pub use crate::coalesce::{coalesce, CoalescedOperation, IndexAction};
    pub use crate::dispatch::{DispatchConfig, Dispatcher, IndexError, IndexErrorKind, IndexWriter};
    pub use crate::error::{ErrorCode, RelayError, Result};
    pub use crate::lease::{
        AgentId, Epoch, Fence, LeaseConfig, LeaseManager, LeaseStore, ShardAssignment, ShardId,
    };
    pub use crate::outbox::{
        Batch, EntityRef, EventId, NewEvent, OperationKind, OutboxEvent, OutboxStore,
    };
    pub use crate::retry::{Action, BackoffStrategy, RetryPolicy};
    pub use crate::scheduler::{CycleOutcome, CycleReport, PollConfig, RelayScheduler};
}
