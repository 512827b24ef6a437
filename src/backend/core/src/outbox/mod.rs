//! Durable event outbox.
//!
//! Producers append change events in the same transaction as the entity write;
//! agents claim batches of them per leased shard, and acknowledge, release or
//! dead-letter what they claimed.
//!
//! # Event lifecycle
//!
//! ```text
//!            append
//!              │
//!              ▼
//!   ┌──────▶ PENDING ──claim──▶ CLAIMED ──mark_processing──▶ PROCESSING
//!   │          ▲                  │  │                          │  │
//!   │          │ sweep (expired)  │  └──────── acknowledge ─────┼──┴──▶ (deleted)
//!   │          └──────────────────┴─────────────────────────────┘
//!   │                             │
//!   └── not_before ── FAILED ◀────┴── release(retry_after) / dead_letter ──▶ dead letters
//! ```
//!
//! Every mutating call takes a [`Fence`]: the caller's `(shard, epoch)` pairs.
//! Storage rejects work carried out under a superseded lease.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryOutboxStore;
pub use postgres::PgOutboxStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ErrorCode, RelayError, Result};
use crate::lease::{AgentId, Epoch, Fence, ShardId};

// ═══════════════════════════════════════════════════════════════════════════════
// Event Types
// ═══════════════════════════════════════════════════════════════════════════════

/// Monotonic sequence id of an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The entity an event is about. Events of one entity coalesce together.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    pub fn shard(&self, shard_count: u32) -> ShardId {
        ShardId::for_entity(&self.entity_type, &self.entity_id, shard_count)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Add,
    Update,
    Delete,
    /// Re-index because an associated entity was deleted.
    UpdateBecauseOfAssociatedDelete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Add => "add",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::UpdateBecauseOfAssociatedDelete => "update_because_of_associated_delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "add" => Ok(OperationKind::Add),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            "update_because_of_associated_delete" => Ok(OperationKind::UpdateBecauseOfAssociatedDelete),
            other => Err(RelayError::new(
                ErrorCode::DeserializationError,
                format!("Unknown operation kind: {}", other),
            )),
        }
    }
}

/// Processing state of a stored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Claimed,
    Processing,
    /// Released with a retry delay; claimable again once `not_before` passes.
    Failed,
    Done,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Claimed => "claimed",
            EventStatus::Processing => "processing",
            EventStatus::Failed => "failed",
            EventStatus::Done => "done",
        }
    }

    /// Held by an agent.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, EventStatus::Claimed | EventStatus::Processing)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "claimed" => Ok(EventStatus::Claimed),
            "processing" => Ok(EventStatus::Processing),
            "failed" => Ok(EventStatus::Failed),
            "done" => Ok(EventStatus::Done),
            other => Err(RelayError::new(
                ErrorCode::DeserializationError,
                format!("Unknown event status: {}", other),
            )),
        }
    }
}

/// An event as handed to [`OutboxStore::append`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    pub entity: EntityRef,
    pub kind: OperationKind,
    /// Opaque index routing hint passed through to the index writer.
    pub routing_key: Option<String>,
}

impl NewEvent {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            entity: EntityRef::new(entity_type, entity_id),
            kind,
            routing_key: None,
        }
    }

    pub fn add(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::new(entity_type, entity_id, OperationKind::Add)
    }

    pub fn update(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::new(entity_type, entity_id, OperationKind::Update)
    }

    pub fn delete(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::new(entity_type, entity_id, OperationKind::Delete)
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.entity.entity_type.is_empty() || self.entity.entity_id.is_empty() {
            return Err(RelayError::validation("Entity type and id must not be empty"));
        }
        Ok(())
    }
}

/// Who holds an in-flight event, and until when.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimInfo {
    pub agent: AgentId,
    pub epoch: Epoch,
    pub expires_at: DateTime<Utc>,
}

/// A stored outbox event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: EventId,
    pub shard: ShardId,
    pub entity: EntityRef,
    pub kind: OperationKind,
    pub routing_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: EventStatus,
    pub retry_count: u32,
    pub not_before: Option<DateTime<Utc>>,
    pub claim: Option<ClaimInfo>,
    pub last_error: Option<String>,
}

impl OutboxEvent {
    /// Whether a claim at `now` may pick this event up.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            EventStatus::Pending => true,
            EventStatus::Failed => self.not_before.map_or(true, |t| t <= now),
            _ => false,
        }
    }

    /// Whether the event is in flight under this fence's claim.
    pub fn is_claimed_under(&self, fence: &Fence) -> bool {
        self.status.is_in_flight()
            && self.claim.map_or(false, |c| {
                c.agent == fence.agent && Some(c.epoch) == fence.epoch_for(self.shard)
            })
    }

    /// An in-flight event whose claim ran out.
    pub fn is_claim_expired(&self, now: DateTime<Utc>) -> bool {
        self.status.is_in_flight() && self.claim.map_or(true, |c| c.expires_at <= now)
    }
}

/// Events claimed together, in ascending sequence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub agent: AgentId,
    pub events: Vec<OutboxEvent>,
}

impl Batch {
    pub fn empty(agent: AgentId) -> Self {
        Self {
            agent,
            events: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn ids(&self) -> Vec<EventId> {
        self.events.iter().map(|e| e.id).collect()
    }
}

/// Outcome of [`OutboxStore::acknowledge`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckReport {
    /// Deleted from the log.
    pub acknowledged: Vec<EventId>,
    /// Unknown or already deleted.
    pub missing: Vec<EventId>,
    /// Present but no longer claimed by the caller (for example swept back).
    pub not_owned: Vec<EventId>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dead Letters
// ═══════════════════════════════════════════════════════════════════════════════

/// Why an event was moved to the dead-letter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Transient failures exceeded the retry budget
    RetriesExhausted,
    /// The index backend rejected the document as invalid
    Validation,
    Unknown,
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterReason::RetriesExhausted => write!(f, "retries_exhausted"),
            DeadLetterReason::Validation => write!(f, "validation"),
            DeadLetterReason::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for DeadLetterReason {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "retries_exhausted" => DeadLetterReason::RetriesExhausted,
            "validation" => DeadLetterReason::Validation,
            _ => DeadLetterReason::Unknown,
        })
    }
}

/// One event to dead-letter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterEntry {
    pub id: EventId,
    pub reason: DeadLetterReason,
    pub error: String,
}

/// A dead-lettered event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Sequence id the event had in the log
    pub id: EventId,
    pub shard: ShardId,
    pub entity: EntityRef,
    pub kind: OperationKind,
    pub routing_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub reason: DeadLetterReason,
    pub error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub claimed: u64,
    pub processing: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable event log with claim-based consumption.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Append an event with the next sequence id.
    async fn append(&self, event: NewEvent) -> Result<EventId>;

    /// Claim up to `max_batch_size` events of the fence's live shards.
    ///
    /// Events come back in ascending sequence order. An event is skipped while
    /// an earlier event of the same entity is still in the log and not
    /// claimable by this call.
    async fn claim(&self, fence: &Fence, max_batch_size: usize, visibility_timeout: Duration) -> Result<Batch>;

    /// `Claimed -> Processing` for events still claimed under the fence.
    async fn mark_processing(&self, fence: &Fence, ids: &[EventId]) -> Result<usize>;

    /// Return expired in-flight events to `Pending` without touching their
    /// retry count.
    async fn sweep_expired(&self) -> Result<usize>;

    /// Delete successfully indexed events.
    ///
    /// Fails, deleting nothing, if any requested event's shard is outside the
    /// fence (`ShardNotOwned`) or no longer held at the fence epoch (`LeaseLost`).
    async fn acknowledge(&self, fence: &Fence, ids: &[EventId]) -> Result<AckReport>;

    /// Hand events back after a failed attempt, incrementing their retry count.
    ///
    /// With `retry_after` they wait as `Failed` until the delay passes.
    async fn release(
        &self,
        fence: &Fence,
        ids: &[EventId],
        retry_after: Option<Duration>,
        error: Option<&str>,
    ) -> Result<usize>;

    /// Hand events back without counting an attempt. With `retry_after` they
    /// wait as `Failed` until the delay passes, otherwise they are pending again.
    async fn hand_back(&self, fence: &Fence, ids: &[EventId], retry_after: Option<Duration>) -> Result<usize>;

    /// Move claimed events to the dead-letter table.
    async fn dead_letter(&self, fence: &Fence, entries: &[DeadLetterEntry]) -> Result<usize>;

    async fn find(&self, id: EventId) -> Result<Option<OutboxEvent>>;

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>>;

    /// Re-append a dead-lettered event as a fresh pending event.
    async fn requeue_dead_letter(&self, id: EventId) -> Result<EventId>;

    async fn discard_dead_letter(&self, id: EventId) -> Result<()>;

    async fn stats(&self) -> Result<OutboxStats>;
}

pub(crate) fn validate_claim(fence: &Fence, max_batch_size: usize) -> Result<()> {
    if max_batch_size == 0 {
        return Err(RelayError::validation("max_batch_size must be positive"));
    }
    if fence.is_empty() {
        return Err(RelayError::validation("claim requires at least one leased shard"));
    }
    Ok(())
}
