//! Agent registry and shard lease management.
//!
//! Agents coordinate exclusively through per-shard leases:
//!
//! - **Leases, not locks**: a lease is a time-bounded grant that must be renewed
//! - **No preemption**: a live lease is never taken from its holder; contenders
//!   wait for expiry or voluntary release
//! - **Epoch fencing**: every change of owner bumps the shard's epoch, and
//!   claims, renewals and acknowledgements carrying an older epoch are rejected
//!
//! ```text
//! UNLEASED ──acquire──▶ LEASED(owner, epoch, expiry)
//!    ▲                        │
//!    └── expiry / release ────┘──acquire by other──▶ LEASED(other, epoch+1, ...)
//! ```
//!
//! The backing [`LeaseStore`] also owns agent records; agents that stop
//! heartbeating are reaped and their leases forfeited.

pub mod manager;
pub mod memory;
pub mod postgres;

pub use manager::{LeaseConfig, LeaseManager, ShardAssignment};
pub use memory::InMemoryLeaseStore;
pub use postgres::PgLeaseStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

/// A partition of the event space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(pub u32);

impl ShardId {
    /// Stable shard for an entity.
    ///
    /// Uses SHA-256 rather than `std` hashing so the mapping is identical in
    /// every process and toolchain: all events of one entity must land in one
    /// shard.
    pub fn for_entity(entity_type: &str, entity_id: &str, shard_count: u32) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(entity_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(entity_id.as_bytes());
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let bucket = u64::from_be_bytes(prefix) % u64::from(shard_count.max(1));
        Self(bucket as u32)
    }

    /// All shards `0..shard_count`.
    pub fn all(shard_count: u32) -> Vec<ShardId> {
        (0..shard_count).map(ShardId).collect()
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fencing token: increases every time a shard changes hands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a coordination agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════════════

/// A registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub name: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// The agent is considered dead once this passes without a heartbeat.
    pub expires_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn is_alive(&self, now: DateTime<Utc>) -> bool {
        self.expires_at >= now
    }
}

/// Stored state of one shard's lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardLease {
    pub shard: ShardId,
    pub owner: Option<AgentId>,
    pub epoch: Epoch,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ShardLease {
    pub fn unleased(shard: ShardId) -> Self {
        Self {
            shard,
            owner: None,
            epoch: Epoch::default(),
            expires_at: None,
        }
    }

    /// Owner of a lease that has not expired.
    pub fn live_owner(&self, now: DateTime<Utc>) -> Option<AgentId> {
        match (self.owner, self.expires_at) {
            (Some(owner), Some(expires_at)) if expires_at > now => Some(owner),
            _ => None,
        }
    }

    /// Whether `agent` holds this lease at `epoch` and it has not expired.
    pub fn is_live_for(&self, agent: AgentId, epoch: Epoch, now: DateTime<Utc>) -> bool {
        self.live_owner(now) == Some(agent) && self.epoch == epoch
    }

    /// Whether `agent` is still the recorded owner at `epoch`, expired or not.
    ///
    /// Nobody else can have taken the shard without bumping the epoch.
    pub fn is_held_by(&self, agent: AgentId, epoch: Epoch) -> bool {
        self.owner == Some(agent) && self.epoch == epoch
    }
}

/// A granted or renewed lease as seen by its holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseGrant {
    pub shard: ShardId,
    pub epoch: Epoch,
    pub expires_at: DateTime<Utc>,
}

/// Result of an acquisition request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseResult {
    pub granted: Vec<LeaseGrant>,
    pub denied: Vec<ShardId>,
}

/// Result of a renewal request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenewResult {
    pub renewed: Vec<LeaseGrant>,
    /// Shards whose owner or epoch no longer matches.
    pub lost: Vec<ShardId>,
}

/// The set of `(shard, epoch)` pairs an agent acts under.
///
/// Passed to every mutating outbox call so storage can reject work done under
/// a superseded lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fence {
    pub agent: AgentId,
    pub epochs: BTreeMap<ShardId, Epoch>,
}

impl Fence {
    pub fn new(agent: AgentId) -> Self {
        Self {
            agent,
            epochs: BTreeMap::new(),
        }
    }

    pub fn from_grants<'a>(agent: AgentId, grants: impl IntoIterator<Item = &'a LeaseGrant>) -> Self {
        Self {
            agent,
            epochs: grants.into_iter().map(|g| (g.shard, g.epoch)).collect(),
        }
    }

    pub fn with_shard(mut self, shard: ShardId, epoch: Epoch) -> Self {
        self.epochs.insert(shard, epoch);
        self
    }

    pub fn epoch_for(&self, shard: ShardId) -> Option<Epoch> {
        self.epochs.get(&shard).copied()
    }

    pub fn shards(&self) -> Vec<ShardId> {
        self.epochs.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Traits
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable agent registry and per-shard lease table.
///
/// Every lease mutation is a per-shard compare-and-swap; implementations must
/// never grant a shard whose live lease belongs to another agent.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Register (or re-register) an agent with a liveness window of `ttl`.
    async fn register_agent(&self, agent: AgentId, name: &str, ttl: Duration) -> Result<AgentRecord>;

    /// Refresh an agent's liveness window.
    ///
    /// Fails with `AgentNotRegistered` if the agent was reaped.
    async fn heartbeat(&self, agent: AgentId, ttl: Duration) -> Result<AgentRecord>;

    /// Remove an agent and forfeit all its leases.
    async fn unregister_agent(&self, agent: AgentId) -> Result<()>;

    /// Remove agents whose liveness window passed, forfeiting their leases.
    async fn reap_dead_agents(&self) -> Result<Vec<AgentId>>;

    /// All registered agents.
    async fn agents(&self) -> Result<Vec<AgentRecord>>;

    /// Try to lease each shard for `duration`, in the order given.
    async fn acquire(&self, agent: AgentId, shards: &[ShardId], duration: Duration) -> Result<LeaseResult>;

    /// Extend leases that are still held at the same epoch.
    async fn renew(&self, agent: AgentId, grants: &[LeaseGrant], duration: Duration) -> Result<RenewResult>;

    /// Voluntarily forfeit leases. Returns how many were released.
    async fn release(&self, agent: AgentId, shards: &[ShardId]) -> Result<usize>;

    /// Current lease table.
    async fn leases(&self) -> Result<Vec<ShardLease>>;
}

/// Synchronous read access to lease state, for storage backends that share a
/// process with their lease table.
pub trait LeaseView: Send + Sync {
    fn lease_of(&self, shard: ShardId) -> Option<ShardLease>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_for_entity_is_stable_and_bounded() {
        let a = ShardId::for_entity("Book", "42", 16);
        let b = ShardId::for_entity("Book", "42", 16);
        assert_eq!(a, b);
        assert!(a.0 < 16);

        for id in 0..500 {
            let shard = ShardId::for_entity("Author", &id.to_string(), 7);
            assert!(shard.0 < 7);
        }
    }

    #[test]
    fn test_single_shard_maps_everything_to_zero() {
        assert_eq!(ShardId::for_entity("Book", "1", 1), ShardId(0));
        assert_eq!(ShardId::for_entity("Book", "1", 0), ShardId(0));
    }

    #[test]
    fn test_lease_liveness() {
        let now = Utc::now();
        let agent = AgentId::new();
        let lease = ShardLease {
            shard: ShardId(0),
            owner: Some(agent),
            epoch: Epoch(3),
            expires_at: Some(now + chrono::Duration::seconds(10)),
        };
        assert!(lease.is_live_for(agent, Epoch(3), now));
        assert!(!lease.is_live_for(agent, Epoch(2), now));
        assert!(!lease.is_live_for(agent, Epoch(3), now + chrono::Duration::seconds(11)));
        assert!(lease.is_held_by(agent, Epoch(3)));
    }

    #[test]
    fn test_fence_from_grants() {
        let agent = AgentId::new();
        let now = Utc::now();
        let grants = vec![
            LeaseGrant { shard: ShardId(2), epoch: Epoch(5), expires_at: now },
            LeaseGrant { shard: ShardId(0), epoch: Epoch(1), expires_at: now },
        ];
        let fence = Fence::from_grants(agent, &grants);
        assert_eq!(fence.shards(), vec![ShardId(0), ShardId(2)]);
        assert_eq!(fence.epoch_for(ShardId(2)), Some(Epoch(5)));
        assert_eq!(fence.epoch_for(ShardId(1)), None);
    }
}
