//! Agent-side lease bookkeeping.
//!
//! A [`LeaseManager`] is owned by the hosting process and passed explicitly to
//! the scheduler. It keeps the agent registered, renews what it holds, picks up
//! free shards up to its fair share and hands back surplus.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{AgentId, AgentRecord, Fence, LeaseGrant, LeaseStore, ShardId};
use crate::clock::SharedClock;
use crate::error::{ErrorCode, Result};

/// Which shards an agent tries to lease.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ShardAssignment {
    /// Aim for `ceil(shard_count / live_agents)` shards.
    #[default]
    Dynamic,
    /// Only ever lease the listed shards.
    Static { shards: Vec<u32> },
}

/// Lease and liveness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Number of shards the event space is split into
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,

    /// How long a granted lease lasts without renewal
    #[serde(with = "humantime_serde", default = "default_lease_duration")]
    pub lease_duration: Duration,

    /// How often the agent heartbeats
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,

    /// Consecutive missed heartbeats before an agent counts as dead
    #[serde(default = "default_heartbeat_failure_threshold")]
    pub heartbeat_failure_threshold: u32,

    #[serde(default)]
    pub assignment: ShardAssignment,
}

fn default_shard_count() -> u32 { 16 }
fn default_lease_duration() -> Duration { Duration::from_secs(30) }
fn default_heartbeat_interval() -> Duration { Duration::from_secs(5) }
fn default_heartbeat_failure_threshold() -> u32 { 3 }

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            lease_duration: default_lease_duration(),
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_failure_threshold: default_heartbeat_failure_threshold(),
            assignment: ShardAssignment::default(),
        }
    }
}

impl LeaseConfig {
    /// Liveness window granted by each heartbeat.
    pub fn agent_ttl(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_failure_threshold.max(1)
    }
}

/// Holds one agent's registration and leases.
pub struct LeaseManager {
    agent: AgentId,
    name: String,
    store: Arc<dyn LeaseStore>,
    clock: SharedClock,
    config: LeaseConfig,
    held: Mutex<BTreeMap<ShardId, LeaseGrant>>,
    heartbeat_failures: AtomicU32,
    dead: AtomicBool,
}

impl LeaseManager {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn LeaseStore>,
        clock: SharedClock,
        config: LeaseConfig,
    ) -> Self {
        Self {
            agent: AgentId::new(),
            name: name.into(),
            store,
            clock,
            config,
            held: Mutex::new(BTreeMap::new()),
            heartbeat_failures: AtomicU32::new(0),
            dead: AtomicBool::new(false),
        }
    }

    pub fn agent(&self) -> AgentId {
        self.agent
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    /// Whether missed heartbeats have crossed the failure threshold.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub async fn register(&self) -> Result<AgentRecord> {
        let record = self
            .store
            .register_agent(self.agent, &self.name, self.config.agent_ttl())
            .await?;
        self.heartbeat_failures.store(0, Ordering::Release);
        self.dead.store(false, Ordering::Release);

        tracing::info!(agent = %self.agent, name = %self.name, "Agent registered");
        Ok(record)
    }

    /// Refresh liveness.
    ///
    /// If the registry no longer knows this agent it was reaped: every lease
    /// it held is gone, so the local view is dropped and the agent registers
    /// again. Other failures count toward the heartbeat failure threshold.
    pub async fn heartbeat(&self) -> Result<()> {
        match self.store.heartbeat(self.agent, self.config.agent_ttl()).await {
            Ok(_) => {
                self.heartbeat_failures.store(0, Ordering::Release);
                if self.dead.swap(false, Ordering::AcqRel) {
                    tracing::info!(agent = %self.agent, "Heartbeat recovered");
                }
                Ok(())
            }
            Err(e) if e.code() == ErrorCode::AgentNotRegistered => {
                let lost = self.forget_all();
                if lost > 0 {
                    metrics::counter!("relay_lease_lost_total").increment(lost as u64);
                }
                tracing::warn!(agent = %self.agent, lost_shards = lost, "Agent was reaped, registering again");
                self.register().await.map(|_| ())
            }
            Err(e) => {
                let failures = self.heartbeat_failures.fetch_add(1, Ordering::AcqRel) + 1;
                tracing::warn!(
                    agent = %self.agent,
                    failures,
                    threshold = self.config.heartbeat_failure_threshold,
                    error = %e,
                    "Heartbeat failed"
                );
                if failures >= self.config.heartbeat_failure_threshold
                    && !self.dead.swap(true, Ordering::AcqRel)
                {
                    let dropped = self.forget_all();
                    tracing::error!(
                        agent = %self.agent,
                        dropped_shards = dropped,
                        "Heartbeat failure threshold reached, treating own leases as lost"
                    );
                }
                Err(e)
            }
        }
    }

    /// Renew held leases, then top up to the target share and release surplus.
    ///
    /// Returns the fence to claim under. A dead agent holds nothing.
    #[tracing::instrument(skip(self), fields(agent = %self.agent))]
    pub async fn maintain(&self) -> Result<Fence> {
        if self.is_dead() {
            return Ok(Fence::new(self.agent));
        }

        self.renew_held().await?;

        let target = self.target_shards().await?;
        let held: Vec<ShardId> = self.held.lock().keys().copied().collect();

        if held.len() < target.len() {
            let wanted = self.candidates(&held, &target, target.len() - held.len()).await?;
            if !wanted.is_empty() {
                let result = self
                    .store
                    .acquire(self.agent, &wanted, self.config.lease_duration)
                    .await?;
                if !result.granted.is_empty() {
                    tracing::info!(
                        shards = ?result.granted.iter().map(|g| g.shard.0).collect::<Vec<_>>(),
                        "Acquired shard leases"
                    );
                }
                let mut map = self.held.lock();
                for grant in result.granted {
                    map.insert(grant.shard, grant);
                }
            }
        } else {
            let surplus: Vec<ShardId> = held
                .iter()
                .rev()
                .filter(|s| !target.contains(s))
                .take(held.len() - target.len())
                .copied()
                .collect();
            if !surplus.is_empty() {
                self.store.release(self.agent, &surplus).await?;
                let mut map = self.held.lock();
                for shard in &surplus {
                    map.remove(shard);
                }
                tracing::info!(shards = ?surplus.iter().map(|s| s.0).collect::<Vec<_>>(), "Released surplus shard leases");
            }
        }

        let fence = self.fence();
        metrics::gauge!("relay_leased_shards").set(fence.epochs.len() as f64);
        Ok(fence)
    }

    /// Leases currently held, as a fence.
    pub fn fence(&self) -> Fence {
        Fence::from_grants(self.agent, self.held.lock().values())
    }

    pub fn held_shards(&self) -> Vec<ShardId> {
        self.held.lock().keys().copied().collect()
    }

    /// Forfeit every held lease.
    pub async fn release_all(&self) -> Result<usize> {
        let shards = self.held_shards();
        if shards.is_empty() {
            return Ok(0);
        }
        let released = self.store.release(self.agent, &shards).await?;
        self.held.lock().clear();
        metrics::gauge!("relay_leased_shards").set(0.0);
        Ok(released)
    }

    /// Release leases and remove the agent record.
    pub async fn unregister(&self) -> Result<()> {
        self.release_all().await?;
        self.store.unregister_agent(self.agent).await?;
        tracing::info!(agent = %self.agent, "Agent unregistered");
        Ok(())
    }

    /// Drop superseded leases from the local view. Returns the lost shards.
    async fn renew_held(&self) -> Result<Vec<ShardId>> {
        let grants: Vec<LeaseGrant> = self.held.lock().values().copied().collect();
        if grants.is_empty() {
            return Ok(Vec::new());
        }

        let result = self
            .store
            .renew(self.agent, &grants, self.config.lease_duration)
            .await?;

        let mut map = self.held.lock();
        for grant in &result.renewed {
            map.insert(grant.shard, *grant);
        }
        for shard in &result.lost {
            map.remove(shard);
        }
        drop(map);

        if !result.lost.is_empty() {
            metrics::counter!("relay_lease_lost_total").increment(result.lost.len() as u64);
            tracing::warn!(
                shards = ?result.lost.iter().map(|s| s.0).collect::<Vec<_>>(),
                "Shard leases lost"
            );
        }
        Ok(result.lost)
    }

    /// Shards this agent may hold right now.
    async fn target_shards(&self) -> Result<Vec<ShardId>> {
        let shard_count = self.config.shard_count;
        match &self.config.assignment {
            ShardAssignment::Static { shards } => Ok(shards
                .iter()
                .filter(|s| **s < shard_count)
                .map(|s| ShardId(*s))
                .collect()),
            ShardAssignment::Dynamic => {
                let now = self.clock.now();
                let live = self
                    .store
                    .agents()
                    .await?
                    .iter()
                    .filter(|a| a.is_alive(now))
                    .count()
                    .max(1) as u32;
                let share = (shard_count + live - 1) / live;
                let all = ShardId::all(shard_count);

                // Target is a share-sized window of whatever we already hold
                // first, then anything else.
                let held = self.held_shards();
                let mut ordered: Vec<ShardId> = held.clone();
                ordered.extend(all.into_iter().filter(|s| !held.contains(s)));
                ordered.truncate(share as usize);
                Ok(ordered)
            }
        }
    }

    /// Up to `need` target shards not held by anyone live.
    async fn candidates(&self, held: &[ShardId], target: &[ShardId], need: usize) -> Result<Vec<ShardId>> {
        let now = self.clock.now();
        let leases = self.store.leases().await?;
        let taken: Vec<ShardId> = leases
            .iter()
            .filter(|l| matches!(l.live_owner(now), Some(owner) if owner != self.agent))
            .map(|l| l.shard)
            .collect();

        let free: Vec<ShardId> = match &self.config.assignment {
            ShardAssignment::Static { .. } => target.to_vec(),
            ShardAssignment::Dynamic => ShardId::all(self.config.shard_count),
        }
        .into_iter()
        .filter(|s| !held.contains(s) && !taken.contains(s))
        .collect();

        if free.is_empty() {
            return Ok(free);
        }

        // Start at an agent-specific offset so agents joining together spread out.
        let offset = (self.agent.0.as_u128() % free.len() as u128) as usize;
        Ok(free
            .iter()
            .cycle()
            .skip(offset)
            .take(need.min(free.len()))
            .copied()
            .collect())
    }

    fn forget_all(&self) -> usize {
        let mut map = self.held.lock();
        let n = map.len();
        map.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lease::{Epoch, InMemoryLeaseStore};

    fn config(shard_count: u32) -> LeaseConfig {
        LeaseConfig {
            shard_count,
            lease_duration: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_failure_threshold: 3,
            assignment: ShardAssignment::Dynamic,
        }
    }

    #[tokio::test]
    async fn test_dynamic_assignment_splits_shards() {
        let clock = ManualClock::starting_now();
        let store: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new(clock.clone()));
        let a = LeaseManager::new("a", store.clone(), clock.clone(), config(8));
        let b = LeaseManager::new("b", store.clone(), clock.clone(), config(8));
        a.register().await.unwrap();
        b.register().await.unwrap();

        let fa = a.maintain().await.unwrap();
        let fb = b.maintain().await.unwrap();
        assert_eq!(fa.epochs.len(), 4);
        assert_eq!(fb.epochs.len(), 4);
        assert!(fa.shards().iter().all(|s| fb.epoch_for(*s).is_none()));
    }

    #[tokio::test]
    async fn test_remaining_agent_takes_over_after_unregister() {
        let clock = ManualClock::starting_now();
        let store: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new(clock.clone()));
        let a = LeaseManager::new("a", store.clone(), clock.clone(), config(4));
        let b = LeaseManager::new("b", store.clone(), clock.clone(), config(4));
        a.register().await.unwrap();
        b.register().await.unwrap();
        a.maintain().await.unwrap();
        let fb = b.maintain().await.unwrap();

        b.unregister().await.unwrap();
        let fa = a.maintain().await.unwrap();
        assert_eq!(fa.epochs.len(), 4);
        for shard in fb.shards() {
            assert_eq!(fa.epoch_for(shard), Some(Epoch(2)));
        }
    }

    #[tokio::test]
    async fn test_surplus_is_released_when_agents_join() {
        let clock = ManualClock::starting_now();
        let store: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new(clock.clone()));
        let a = LeaseManager::new("a", store.clone(), clock.clone(), config(6));
        a.register().await.unwrap();
        assert_eq!(a.maintain().await.unwrap().epochs.len(), 6);

        let b = LeaseManager::new("b", store.clone(), clock.clone(), config(6));
        b.register().await.unwrap();
        assert_eq!(b.maintain().await.unwrap().epochs.len(), 0);

        assert_eq!(a.maintain().await.unwrap().epochs.len(), 3);
        assert_eq!(b.maintain().await.unwrap().epochs.len(), 3);
    }

    #[tokio::test]
    async fn test_static_assignment_only_takes_listed_shards() {
        let clock = ManualClock::starting_now();
        let store: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new(clock.clone()));
        let mut cfg = config(8);
        cfg.assignment = ShardAssignment::Static { shards: vec![1, 5, 42] };
        let a = LeaseManager::new("a", store, clock, cfg);
        a.register().await.unwrap();
        let fence = a.maintain().await.unwrap();
        assert_eq!(fence.shards(), vec![ShardId(1), ShardId(5)]);
    }

    #[tokio::test]
    async fn test_maintain_drops_superseded_lease() {
        let clock = ManualClock::starting_now();
        let store: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new(clock.clone()));
        let mut cfg = config(1);
        cfg.assignment = ShardAssignment::Static { shards: vec![0] };
        let a = LeaseManager::new("a", store.clone(), clock.clone(), cfg.clone());
        let b = LeaseManager::new("b", store.clone(), clock.clone(), cfg);
        a.register().await.unwrap();
        a.maintain().await.unwrap();

        clock.advance(Duration::from_secs(31));
        b.register().await.unwrap();
        b.maintain().await.unwrap();

        let fence = a.maintain().await.unwrap();
        assert!(fence.is_empty());
        assert!(a.held_shards().is_empty());
    }

    #[tokio::test]
    async fn test_reaped_agent_registers_again_on_heartbeat() {
        let clock = ManualClock::starting_now();
        let store: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new(clock.clone()));
        let a = LeaseManager::new("a", store.clone(), clock.clone(), config(2));
        a.register().await.unwrap();
        a.maintain().await.unwrap();

        clock.advance(Duration::from_secs(16));
        assert_eq!(store.reap_dead_agents().await.unwrap(), vec![a.agent()]);

        a.heartbeat().await.unwrap();
        assert!(a.held_shards().is_empty());
        assert_eq!(store.agents().await.unwrap().len(), 1);
    }
}
