//! In-memory lease store.
//!
//! Single-process only: suitable for tests, the embedded demo mode, and as the
//! fencing source of [`InMemoryOutboxStore`](crate::outbox::InMemoryOutboxStore).
//! Every operation runs under one mutex, which gives the per-shard
//! compare-and-swap semantics the [`LeaseStore`] contract requires.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    AgentId, AgentRecord, LeaseGrant, LeaseResult, LeaseStore, LeaseView, RenewResult, ShardId,
    ShardLease,
};
use crate::clock::{to_chrono, SharedClock};
use crate::error::{ErrorCode, RelayError, Result};

#[derive(Debug, Default)]
struct State {
    agents: HashMap<AgentId, AgentRecord>,
    leases: BTreeMap<ShardId, ShardLease>,
}

impl State {
    fn forfeit_all(&mut self, agent: AgentId) -> usize {
        let mut released = 0;
        for lease in self.leases.values_mut() {
            if lease.owner == Some(agent) {
                lease.owner = None;
                lease.expires_at = None;
                released += 1;
            }
        }
        released
    }
}

/// Lease table and agent registry held in process memory.
pub struct InMemoryLeaseStore {
    state: Mutex<State>,
    clock: SharedClock,
}

impl InMemoryLeaseStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }
}

impl LeaseView for InMemoryLeaseStore {
    fn lease_of(&self, shard: ShardId) -> Option<ShardLease> {
        self.state.lock().leases.get(&shard).cloned()
    }
}

fn not_registered(agent: AgentId) -> RelayError {
    RelayError::new(
        ErrorCode::AgentNotRegistered,
        format!("Agent {} is not registered", agent),
    )
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn register_agent(&self, agent: AgentId, name: &str, ttl: Duration) -> Result<AgentRecord> {
        let now = self.clock.now();
        let record = AgentRecord {
            id: agent,
            name: name.to_string(),
            registered_at: now,
            last_heartbeat: now,
            expires_at: now + to_chrono(ttl),
        };
        self.state.lock().agents.insert(agent, record.clone());
        Ok(record)
    }

    async fn heartbeat(&self, agent: AgentId, ttl: Duration) -> Result<AgentRecord> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let record = state.agents.get_mut(&agent).ok_or_else(|| not_registered(agent))?;
        record.last_heartbeat = now;
        record.expires_at = now + to_chrono(ttl);
        Ok(record.clone())
    }

    async fn unregister_agent(&self, agent: AgentId) -> Result<()> {
        let mut state = self.state.lock();
        state.agents.remove(&agent);
        state.forfeit_all(agent);
        Ok(())
    }

    async fn reap_dead_agents(&self) -> Result<Vec<AgentId>> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let dead: Vec<AgentId> = state
            .agents
            .values()
            .filter(|a| !a.is_alive(now))
            .map(|a| a.id)
            .collect();
        for agent in &dead {
            state.agents.remove(agent);
            state.forfeit_all(*agent);
        }
        Ok(dead)
    }

    async fn agents(&self) -> Result<Vec<AgentRecord>> {
        let mut agents: Vec<AgentRecord> = self.state.lock().agents.values().cloned().collect();
        agents.sort_by_key(|a| a.registered_at);
        Ok(agents)
    }

    async fn acquire(&self, agent: AgentId, shards: &[ShardId], duration: Duration) -> Result<LeaseResult> {
        let now = self.clock.now();
        let expires_at = now + to_chrono(duration);
        let mut state = self.state.lock();
        if !state.agents.contains_key(&agent) {
            return Err(not_registered(agent));
        }

        let mut result = LeaseResult::default();
        for &shard in shards {
            let lease = state
                .leases
                .entry(shard)
                .or_insert_with(|| ShardLease::unleased(shard));

            match lease.live_owner(now) {
                Some(owner) if owner != agent => {
                    result.denied.push(shard);
                    continue;
                }
                _ => {}
            }

            if lease.owner != Some(agent) {
                lease.epoch = lease.epoch.next();
                lease.owner = Some(agent);
            }
            lease.expires_at = Some(expires_at);
            result.granted.push(LeaseGrant {
                shard,
                epoch: lease.epoch,
                expires_at,
            });
        }
        Ok(result)
    }

    async fn renew(&self, agent: AgentId, grants: &[LeaseGrant], duration: Duration) -> Result<RenewResult> {
        let now = self.clock.now();
        let expires_at = now + to_chrono(duration);
        let mut state = self.state.lock();

        let mut result = RenewResult::default();
        for grant in grants {
            match state.leases.get_mut(&grant.shard) {
                Some(lease) if lease.is_held_by(agent, grant.epoch) => {
                    lease.expires_at = Some(expires_at);
                    result.renewed.push(LeaseGrant {
                        shard: grant.shard,
                        epoch: lease.epoch,
                        expires_at,
                    });
                }
                _ => result.lost.push(grant.shard),
            }
        }
        Ok(result)
    }

    async fn release(&self, agent: AgentId, shards: &[ShardId]) -> Result<usize> {
        let mut state = self.state.lock();
        let mut released = 0;
        for shard in shards {
            if let Some(lease) = state.leases.get_mut(shard) {
                if lease.owner == Some(agent) {
                    lease.owner = None;
                    lease.expires_at = None;
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    async fn leases(&self) -> Result<Vec<ShardLease>> {
        Ok(self.state.lock().leases.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lease::Epoch;
    use std::sync::Arc;

    const LEASE: Duration = Duration::from_secs(30);
    const TTL: Duration = Duration::from_secs(60);

    async fn store_with_agents(n: usize) -> (Arc<ManualClock>, InMemoryLeaseStore, Vec<AgentId>) {
        let clock = ManualClock::starting_now();
        let store = InMemoryLeaseStore::new(clock.clone());
        let mut agents = Vec::new();
        for i in 0..n {
            let agent = AgentId::new();
            store.register_agent(agent, &format!("agent-{}", i), TTL).await.unwrap();
            agents.push(agent);
        }
        (clock, store, agents)
    }

    #[tokio::test]
    async fn test_first_grant_starts_at_epoch_one() {
        let (_clock, store, agents) = store_with_agents(1).await;
        let result = store.acquire(agents[0], &[ShardId(0), ShardId(1)], LEASE).await.unwrap();
        assert_eq!(result.granted.len(), 2);
        assert!(result.denied.is_empty());
        assert!(result.granted.iter().all(|g| g.epoch == Epoch(1)));
    }

    #[tokio::test]
    async fn test_live_lease_is_not_preempted() {
        let (clock, store, agents) = store_with_agents(2).await;
        store.acquire(agents[0], &[ShardId(0)], LEASE).await.unwrap();

        clock.advance(Duration::from_secs(29));
        let contender = store.acquire(agents[1], &[ShardId(0)], LEASE).await.unwrap();
        assert!(contender.granted.is_empty());
        assert_eq!(contender.denied, vec![ShardId(0)]);
    }

    #[tokio::test]
    async fn test_expired_lease_moves_to_new_owner_with_next_epoch() {
        let (clock, store, agents) = store_with_agents(2).await;
        let first = store.acquire(agents[0], &[ShardId(0)], LEASE).await.unwrap();

        clock.advance(Duration::from_secs(31));
        let second = store.acquire(agents[1], &[ShardId(0)], LEASE).await.unwrap();
        assert_eq!(second.granted.len(), 1);
        assert_eq!(second.granted[0].epoch, first.granted[0].epoch.next());

        let renewal = store.renew(agents[0], &first.granted, LEASE).await.unwrap();
        assert_eq!(renewal.lost, vec![ShardId(0)]);
        assert!(renewal.renewed.is_empty());
    }

    #[tokio::test]
    async fn test_reacquire_by_owner_keeps_epoch() {
        let (clock, store, agents) = store_with_agents(1).await;
        let first = store.acquire(agents[0], &[ShardId(4)], LEASE).await.unwrap();
        clock.advance(Duration::from_secs(45));
        let again = store.acquire(agents[0], &[ShardId(4)], LEASE).await.unwrap();
        assert_eq!(again.granted[0].epoch, first.granted[0].epoch);
    }

    #[tokio::test]
    async fn test_renew_after_expiry_without_takeover_succeeds() {
        let (clock, store, agents) = store_with_agents(1).await;
        let first = store.acquire(agents[0], &[ShardId(0)], LEASE).await.unwrap();
        clock.advance(Duration::from_secs(40));
        let renewal = store.renew(agents[0], &first.granted, LEASE).await.unwrap();
        assert_eq!(renewal.renewed.len(), 1);
        assert!(renewal.lost.is_empty());
    }

    #[tokio::test]
    async fn test_release_keeps_epoch_and_next_owner_increments() {
        let (_clock, store, agents) = store_with_agents(2).await;
        store.acquire(agents[0], &[ShardId(0)], LEASE).await.unwrap();
        assert_eq!(store.release(agents[0], &[ShardId(0)]).await.unwrap(), 1);

        let lease = store.lease_of(ShardId(0)).unwrap();
        assert_eq!(lease.owner, None);
        assert_eq!(lease.epoch, Epoch(1));

        let taken = store.acquire(agents[1], &[ShardId(0)], LEASE).await.unwrap();
        assert_eq!(taken.granted[0].epoch, Epoch(2));
    }

    #[tokio::test]
    async fn test_reaping_dead_agent_frees_its_shards() {
        let (clock, store, agents) = store_with_agents(2).await;
        store.acquire(agents[0], &[ShardId(0), ShardId(1)], LEASE).await.unwrap();

        // agent 1 keeps heartbeating, agent 0 goes silent
        clock.advance(Duration::from_secs(40));
        store.heartbeat(agents[1], TTL).await.unwrap();
        clock.advance(Duration::from_secs(25));

        let reaped = store.reap_dead_agents().await.unwrap();
        assert_eq!(reaped, vec![agents[0]]);
        assert!(store.heartbeat(agents[0], TTL).await.is_err());

        let taken = store.acquire(agents[1], &[ShardId(0), ShardId(1)], LEASE).await.unwrap();
        assert_eq!(taken.granted.len(), 2);
    }

    #[tokio::test]
    async fn test_unregistered_agent_cannot_acquire() {
        let clock = ManualClock::starting_now();
        let store = InMemoryLeaseStore::new(clock);
        let err = store.acquire(AgentId::new(), &[ShardId(0)], LEASE).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AgentNotRegistered);
    }
}
