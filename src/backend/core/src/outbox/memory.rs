//! In-memory outbox.
//!
//! Mirrors the PostgreSQL store's semantics under a single mutex. Fencing is
//! checked against a [`LeaseView`] of the same process's lease table.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    validate_claim, AckReport, Batch, ClaimInfo, DeadLetterEntry, DeadLetterRecord, EntityRef,
    EventId, EventStatus, NewEvent, OutboxEvent, OutboxStats, OutboxStore,
};
use crate::clock::{to_chrono, SharedClock};
use crate::error::{RelayError, Result};
use crate::lease::{Fence, LeaseView, ShardId};

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    events: BTreeMap<EventId, OutboxEvent>,
    dead_letters: BTreeMap<EventId, DeadLetterRecord>,
}

impl State {
    fn insert(&mut self, event: NewEvent, shard: ShardId, now: chrono::DateTime<chrono::Utc>) -> EventId {
        self.next_id += 1;
        let id = EventId(self.next_id);
        self.events.insert(
            id,
            OutboxEvent {
                id,
                shard,
                entity: event.entity,
                kind: event.kind,
                routing_key: event.routing_key,
                created_at: now,
                status: EventStatus::Pending,
                retry_count: 0,
                not_before: None,
                claim: None,
                last_error: None,
            },
        );
        id
    }
}

/// Outbox held in process memory.
pub struct InMemoryOutboxStore {
    state: Mutex<State>,
    leases: Arc<dyn LeaseView>,
    clock: SharedClock,
    shard_count: u32,
}

impl InMemoryOutboxStore {
    pub fn new(shard_count: u32, leases: Arc<dyn LeaseView>, clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(State::default()),
            leases,
            clock,
            shard_count: shard_count.max(1),
        }
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Every event still in the log, in sequence order.
    pub fn snapshot(&self) -> Vec<OutboxEvent> {
        self.state.lock().events.values().cloned().collect()
    }

    fn holds(&self, fence: &Fence, shard: ShardId) -> bool {
        match (fence.epoch_for(shard), self.leases.lease_of(shard)) {
            (Some(epoch), Some(lease)) => lease.is_held_by(fence.agent, epoch),
            _ => false,
        }
    }

    fn return_events(
        &self,
        fence: &Fence,
        ids: &[EventId],
        retry_after: Option<Duration>,
        error: Option<&str>,
        count_attempt: bool,
    ) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut returned = 0;
        for id in ids {
            let Some(event) = state.events.get_mut(id) else { continue };
            if !event.is_claimed_under(fence) {
                continue;
            }
            event.claim = None;
            match retry_after {
                Some(delay) => {
                    event.status = EventStatus::Failed;
                    event.not_before = Some(now + to_chrono(delay));
                }
                None => {
                    event.status = EventStatus::Pending;
                    event.not_before = None;
                }
            }
            if count_attempt {
                event.retry_count += 1;
            }
            if let Some(error) = error {
                event.last_error = Some(error.to_string());
            }
            returned += 1;
        }
        returned
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn append(&self, event: NewEvent) -> Result<EventId> {
        event.validate()?;
        let shard = event.entity.shard(self.shard_count);
        let now = self.clock.now();
        Ok(self.state.lock().insert(event, shard, now))
    }

    async fn claim(&self, fence: &Fence, max_batch_size: usize, visibility_timeout: Duration) -> Result<Batch> {
        validate_claim(fence, max_batch_size)?;
        let now = self.clock.now();
        let expires_at = now + to_chrono(visibility_timeout);

        let live: HashSet<ShardId> = fence
            .epochs
            .iter()
            .filter(|(shard, epoch)| {
                self.leases
                    .lease_of(**shard)
                    .map_or(false, |l| l.is_live_for(fence.agent, **epoch, now))
            })
            .map(|(shard, _)| *shard)
            .collect();

        let mut batch = Batch::empty(fence.agent);
        if live.is_empty() {
            return Ok(batch);
        }

        let mut state = self.state.lock();
        let mut blocked: HashSet<EntityRef> = HashSet::new();
        for event in state.events.values_mut() {
            if batch.len() >= max_batch_size {
                break;
            }
            if !live.contains(&event.shard) || blocked.contains(&event.entity) {
                continue;
            }
            if !event.is_claimable(now) {
                blocked.insert(event.entity.clone());
                continue;
            }
            let Some(epoch) = fence.epoch_for(event.shard) else { continue };
            event.status = EventStatus::Claimed;
            event.claim = Some(ClaimInfo {
                agent: fence.agent,
                epoch,
                expires_at,
            });
            batch.events.push(event.clone());
        }
        Ok(batch)
    }

    async fn mark_processing(&self, fence: &Fence, ids: &[EventId]) -> Result<usize> {
        let mut state = self.state.lock();
        let mut marked = 0;
        for id in ids {
            if let Some(event) = state.events.get_mut(id) {
                if event.status == EventStatus::Claimed && event.is_claimed_under(fence) {
                    event.status = EventStatus::Processing;
                    marked += 1;
                }
            }
        }
        Ok(marked)
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut swept = 0;
        for event in state.events.values_mut() {
            if event.is_claim_expired(now) {
                event.status = EventStatus::Pending;
                event.claim = None;
                swept += 1;
            }
        }
        Ok(swept)
    }

    async fn acknowledge(&self, fence: &Fence, ids: &[EventId]) -> Result<AckReport> {
        let mut state = self.state.lock();

        for id in ids {
            if let Some(event) = state.events.get(id) {
                let context = format!("acknowledge of event {} by agent {}", id, fence.agent);
                if fence.epoch_for(event.shard).is_none() {
                    return Err(RelayError::shard_not_owned(event.shard, context));
                }
                if !self.holds(fence, event.shard) {
                    return Err(RelayError::lease_lost(event.shard, context));
                }
            }
        }

        let mut report = AckReport::default();
        for id in ids {
            match state.events.get(id) {
                None => report.missing.push(*id),
                Some(event) if event.is_claimed_under(fence) => {
                    state.events.remove(id);
                    report.acknowledged.push(*id);
                }
                Some(_) => report.not_owned.push(*id),
            }
        }
        Ok(report)
    }

    async fn release(
        &self,
        fence: &Fence,
        ids: &[EventId],
        retry_after: Option<Duration>,
        error: Option<&str>,
    ) -> Result<usize> {
        Ok(self.return_events(fence, ids, retry_after, error, true))
    }

    async fn hand_back(&self, fence: &Fence, ids: &[EventId], retry_after: Option<Duration>) -> Result<usize> {
        Ok(self.return_events(fence, ids, retry_after, None, false))
    }

    async fn dead_letter(&self, fence: &Fence, entries: &[DeadLetterEntry]) -> Result<usize> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut moved = 0;
        for entry in entries {
            let owned = state
                .events
                .get(&entry.id)
                .map_or(false, |e| e.is_claimed_under(fence));
            if !owned {
                continue;
            }
            if let Some(event) = state.events.remove(&entry.id) {
                state.dead_letters.insert(
                    event.id,
                    DeadLetterRecord {
                        id: event.id,
                        shard: event.shard,
                        entity: event.entity,
                        kind: event.kind,
                        routing_key: event.routing_key,
                        created_at: event.created_at,
                        retry_count: event.retry_count,
                        reason: entry.reason,
                        error: entry.error.clone(),
                        dead_lettered_at: now,
                    },
                );
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn find(&self, id: EventId) -> Result<Option<OutboxEvent>> {
        Ok(self.state.lock().events.get(&id).cloned())
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        Ok(self
            .state
            .lock()
            .dead_letters
            .values()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn requeue_dead_letter(&self, id: EventId) -> Result<EventId> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let record = state
            .dead_letters
            .remove(&id)
            .ok_or_else(|| RelayError::not_found("DeadLetter", id.to_string()))?;
        let shard = record.entity.shard(self.shard_count);
        let event = NewEvent {
            entity: record.entity,
            kind: record.kind,
            routing_key: record.routing_key,
        };
        Ok(state.insert(event, shard, now))
    }

    async fn discard_dead_letter(&self, id: EventId) -> Result<()> {
        self.state
            .lock()
            .dead_letters
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| RelayError::not_found("DeadLetter", id.to_string()))
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let state = self.state.lock();
        let mut stats = OutboxStats {
            dead_lettered: state.dead_letters.len() as u64,
            ..Default::default()
        };
        for event in state.events.values() {
            match event.status {
                EventStatus::Pending => {
                    stats.pending += 1;
                    if stats.oldest_pending_at.map_or(true, |t| event.created_at < t) {
                        stats.oldest_pending_at = Some(event.created_at);
                    }
                }
                EventStatus::Claimed => stats.claimed += 1,
                EventStatus::Processing => stats.processing += 1,
                EventStatus::Failed => stats.failed += 1,
                EventStatus::Done => {}
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorCode;
    use crate::lease::{AgentId, Epoch, InMemoryLeaseStore, LeaseStore};
    use crate::outbox::{DeadLetterReason, OperationKind};

    const VISIBILITY: Duration = Duration::from_secs(60);

    struct Fixture {
        clock: Arc<ManualClock>,
        leases: Arc<InMemoryLeaseStore>,
        outbox: InMemoryOutboxStore,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::starting_now();
        let leases = Arc::new(InMemoryLeaseStore::new(clock.clone()));
        let outbox = InMemoryOutboxStore::new(1, leases.clone(), clock.clone());
        Fixture { clock, leases, outbox }
    }

    async fn lease_all(f: &Fixture) -> Fence {
        let agent = AgentId::new();
        f.leases.register_agent(agent, "test", Duration::from_secs(60)).await.unwrap();
        let result = f.leases.acquire(agent, &[ShardId(0)], Duration::from_secs(30)).await.unwrap();
        Fence::from_grants(agent, &result.granted)
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_ids() {
        let f = fixture();
        let a = f.outbox.append(NewEvent::add("Book", "1")).await.unwrap();
        let b = f.outbox.append(NewEvent::update("Book", "1")).await.unwrap();
        assert!(b > a);
        assert!(f.outbox.append(NewEvent::add("", "1")).await.is_err());
    }

    #[tokio::test]
    async fn test_claim_returns_events_in_order_and_marks_claimed() {
        let f = fixture();
        for i in 0..5 {
            f.outbox.append(NewEvent::add("Book", i.to_string())).await.unwrap();
        }
        let fence = lease_all(&f).await;
        let batch = f.outbox.claim(&fence, 3, VISIBILITY).await.unwrap();
        assert_eq!(batch.ids(), vec![EventId(1), EventId(2), EventId(3)]);
        assert!(batch.events.iter().all(|e| e.status == EventStatus::Claimed));

        let rest = f.outbox.claim(&fence, 10, VISIBILITY).await.unwrap();
        assert_eq!(rest.ids(), vec![EventId(4), EventId(5)]);
    }

    #[tokio::test]
    async fn test_delayed_event_blocks_later_events_of_same_entity() {
        let f = fixture();
        f.outbox.append(NewEvent::update("Book", "1")).await.unwrap();
        let fence = lease_all(&f).await;
        let first = f.outbox.claim(&fence, 10, VISIBILITY).await.unwrap();
        f.outbox
            .release(&fence, &first.ids(), Some(Duration::from_secs(10)), Some("timeout"))
            .await
            .unwrap();

        f.outbox.append(NewEvent::update("Book", "1")).await.unwrap();
        f.outbox.append(NewEvent::update("Book", "2")).await.unwrap();

        let batch = f.outbox.claim(&fence, 10, VISIBILITY).await.unwrap();
        assert_eq!(batch.ids(), vec![EventId(3)]);

        f.clock.advance(Duration::from_secs(10));
        let batch = f.outbox.claim(&fence, 10, VISIBILITY).await.unwrap();
        assert_eq!(batch.ids(), vec![EventId(1), EventId(2)]);
        assert_eq!(batch.events[0].retry_count, 1);
        assert_eq!(batch.events[0].last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_sweep_returns_expired_claims_without_counting_attempt() {
        let f = fixture();
        f.outbox.append(NewEvent::add("Book", "1")).await.unwrap();
        let fence = lease_all(&f).await;
        f.outbox.claim(&fence, 10, VISIBILITY).await.unwrap();

        assert_eq!(f.outbox.sweep_expired().await.unwrap(), 0);
        f.clock.advance(VISIBILITY);
        assert_eq!(f.outbox.sweep_expired().await.unwrap(), 1);

        let event = f.outbox.find(EventId(1)).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.retry_count, 0);
    }

    #[tokio::test]
    async fn test_acknowledge_is_idempotent() {
        let f = fixture();
        f.outbox.append(NewEvent::add("Book", "1")).await.unwrap();
        let fence = lease_all(&f).await;
        let batch = f.outbox.claim(&fence, 10, VISIBILITY).await.unwrap();

        let first = f.outbox.acknowledge(&fence, &batch.ids()).await.unwrap();
        assert_eq!(first.acknowledged, vec![EventId(1)]);
        let second = f.outbox.acknowledge(&fence, &batch.ids()).await.unwrap();
        assert!(second.acknowledged.is_empty());
        assert_eq!(second.missing, vec![EventId(1)]);
    }

    #[tokio::test]
    async fn test_acknowledge_under_stale_epoch_is_rejected() {
        let f = fixture();
        f.outbox.append(NewEvent::add("Book", "1")).await.unwrap();
        let fence = lease_all(&f).await;
        let batch = f.outbox.claim(&fence, 10, VISIBILITY).await.unwrap();

        f.clock.advance(Duration::from_secs(31));
        let other = AgentId::new();
        f.leases.register_agent(other, "other", Duration::from_secs(60)).await.unwrap();
        f.leases.acquire(other, &[ShardId(0)], Duration::from_secs(30)).await.unwrap();

        let err = f.outbox.acknowledge(&fence, &batch.ids()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::LeaseLost);
        assert!(f.outbox.find(EventId(1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_acknowledge_outside_fence_is_not_owned() {
        let f = fixture();
        f.outbox.append(NewEvent::add("Book", "1")).await.unwrap();
        let fence = lease_all(&f).await;
        let batch = f.outbox.claim(&fence, 10, VISIBILITY).await.unwrap();

        let elsewhere = Fence::new(fence.agent).with_shard(ShardId(7), Epoch(1));
        let err = f.outbox.acknowledge(&elsewhere, &batch.ids()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ShardNotOwned);
        assert!(err.is_systemic());
        assert!(f.outbox.find(EventId(1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dead_letter_and_requeue() {
        let f = fixture();
        f.outbox.append(NewEvent::new("Book", "1", OperationKind::Update)).await.unwrap();
        let fence = lease_all(&f).await;
        f.outbox.claim(&fence, 10, VISIBILITY).await.unwrap();

        let moved = f
            .outbox
            .dead_letter(
                &fence,
                &[DeadLetterEntry {
                    id: EventId(1),
                    reason: DeadLetterReason::Validation,
                    error: "mapping failed".into(),
                }],
            )
            .await
            .unwrap();
        assert_eq!(moved, 1);
        assert!(f.outbox.find(EventId(1)).await.unwrap().is_none());

        let stats = f.outbox.stats().await.unwrap();
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.pending, 0);

        let requeued = f.outbox.requeue_dead_letter(EventId(1)).await.unwrap();
        assert_eq!(requeued, EventId(2));
        assert!(f.outbox.list_dead_letters(10).await.unwrap().is_empty());
        assert!(f.outbox.discard_dead_letter(EventId(1)).await.is_err());
    }
}
