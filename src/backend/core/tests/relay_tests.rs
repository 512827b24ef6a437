//! End-to-end tests for the relay engine.
//!
//! Every test runs on the in-memory stores with a manually driven clock, so
//! lease expiry, visibility timeouts and retry delays are deterministic.

use std::sync::Arc;
use std::time::Duration;

use relay_core::clock::{Clock, ManualClock};
use relay_core::dispatch::{DispatchConfig, Dispatcher, IndexError, InMemoryIndex};
use relay_core::error::ErrorCode;
use relay_core::lease::{
    AgentId, Epoch, Fence, InMemoryLeaseStore, LeaseConfig, LeaseGrant, LeaseManager, LeaseStore,
    ShardId,
};
use relay_core::outbox::{EntityRef, EventStatus, InMemoryOutboxStore, NewEvent, OutboxStore};
use relay_core::prelude::{CycleOutcome, IndexAction};
use relay_core::retry::{BackoffStrategy, RetryPolicy};
use relay_core::scheduler::{PollConfig, RelayScheduler};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test Utilities
// ============================================================================

const SHARDS: u32 = 4;

struct Cluster {
    clock: Arc<ManualClock>,
    leases: Arc<InMemoryLeaseStore>,
    outbox: Arc<InMemoryOutboxStore>,
    index: Arc<InMemoryIndex>,
}

impl Cluster {
    fn new() -> Self {
        let clock = ManualClock::starting_now();
        let leases = Arc::new(InMemoryLeaseStore::new(clock.clone()));
        let outbox = Arc::new(InMemoryOutboxStore::new(SHARDS, leases.clone(), clock.clone()));
        Self {
            clock,
            leases,
            outbox,
            index: Arc::new(InMemoryIndex::default()),
        }
    }

    async fn agent(&self, name: &str, poll: PollConfig, policy: RetryPolicy) -> RelayScheduler {
        let manager = Arc::new(LeaseManager::new(
            name,
            self.leases.clone(),
            self.clock.clone(),
            LeaseConfig {
                shard_count: SHARDS,
                ..Default::default()
            },
        ));
        manager.register().await.unwrap();

        RelayScheduler::new(
            manager,
            self.outbox.clone(),
            Dispatcher::new(self.index.clone(), DispatchConfig::default(), self.clock.clone()),
            policy,
            poll,
            self.clock.clone(),
        )
    }

    async fn append_books(&self, count: usize) {
        for id in 0..count {
            self.outbox.append(NewEvent::add("Book", id.to_string())).await.unwrap();
        }
    }
}

fn book(id: &str) -> EntityRef {
    EntityRef::new("Book", id)
}

// ============================================================================
// Coalescing
// ============================================================================

#[tokio::test]
async fn test_add_update_delete_in_one_batch_is_a_no_op() {
    let cluster = Cluster::new();
    let agent = cluster.agent("a", PollConfig::default(), RetryPolicy::default()).await;

    cluster.outbox.append(NewEvent::add("Book", "42")).await.unwrap();
    cluster.outbox.append(NewEvent::update("Book", "42")).await.unwrap();
    cluster.outbox.append(NewEvent::delete("Book", "42")).await.unwrap();

    let report = agent.run_cycle().await;
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.claimed, 3);
    assert_eq!(report.operations, 0);
    assert_eq!(report.acknowledged, 3);

    assert!(cluster.index.applied().is_empty());
    assert!(cluster.outbox.snapshot().is_empty());
}

#[tokio::test]
async fn test_each_entity_is_written_once_per_batch() {
    let cluster = Cluster::new();
    let agent = cluster.agent("a", PollConfig::default(), RetryPolicy::default()).await;

    for _ in 0..5 {
        cluster.outbox.append(NewEvent::update("Book", "1")).await.unwrap();
    }
    cluster.outbox.append(NewEvent::add("Author", "7")).await.unwrap();
    cluster.outbox.append(NewEvent::delete("Author", "7")).await.unwrap();
    cluster.outbox.append(NewEvent::add("Author", "7")).await.unwrap();

    let report = agent.run_cycle().await;
    assert_eq!(report.claimed, 8);
    assert_eq!(report.operations, 2);
    assert_eq!(report.acknowledged, 8);

    let mut applied = cluster.index.applied();
    applied.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        applied,
        vec![
            (EntityRef::new("Author", "7"), IndexAction::Add),
            (book("1"), IndexAction::Update),
        ]
    );
}

// ============================================================================
// Leases and Fencing
// ============================================================================

#[tokio::test]
async fn test_expired_lease_is_taken_over_and_stale_ack_is_rejected() {
    let clock = ManualClock::starting_now();
    let leases = Arc::new(InMemoryLeaseStore::new(clock.clone()));
    let outbox = InMemoryOutboxStore::new(1, leases.clone(), clock.clone());
    let ttl = Duration::from_secs(3600);
    let lease_for = Duration::from_secs(30);
    let visibility = Duration::from_secs(60);

    let a = AgentId::new();
    let b = AgentId::new();
    leases.register_agent(a, "a", ttl).await.unwrap();
    leases.register_agent(b, "b", ttl).await.unwrap();

    let granted = leases.acquire(a, &[ShardId(0)], lease_for).await.unwrap();
    assert_eq!(granted.granted[0].epoch, Epoch(1));
    let fence_a = Fence::from_grants(a, &granted.granted);

    outbox.append(NewEvent::update("Book", "42")).await.unwrap();
    let batch = outbox.claim(&fence_a, 10, visibility).await.unwrap();
    assert_eq!(batch.len(), 1);

    // A stalls without renewing.
    clock.advance(Duration::from_secs(31));
    let taken = leases.acquire(b, &[ShardId(0)], Duration::from_secs(120)).await.unwrap();
    assert_eq!(taken.granted.len(), 1);
    assert_eq!(taken.granted[0].epoch, Epoch(2));
    let fence_b = Fence::from_grants(b, &taken.granted);

    let err = outbox.acknowledge(&fence_a, &batch.ids()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::LeaseLost);
    assert!(outbox.find(batch.events[0].id).await.unwrap().is_some());

    let stale = LeaseGrant {
        shard: ShardId(0),
        epoch: Epoch(1),
        expires_at: clock.now(),
    };
    let renewed = leases.renew(a, &[stale], lease_for).await.unwrap();
    assert_eq!(renewed.lost, vec![ShardId(0)]);

    // A's claim is still inside its visibility window.
    assert!(outbox.claim(&fence_b, 10, visibility).await.unwrap().is_empty());

    clock.advance(Duration::from_secs(30));
    assert_eq!(outbox.sweep_expired().await.unwrap(), 1);
    let reclaimed = outbox.claim(&fence_b, 10, visibility).await.unwrap();
    assert_eq!(reclaimed.ids(), batch.ids());
    assert_eq!(reclaimed.events[0].retry_count, 0);

    let report = outbox.acknowledge(&fence_b, &reclaimed.ids()).await.unwrap();
    assert_eq!(report.acknowledged, batch.ids());
}

#[tokio::test]
async fn test_stale_epoch_is_rejected_before_lease_expiry() {
    let clock = ManualClock::starting_now();
    let leases = Arc::new(InMemoryLeaseStore::new(clock.clone()));
    let outbox = InMemoryOutboxStore::new(1, leases.clone(), clock.clone());

    let a = AgentId::new();
    leases.register_agent(a, "a", Duration::from_secs(60)).await.unwrap();
    let first = leases.acquire(a, &[ShardId(0)], Duration::from_secs(30)).await.unwrap();
    let fence = Fence::from_grants(a, &first.granted);

    outbox.append(NewEvent::add("Book", "1")).await.unwrap();
    let batch = outbox.claim(&fence, 10, Duration::from_secs(60)).await.unwrap();

    // Release and re-acquire by someone else while A's lease would still run.
    leases.release(a, &[ShardId(0)]).await.unwrap();
    let b = AgentId::new();
    leases.register_agent(b, "b", Duration::from_secs(60)).await.unwrap();
    leases.acquire(b, &[ShardId(0)], Duration::from_secs(30)).await.unwrap();

    let err = outbox.acknowledge(&fence, &batch.ids()).await.unwrap_err();
    assert!(err.is_lease_lost());
}

#[tokio::test]
async fn test_two_agents_never_process_the_same_event() {
    let cluster = Cluster::new();
    let a = cluster.agent("a", PollConfig::default(), RetryPolicy::default()).await;
    let b = cluster.agent("b", PollConfig::default(), RetryPolicy::default()).await;
    cluster.append_books(40).await;

    let mut acknowledged = 0;
    for _ in 0..5 {
        let (ra, rb) = tokio::join!(a.run_cycle(), b.run_cycle());
        acknowledged += ra.acknowledged + rb.acknowledged;
    }

    assert_eq!(acknowledged, 40);
    assert_eq!(cluster.index.applied().len(), 40);
    assert_eq!(cluster.index.len(), 40);

    let shards_a = a.leases().held_shards();
    let shards_b = b.leases().held_shards();
    assert!(shards_a.iter().all(|s| !shards_b.contains(s)));
    assert_eq!(shards_a.len() + shards_b.len(), SHARDS as usize);
}

// ============================================================================
// Recovery and Ordering
// ============================================================================

#[tokio::test]
async fn test_crashed_agent_events_are_recovered_by_another_agent() {
    let cluster = Cluster::new();
    let crashed = LeaseManager::new(
        "crashed",
        cluster.leases.clone(),
        cluster.clock.clone(),
        LeaseConfig {
            shard_count: SHARDS,
            ..Default::default()
        },
    );
    crashed.register().await.unwrap();
    let fence = crashed.maintain().await.unwrap();
    assert_eq!(fence.shards().len(), SHARDS as usize);

    cluster.append_books(3).await;
    let batch = cluster
        .outbox
        .claim(&fence, 10, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(batch.len(), 3);

    // No heartbeat, no renewal, no acknowledgement.
    cluster.clock.advance(Duration::from_secs(61));

    let survivor = cluster.agent("survivor", PollConfig::default(), RetryPolicy::default()).await;
    let report = survivor.run_cycle().await;
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.claimed, 3);
    assert_eq!(report.acknowledged, 3);
    assert_eq!(cluster.index.len(), 3);

    let agents = cluster.leases.agents().await.unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].name, "survivor");
}

#[tokio::test]
async fn test_failed_entity_blocks_its_later_events_only() {
    let cluster = Cluster::new();
    let policy = RetryPolicy::default().with_backoff(BackoffStrategy::fixed(Duration::from_secs(5)));
    let agent = cluster.agent("a", PollConfig::default(), policy).await;

    cluster.outbox.append(NewEvent::add("Book", "1")).await.unwrap();
    cluster.index.inject_failures([IndexError::unavailable("index offline")]);
    let first = agent.run_cycle().await;
    assert_eq!(first.retried, 1);

    let failed = cluster.outbox.snapshot();
    assert_eq!(failed[0].status, EventStatus::Failed);
    assert_eq!(failed[0].retry_count, 1);
    assert!(failed[0].last_error.as_deref().unwrap_or("").contains("index offline"));

    cluster.outbox.append(NewEvent::update("Book", "1")).await.unwrap();
    cluster.outbox.append(NewEvent::add("Book", "2")).await.unwrap();

    let second = agent.run_cycle().await;
    assert_eq!(second.claimed, 1);
    assert_eq!(cluster.index.applied(), vec![(book("2"), IndexAction::Add)]);

    cluster.clock.advance(Duration::from_secs(5));
    let third = agent.run_cycle().await;
    assert_eq!(third.claimed, 2);
    assert_eq!(third.operations, 1);
    assert_eq!(third.acknowledged, 2);
    assert_eq!(
        cluster.index.applied(),
        vec![(book("2"), IndexAction::Add), (book("1"), IndexAction::Add)]
    );
    assert!(cluster.outbox.snapshot().is_empty());
}

#[tokio::test]
async fn test_rejected_document_is_dead_lettered_and_requeued() {
    let cluster = Cluster::new();
    let agent = cluster.agent("a", PollConfig::default(), RetryPolicy::default()).await;

    let id = cluster.outbox.append(NewEvent::update("Book", "bad")).await.unwrap();
    cluster.index.inject_failures([IndexError::malformed("mapping conflict")]);

    let report = agent.run_cycle().await;
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.retried, 0);

    let dead = cluster.outbox.list_dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, id);
    assert!(dead[0].error.contains("mapping conflict"));

    let new_id = cluster.outbox.requeue_dead_letter(id).await.unwrap();
    assert!(new_id > id);
    let report = agent.run_cycle().await;
    assert_eq!(report.acknowledged, 1);
    assert!(cluster.index.get(&book("bad")).is_some());
    assert_eq!(cluster.outbox.stats().await.unwrap().dead_lettered, 0);
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test]
async fn test_full_batch_shrinks_interval_and_empty_batch_grows_it() {
    let cluster = Cluster::new();
    let poll = PollConfig {
        batch_size: 500,
        min_interval: Duration::from_millis(100),
        max_interval: Duration::from_secs(10),
        ..Default::default()
    };
    let agent = cluster.agent("a", poll, RetryPolicy::default()).await;

    let idle = agent.run_cycle().await;
    assert_eq!(idle.outcome, CycleOutcome::Empty);
    assert_eq!(idle.next_interval, Duration::from_millis(200));

    cluster.append_books(1000).await;
    let full = agent.run_cycle().await;
    assert_eq!(full.claimed, 500);
    assert_eq!(full.next_interval, Duration::from_millis(100));

    let drained = agent.run_cycle().await;
    assert_eq!(drained.claimed, 500);
    assert_eq!(drained.next_interval, Duration::from_millis(100));

    let empty = agent.run_cycle().await;
    assert_eq!(empty.claimed, 0);
    assert_eq!(empty.next_interval, Duration::from_millis(200));
    assert!(agent.current_interval() > Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_run_drains_backlog_and_leaves_cleanly() {
    let cluster = Cluster::new();
    let agent = Arc::new(cluster.agent("a", PollConfig::default(), RetryPolicy::default()).await);
    cluster.append_books(25).await;

    let shutdown = CancellationToken::new();
    let task = tokio::spawn({
        let agent = agent.clone();
        let shutdown = shutdown.clone();
        async move { agent.run(shutdown).await }
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    shutdown.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(cluster.index.len(), 25);
    assert!(cluster.outbox.snapshot().is_empty());
    assert!(cluster.leases.agents().await.unwrap().is_empty());
    assert!(cluster
        .leases
        .leases()
        .await
        .unwrap()
        .iter()
        .all(|lease| lease.owner.is_none()));
}
