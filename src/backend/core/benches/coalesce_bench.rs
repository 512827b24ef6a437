//! Benchmarks for coalescing, shard hashing and a full in-memory cycle.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

use chrono::Utc;
use relay_core::clock::ManualClock;
use relay_core::coalesce::{coalesce_events, merge};
use relay_core::dispatch::{DispatchConfig, Dispatcher, InMemoryIndex};
use relay_core::lease::{InMemoryLeaseStore, LeaseConfig, LeaseManager, ShardId};
use relay_core::outbox::{
    EntityRef, EventId, EventStatus, InMemoryOutboxStore, NewEvent, OperationKind, OutboxEvent, OutboxStore,
};
use relay_core::retry::RetryPolicy;
use relay_core::scheduler::{PollConfig, RelayScheduler};

const KINDS: [OperationKind; 4] = [
    OperationKind::Add,
    OperationKind::Update,
    OperationKind::UpdateBecauseOfAssociatedDelete,
    OperationKind::Delete,
];

/// `size` events spread over `size / events_per_entity` entities.
fn batch(size: usize, events_per_entity: usize) -> Vec<OutboxEvent> {
    let entities = (size / events_per_entity.max(1)).max(1);
    (0..size)
        .map(|i| OutboxEvent {
            id: EventId(i as i64 + 1),
            shard: ShardId(0),
            entity: EntityRef::new("Book", (i % entities).to_string()),
            kind: KINDS[i % KINDS.len()],
            routing_key: None,
            created_at: Utc::now(),
            status: EventStatus::Claimed,
            retry_count: 0,
            not_before: None,
            claim: None,
            last_error: None,
        })
        .collect()
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    group.bench_function("fold_16", |b| {
        b.iter(|| {
            let mut state = None;
            for i in 0..16 {
                state = merge(state, black_box(KINDS[i % KINDS.len()]));
            }
            black_box(state)
        });
    });
    group.finish();
}

fn bench_coalesce(c: &mut Criterion) {
    let mut group = c.benchmark_group("coalesce");
    for size in [100, 500, 5_000] {
        for per_entity in [1, 4, 50] {
            let events = batch(size, per_entity);
            group.throughput(Throughput::Elements(size as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("per_entity_{}", per_entity), size),
                &events,
                |b, events| b.iter(|| black_box(coalesce_events(events))),
            );
        }
    }
    group.finish();
}

fn bench_shard_for_entity(c: &mut Criterion) {
    let mut group = c.benchmark_group("shard_for_entity");
    for shards in [1, 16, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(shards), &shards, |b, &n| {
            b.iter(|| black_box(ShardId::for_entity("Book", black_box("123456"), n)));
        });
    }
    group.finish();
}

fn bench_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("in_memory_cycle");
    let rt = tokio::runtime::Runtime::new().unwrap();
    for size in [100, 500] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &n| {
            let clock = ManualClock::starting_now();
            let leases = Arc::new(InMemoryLeaseStore::new(clock.clone()));
            let outbox = Arc::new(InMemoryOutboxStore::new(16, leases.clone(), clock.clone()));
            let manager = Arc::new(LeaseManager::new("bench", leases, clock.clone(), LeaseConfig::default()));
            let scheduler = RelayScheduler::new(
                manager.clone(),
                outbox.clone(),
                Dispatcher::new(Arc::new(InMemoryIndex::default()), DispatchConfig::default(), clock.clone()),
                RetryPolicy::default(),
                PollConfig { batch_size: n, ..Default::default() },
                clock.clone(),
            );
            rt.block_on(manager.register()).unwrap();

            b.iter(|| {
                rt.block_on(async {
                    for i in 0..n {
                        outbox.append(NewEvent::update("Book", (i % 50).to_string())).await.unwrap();
                    }
                    black_box(scheduler.run_cycle().await)
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_merge, bench_coalesce, bench_shard_for_entity, bench_cycle);
criterion_main!(benches);
