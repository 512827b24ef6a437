//! Health checkers for the relay components.
//!
//! - **event_log**: the outbox answers and its backlog is not too old
//! - **leases**: the agent is registered, heartbeating and holds shards
//! - **scheduler**: cycles keep completing
//! - **index**: the index backend answers and its breaker is closed

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use super::check::{ComponentHealth, HealthStatus};
use crate::clock::{to_chrono, SharedClock};
use crate::dispatch::CircuitState;
use crate::lease::LeaseManager;
use crate::outbox::OutboxStore;
use crate::scheduler::{CycleOutcome, RelayScheduler};

/// Trait for health checkers.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// The component name.
    fn name(&self) -> &str;

    /// Perform a health check.
    async fn check(&self) -> ComponentHealth;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Event Log
// ═══════════════════════════════════════════════════════════════════════════════

/// Reports outbox counts; degraded when the oldest pending event is older
/// than `max_backlog_age`.
pub struct EventLogHealthChecker {
    outbox: Arc<dyn OutboxStore>,
    clock: SharedClock,
    max_backlog_age: Duration,
}

impl EventLogHealthChecker {
    pub fn new(outbox: Arc<dyn OutboxStore>, clock: SharedClock) -> Self {
        Self {
            outbox,
            clock,
            max_backlog_age: Duration::from_secs(300),
        }
    }

    pub fn with_max_backlog_age(mut self, max_backlog_age: Duration) -> Self {
        self.max_backlog_age = max_backlog_age;
        self
    }
}

#[async_trait]
impl HealthChecker for EventLogHealthChecker {
    fn name(&self) -> &str {
        "event_log"
    }

    async fn check(&self) -> ComponentHealth {
        let start = Instant::now();
        let stats = match self.outbox.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "Event log health check failed");
                return ComponentHealth::unhealthy(self.name())
                    .with_error(e.to_string())
                    .with_latency(start.elapsed());
            }
        };

        let mut health = ComponentHealth::healthy(self.name())
            .with_latency(start.elapsed())
            .with_metadata("pending", stats.pending)
            .with_metadata("in_flight", stats.claimed + stats.processing)
            .with_metadata("failed", stats.failed)
            .with_metadata("dead_lettered", stats.dead_lettered);

        if let Some(oldest) = stats.oldest_pending_at {
            let age = self.clock.now() - oldest;
            health = health.with_metadata("oldest_pending_secs", age.num_seconds());
            if age > to_chrono(self.max_backlog_age) {
                health.status = HealthStatus::Degraded;
                health.message = Some(format!("Oldest pending event is {}s old", age.num_seconds()));
            }
        }
        health
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Leases
// ═══════════════════════════════════════════════════════════════════════════════

pub struct LeaseHealthChecker {
    leases: Arc<LeaseManager>,
    clock: SharedClock,
}

impl LeaseHealthChecker {
    pub fn new(leases: Arc<LeaseManager>, clock: SharedClock) -> Self {
        Self { leases, clock }
    }
}

#[async_trait]
impl HealthChecker for LeaseHealthChecker {
    fn name(&self) -> &str {
        "leases"
    }

    async fn check(&self) -> ComponentHealth {
        let start = Instant::now();
        if self.leases.is_dead() {
            return ComponentHealth::unhealthy(self.name())
                .with_error("Heartbeat failure threshold reached");
        }

        let agents = match self.leases.store().agents().await {
            Ok(agents) => agents,
            Err(e) => {
                return ComponentHealth::unhealthy(self.name())
                    .with_error(e.to_string())
                    .with_latency(start.elapsed());
            }
        };
        let now = self.clock.now();
        let live_agents = agents.iter().filter(|a| a.is_alive(now)).count();
        let held = self.leases.held_shards();

        let health = ComponentHealth::healthy(self.name())
            .with_latency(start.elapsed())
            .with_metadata("agent", self.leases.agent().to_string())
            .with_metadata("held_shards", held.iter().map(|s| s.0).collect::<Vec<_>>())
            .with_metadata("live_agents", live_agents)
            .with_metadata("shard_count", self.leases.config().shard_count);

        if held.is_empty() {
            ComponentHealth {
                status: HealthStatus::Degraded,
                message: Some("No shard leases held".to_string()),
                ..health
            }
        } else {
            health
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

/// Unhealthy once no cycle has started within `stall_after`.
pub struct SchedulerHealthChecker {
    scheduler: Arc<RelayScheduler>,
    clock: SharedClock,
    stall_after: Duration,
}

impl SchedulerHealthChecker {
    pub fn new(scheduler: Arc<RelayScheduler>, clock: SharedClock) -> Self {
        let config = scheduler.config();
        let stall_after = config.max_interval + config.visibility_timeout;
        Self {
            scheduler,
            clock,
            stall_after,
        }
    }
}

#[async_trait]
impl HealthChecker for SchedulerHealthChecker {
    fn name(&self) -> &str {
        "scheduler"
    }

    async fn check(&self) -> ComponentHealth {
        let Some(report) = self.scheduler.last_report() else {
            return ComponentHealth::degraded(self.name()).with_message("No cycle has run yet");
        };

        let age = self.clock.now() - report.started_at;
        let health = ComponentHealth::healthy(self.name())
            .with_metadata("phase", self.scheduler.phase())
            .with_metadata("last_outcome", report.outcome)
            .with_metadata("last_cycle_secs_ago", age.num_seconds())
            .with_metadata("poll_interval_ms", self.scheduler.current_interval().as_millis() as u64)
            .with_metadata("totals", self.scheduler.stats());

        if age > to_chrono(self.stall_after) {
            return health.with_error(format!("No cycle for {}s", age.num_seconds()));
        }
        if report.outcome == CycleOutcome::Escalated {
            return ComponentHealth {
                status: HealthStatus::Degraded,
                message: report.error.clone(),
                ..health
            };
        }
        health
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Index
// ═══════════════════════════════════════════════════════════════════════════════

pub struct IndexHealthChecker {
    scheduler: Arc<RelayScheduler>,
}

impl IndexHealthChecker {
    pub fn new(scheduler: Arc<RelayScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl HealthChecker for IndexHealthChecker {
    fn name(&self) -> &str {
        "index"
    }

    async fn check(&self) -> ComponentHealth {
        let start = Instant::now();
        let dispatcher = self.scheduler.dispatcher();
        let writer = dispatcher.writer();
        let breaker = dispatcher.breaker().metrics();

        if !writer.health_check().await {
            return ComponentHealth::unhealthy(self.name())
                .with_error(format!("Index backend {} is not responding", writer.name()))
                .with_latency(start.elapsed());
        }

        let health = ComponentHealth::healthy(self.name())
            .with_latency(start.elapsed())
            .with_metadata("backend", writer.name())
            .with_metadata("breaker", &breaker);

        if breaker.state == CircuitState::Closed {
            health
        } else {
            ComponentHealth {
                status: HealthStatus::Degraded,
                message: Some(format!("Circuit breaker {:?}", breaker.state)),
                ..health
            }
        }
    }
}
