//! Polling scheduler.
//!
//! Each cycle walks the phases
//!
//! ```text
//! Idle -> Leasing -> Fetching -> Coalescing -> Dispatching -> Settling -> Idle
//! ```
//!
//! and falls back to `Idle` early when no shard is leased, the batch is empty,
//! shutdown was requested, or a systemic error escalates. On escalation every
//! event of the batch the agent still holds is handed back without consuming a
//! retry, and nothing more is acknowledged in that cycle. Operations the
//! breaker short-circuited are handed back the same way, delayed until the
//! breaker's cooldown runs out.

pub mod interval;

pub use interval::PollInterval;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{to_chrono, SharedClock};
use crate::coalesce::{coalesce, Coalesced};
use crate::dispatch::{Dispatcher, OperationOutcome};
use crate::error::{RelayError, Result};
use crate::lease::{Fence, LeaseManager};
use crate::outbox::{Batch, DeadLetterEntry, EventId, OutboxStore};
use crate::retry::{Action, RetryPolicy};

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Polling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Upper bound on events claimed per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long a claim stays valid before the sweep takes it back
    #[serde(with = "humantime_serde", default = "default_visibility_timeout")]
    pub visibility_timeout: Duration,

    #[serde(with = "humantime_serde", default = "default_min_interval")]
    pub min_interval: Duration,

    #[serde(with = "humantime_serde", default = "default_max_interval")]
    pub max_interval: Duration,

    /// Minimum spacing between expired-claim sweeps
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
}

fn default_batch_size() -> usize { 500 }
fn default_visibility_timeout() -> Duration { Duration::from_secs(60) }
fn default_min_interval() -> Duration { Duration::from_millis(100) }
fn default_max_interval() -> Duration { Duration::from_secs(10) }
fn default_sweep_interval() -> Duration { Duration::from_secs(30) }

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            visibility_timeout: default_visibility_timeout(),
            min_interval: default_min_interval(),
            max_interval: default_max_interval(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cycle Types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Leasing,
    Fetching,
    Coalescing,
    Dispatching,
    Settling,
}

impl CyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Leasing => "leasing",
            Self::Fetching => "fetching",
            Self::Coalescing => "coalescing",
            Self::Dispatching => "dispatching",
            Self::Settling => "settling",
        }
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// No shard lease held, nothing claimed
    NoLeases,
    /// Leases held but nothing claimable
    Empty,
    /// Batch dispatched and settled
    Completed,
    /// Systemic failure; held events handed back
    Escalated,
    /// Shutdown requested mid-cycle
    Cancelled,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoLeases => "no_leases",
            Self::Empty => "empty",
            Self::Completed => "completed",
            Self::Escalated => "escalated",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Summary of one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub started_at: DateTime<Utc>,
    /// Shards leased when the batch was claimed
    pub shards: usize,
    pub claimed: usize,
    pub operations: usize,
    /// Events whose entity group folded to nothing
    pub cancelled: usize,
    pub acknowledged: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Events returned without spending an attempt after escalation, shutdown
    /// or an open circuit
    pub handed_back: usize,
    #[serde(with = "humantime_serde")]
    pub next_interval: Duration,
    pub error: Option<String>,
}

impl CycleReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            outcome: CycleOutcome::Empty,
            started_at,
            shards: 0,
            claimed: 0,
            operations: 0,
            cancelled: 0,
            acknowledged: 0,
            retried: 0,
            dead_lettered: 0,
            handed_back: 0,
            next_interval: Duration::ZERO,
            error: None,
        }
    }
}

/// Running totals since start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub cycles: u64,
    pub escalations: u64,
    pub claimed: u64,
    pub acknowledged: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

#[derive(Default)]
struct Counters {
    cycles: AtomicU64,
    escalations: AtomicU64,
    claimed: AtomicU64,
    acknowledged: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

impl Counters {
    fn record(&self, report: &CycleReport) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if report.outcome == CycleOutcome::Escalated {
            self.escalations.fetch_add(1, Ordering::Relaxed);
        }
        self.claimed.fetch_add(report.claimed as u64, Ordering::Relaxed);
        self.acknowledged
            .fetch_add(report.acknowledged as u64, Ordering::Relaxed);
        self.retried.fetch_add(report.retried as u64, Ordering::Relaxed);
        self.dead_lettered
            .fetch_add(report.dead_lettered as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct Housekeeping {
    last_heartbeat: Option<DateTime<Utc>>,
    last_sweep: Option<DateTime<Utc>>,
}

/// Marks the task as run when `every` has passed since the last run.
fn take_if_due(last: &mut Option<DateTime<Utc>>, now: DateTime<Utc>, every: Duration) -> bool {
    match last {
        Some(at) if now - *at < to_chrono(every) => false,
        _ => {
            *last = Some(now);
            true
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

/// Drives claim, coalesce, dispatch and settle for one agent.
pub struct RelayScheduler {
    leases: Arc<LeaseManager>,
    outbox: Arc<dyn OutboxStore>,
    dispatcher: Dispatcher,
    policy: RetryPolicy,
    config: PollConfig,
    clock: SharedClock,
    interval: Mutex<PollInterval>,
    phase: RwLock<CyclePhase>,
    last_report: RwLock<Option<CycleReport>>,
    housekeeping: Mutex<Housekeeping>,
    counters: Counters,
}

impl RelayScheduler {
    pub fn new(
        leases: Arc<LeaseManager>,
        outbox: Arc<dyn OutboxStore>,
        dispatcher: Dispatcher,
        policy: RetryPolicy,
        config: PollConfig,
        clock: SharedClock,
    ) -> Self {
        let interval = PollInterval::new(config.min_interval, config.max_interval, config.batch_size);
        Self {
            leases,
            outbox,
            dispatcher,
            policy,
            config,
            clock,
            interval: Mutex::new(interval),
            phase: RwLock::new(CyclePhase::Idle),
            last_report: RwLock::new(None),
            housekeeping: Mutex::new(Housekeeping::default()),
            counters: Counters::default(),
        }
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    pub fn outbox(&self) -> &Arc<dyn OutboxStore> {
        &self.outbox
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.read()
    }

    pub fn current_interval(&self) -> Duration {
        self.interval.lock().current()
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        self.last_report.read().clone()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.counters.snapshot()
    }

    /// Register, then cycle until `shutdown` fires. Leases are released and
    /// the agent unregistered on the way out.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.leases.register().await?;
        info!(
            agent = %self.leases.agent(),
            name = %self.leases.name(),
            backend = %self.dispatcher.writer().name(),
            "Relay scheduler started"
        );

        while !shutdown.is_cancelled() {
            let report = self.run_cycle_until(&shutdown).await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(report.next_interval) => {}
            }
        }

        self.shutdown().await
    }

    /// Run one cycle that cannot be cancelled.
    pub async fn run_cycle(&self) -> CycleReport {
        self.run_cycle_until(&CancellationToken::new()).await
    }

    /// Run one cycle. If `cancel` fires while operations are in flight the
    /// batch is handed back instead of settled.
    #[tracing::instrument(skip_all, fields(agent = %self.leases.agent()))]
    pub async fn run_cycle_until(&self, cancel: &CancellationToken) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::new(self.clock.now());

        if let Err(e) = self.cycle(&mut report, cancel).await {
            e.log();
            report.outcome = CycleOutcome::Escalated;
            report.error = Some(e.to_string());
        }
        self.set_phase(CyclePhase::Idle);

        report.next_interval = {
            let mut interval = self.interval.lock();
            match report.outcome {
                CycleOutcome::NoLeases | CycleOutcome::Escalated => interval.back_off(),
                CycleOutcome::Cancelled => interval.current(),
                CycleOutcome::Empty | CycleOutcome::Completed => interval.observe(report.claimed),
            }
        };

        self.record(&report, started.elapsed());
        *self.last_report.write() = Some(report.clone());
        report
    }

    /// Hand back leases and leave the agent registry.
    pub async fn shutdown(&self) -> Result<()> {
        self.set_phase(CyclePhase::Idle);
        match self.leases.release_all().await {
            Ok(released) => info!(agent = %self.leases.agent(), released, "Released shard leases"),
            Err(e) => warn!(agent = %self.leases.agent(), error = %e, "Failed to release leases on shutdown"),
        }
        self.leases.unregister().await?;
        info!(agent = %self.leases.agent(), "Relay scheduler stopped");
        Ok(())
    }

    async fn cycle(&self, report: &mut CycleReport, cancel: &CancellationToken) -> Result<()> {
        self.set_phase(CyclePhase::Leasing);
        self.housekeeping().await;
        let fence = self.leases.maintain().await?;
        report.shards = fence.shards().len();
        if fence.is_empty() {
            report.outcome = CycleOutcome::NoLeases;
            return Ok(());
        }
        if cancel.is_cancelled() {
            report.outcome = CycleOutcome::Cancelled;
            return Ok(());
        }

        self.set_phase(CyclePhase::Fetching);
        let batch = self
            .outbox
            .claim(&fence, self.config.batch_size, self.config.visibility_timeout)
            .await?;
        report.claimed = batch.len();
        if batch.is_empty() {
            report.outcome = CycleOutcome::Empty;
            return Ok(());
        }
        debug!(claimed = batch.len(), shards = report.shards, "Claimed batch");

        match self.process(&fence, &batch, report, cancel).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let retry_after = match self.policy.classify_error(&e) {
                    Action::Retry(delay) => Some(delay),
                    _ => None,
                };
                report.handed_back += self.hand_back(&fence, &batch.ids(), retry_after).await;
                Err(e)
            }
        }
    }

    async fn process(
        &self,
        fence: &Fence,
        batch: &Batch,
        report: &mut CycleReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.set_phase(CyclePhase::Coalescing);
        let Coalesced { operations, cancelled } = coalesce(batch);
        report.operations = operations.len();
        report.cancelled = cancelled.len();

        self.set_phase(CyclePhase::Dispatching);
        let in_flight: Vec<EventId> = operations
            .iter()
            .flat_map(|op| op.source_events.iter().copied())
            .collect();
        if !in_flight.is_empty() {
            self.outbox.mark_processing(fence, &in_flight).await?;
        }

        let outcomes = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                report.handed_back = self.hand_back(fence, &batch.ids(), None).await;
                report.outcome = CycleOutcome::Cancelled;
                return Ok(());
            }
            outcomes = self.dispatcher.dispatch(operations) => outcomes,
        };

        self.set_phase(CyclePhase::Settling);
        self.settle(fence, cancelled, &outcomes, report).await?;
        report.outcome = CycleOutcome::Completed;
        Ok(())
    }

    /// Acknowledge, then dead-letter, then release retries and deferrals.
    ///
    /// An escalating outcome fails the whole settle before anything is
    /// written.
    async fn settle(
        &self,
        fence: &Fence,
        cancelled: Vec<EventId>,
        outcomes: &[OperationOutcome],
        report: &mut CycleReport,
    ) -> Result<()> {
        let actions: Vec<Action> = outcomes.iter().map(|o| self.policy.classify(o)).collect();
        if let Some((outcome, _)) = outcomes
            .iter()
            .zip(&actions)
            .find(|(_, action)| **action == Action::Escalate)
        {
            let error = outcome.error().map(|e| e.to_string()).unwrap_or_default();
            return Err(RelayError::write_fenced(
                outcome.operation.entity.entity_type.clone(),
                outcome.operation.entity.entity_id.clone(),
                error,
            ));
        }

        let mut acknowledge = cancelled;
        let mut dead_letters = Vec::new();
        let mut retries = Vec::new();
        let mut deferred = Vec::new();

        for (outcome, action) in outcomes.iter().zip(actions) {
            let error = outcome.error().map(|e| e.to_string()).unwrap_or_default();
            match action {
                Action::Acknowledge => acknowledge.extend_from_slice(outcome.event_ids()),
                Action::Retry(delay) => retries.push((delay, error, outcome.event_ids().to_vec())),
                Action::Defer(delay) => deferred.push((delay, outcome.event_ids().to_vec())),
                Action::DeadLetter(reason) => {
                    warn!(
                        entity = %outcome.operation.entity,
                        reason = %reason,
                        error = %error,
                        "Dead-lettering events"
                    );
                    dead_letters.extend(outcome.event_ids().iter().map(|&id| DeadLetterEntry {
                        id,
                        reason,
                        error: error.clone(),
                    }));
                }
                Action::Escalate => {}
            }
        }

        if !acknowledge.is_empty() {
            let ack = self.outbox.acknowledge(fence, &acknowledge).await?;
            report.acknowledged = ack.acknowledged.len();
            if !ack.not_owned.is_empty() {
                warn!(
                    not_owned = ack.not_owned.len(),
                    "Some events were no longer claimed by this agent and will be delivered again"
                );
            }
        }

        if !dead_letters.is_empty() {
            report.dead_lettered = self.outbox.dead_letter(fence, &dead_letters).await?;
        }

        for (delay, error, ids) in retries {
            report.retried += self
                .outbox
                .release(fence, &ids, Some(delay), Some(error.as_str()))
                .await?;
        }

        if !deferred.is_empty() {
            debug!(operations = deferred.len(), "Circuit open, deferring operations");
        }
        for (delay, ids) in deferred {
            let retry_after = (!delay.is_zero()).then_some(delay);
            report.handed_back += self.hand_back(fence, &ids, retry_after).await;
        }

        Ok(())
    }

    /// Return held events without consuming a retry. Failures are logged; the
    /// visibility timeout recovers the events anyway.
    async fn hand_back(&self, fence: &Fence, ids: &[EventId], retry_after: Option<Duration>) -> usize {
        match self.outbox.hand_back(fence, ids, retry_after).await {
            Ok(returned) => {
                if returned > 0 {
                    info!(returned, "Handed back claimed events");
                }
                returned
            }
            Err(e) => {
                warn!(error = %e, events = ids.len(), "Failed to hand back events, leaving them to expire");
                0
            }
        }
    }

    async fn housekeeping(&self) {
        let now = self.clock.now();
        let (heartbeat_due, sweep_due) = {
            let mut state = self.housekeeping.lock();
            (
                take_if_due(&mut state.last_heartbeat, now, self.leases.config().heartbeat_interval),
                take_if_due(&mut state.last_sweep, now, self.config.sweep_interval),
            )
        };

        if heartbeat_due {
            if let Err(e) = self.leases.heartbeat().await {
                warn!(agent = %self.leases.agent(), error = %e, "Heartbeat failed");
            }
            match self.leases.store().reap_dead_agents().await {
                Ok(reaped) if !reaped.is_empty() => {
                    info!(reaped = reaped.len(), "Reaped dead agents");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to reap dead agents"),
            }
        }

        if sweep_due {
            match self.outbox.sweep_expired().await {
                Ok(swept) if swept > 0 => info!(swept, "Returned expired claims to pending"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to sweep expired claims"),
            }
        }
    }

    fn set_phase(&self, phase: CyclePhase) {
        let previous = std::mem::replace(&mut *self.phase.write(), phase);
        if previous != phase {
            tracing::trace!(from = %previous, to = %phase, "Cycle phase");
        }
    }

    fn record(&self, report: &CycleReport, elapsed: Duration) {
        self.counters.record(report);

        metrics::counter!("relay_cycles_total", "outcome" => report.outcome.as_str()).increment(1);
        metrics::histogram!("relay_cycle_duration_seconds").record(elapsed.as_secs_f64());
        metrics::gauge!("relay_poll_interval_seconds").set(report.next_interval.as_secs_f64());
        metrics::counter!("relay_events_claimed_total").increment(report.claimed as u64);
        metrics::counter!("relay_events_acknowledged_total").increment(report.acknowledged as u64);
        metrics::counter!("relay_events_retried_total").increment(report.retried as u64);
        metrics::counter!("relay_events_dead_lettered_total").increment(report.dead_lettered as u64);

        if report.outcome == CycleOutcome::Completed {
            debug!(
                claimed = report.claimed,
                operations = report.operations,
                acknowledged = report.acknowledged,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                next_interval_ms = report.next_interval.as_millis() as u64,
                "Cycle completed"
            );
        }
    }
}
