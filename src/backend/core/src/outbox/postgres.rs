//! PostgreSQL outbox.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent claimers never see the
//! same row, and take a `FOR SHARE` lock on the caller's lease rows so a
//! concurrent takeover cannot bump the epoch mid-claim. Acknowledge locks the
//! lease rows the same way before deleting.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool};
use uuid::Uuid;

use super::{
    validate_claim, AckReport, Batch, ClaimInfo, DeadLetterEntry, DeadLetterRecord, EntityRef,
    EventId, EventStatus, NewEvent, OutboxEvent, OutboxStats, OutboxStore,
};
use crate::clock::{to_chrono, SharedClock};
use crate::error::{RelayError, Result};
use crate::lease::{AgentId, Epoch, Fence, ShardId};

const EVENT_COLUMNS: &str = "seq, shard_id, entity_type, entity_id, kind, routing_key, created_at, \
     status, retry_count, not_before, claimed_by, claim_epoch, claim_expires_at, last_error";

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    seq: i64,
    shard_id: i32,
    entity_type: String,
    entity_id: String,
    kind: String,
    routing_key: Option<String>,
    created_at: DateTime<Utc>,
    status: String,
    retry_count: i32,
    not_before: Option<DateTime<Utc>>,
    claimed_by: Option<Uuid>,
    claim_epoch: Option<i64>,
    claim_expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl TryFrom<EventRow> for OutboxEvent {
    type Error = RelayError;

    fn try_from(row: EventRow) -> Result<Self> {
        let claim = match (row.claimed_by, row.claim_epoch, row.claim_expires_at) {
            (Some(agent), Some(epoch), Some(expires_at)) => Some(ClaimInfo {
                agent: AgentId(agent),
                epoch: Epoch(epoch as u64),
                expires_at,
            }),
            _ => None,
        };
        Ok(Self {
            id: EventId(row.seq),
            shard: ShardId(row.shard_id as u32),
            entity: EntityRef::new(row.entity_type, row.entity_id),
            kind: row.kind.parse()?,
            routing_key: row.routing_key,
            created_at: row.created_at,
            status: row.status.parse()?,
            retry_count: row.retry_count.max(0) as u32,
            not_before: row.not_before,
            claim,
            last_error: row.last_error,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DeadLetterRow {
    seq: i64,
    shard_id: i32,
    entity_type: String,
    entity_id: String,
    kind: String,
    routing_key: Option<String>,
    created_at: DateTime<Utc>,
    retry_count: i32,
    reason: String,
    error: String,
    dead_lettered_at: DateTime<Utc>,
}

impl TryFrom<DeadLetterRow> for DeadLetterRecord {
    type Error = RelayError;

    fn try_from(row: DeadLetterRow) -> Result<Self> {
        Ok(Self {
            id: EventId(row.seq),
            shard: ShardId(row.shard_id as u32),
            entity: EntityRef::new(row.entity_type, row.entity_id),
            kind: row.kind.parse()?,
            routing_key: row.routing_key,
            created_at: row.created_at,
            retry_count: row.retry_count.max(0) as u32,
            reason: row.reason.parse()?,
            error: row.error,
            dead_lettered_at: row.dead_lettered_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AckCandidate {
    seq: i64,
    shard_id: i32,
    status: String,
    claimed_by: Option<Uuid>,
    claim_epoch: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
struct LeaseFenceRow {
    shard_id: i32,
    owner: Option<Uuid>,
    epoch: i64,
}

/// Fence as parallel arrays for `unnest($1::int4[], $2::int8[])`.
fn fence_arrays(fence: &Fence) -> (Vec<i32>, Vec<i64>) {
    fence
        .epochs
        .iter()
        .map(|(shard, epoch)| (shard.0 as i32, epoch.0 as i64))
        .unzip()
}

fn raw_ids(ids: &[EventId]) -> Vec<i64> {
    ids.iter().map(|id| id.0).collect()
}

/// Outbox tables in PostgreSQL.
pub struct PgOutboxStore {
    pool: PgPool,
    clock: SharedClock,
    shard_count: u32,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool, shard_count: u32, clock: SharedClock) -> Self {
        Self {
            pool,
            clock,
            shard_count: shard_count.max(1),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the event and dead-letter tables if they do not exist.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relay_events (
                seq BIGSERIAL PRIMARY KEY,
                shard_id INTEGER NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                routing_key TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                not_before TIMESTAMPTZ,
                claimed_by UUID,
                claim_epoch BIGINT,
                claim_expires_at TIMESTAMPTZ,
                last_error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_relay_events_shard_status
            ON relay_events (shard_id, status, seq)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_relay_events_entity
            ON relay_events (entity_type, entity_id, seq)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relay_dead_letters (
                seq BIGINT PRIMARY KEY,
                shard_id INTEGER NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                routing_key TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                retry_count INTEGER NOT NULL,
                reason TEXT NOT NULL,
                error TEXT NOT NULL,
                dead_lettered_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append inside the producer's own transaction, so the event becomes
    /// visible exactly when the entity change commits.
    pub async fn append_in_tx(&self, conn: &mut PgConnection, event: NewEvent) -> Result<EventId> {
        event.validate()?;
        let shard = event.entity.shard(self.shard_count);
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO relay_events (shard_id, entity_type, entity_id, kind, routing_key, created_at, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending')
            RETURNING seq
            "#,
        )
        .bind(shard.0 as i32)
        .bind(&event.entity.entity_type)
        .bind(&event.entity.entity_id)
        .bind(event.kind.as_str())
        .bind(&event.routing_key)
        .bind(self.clock.now())
        .fetch_one(conn)
        .await?;

        Ok(EventId(seq))
    }

    async fn return_events(
        &self,
        fence: &Fence,
        ids: &[EventId],
        retry_after: Option<Duration>,
        error: Option<&str>,
        count_attempt: bool,
    ) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let (shards, epochs) = fence_arrays(fence);
        let not_before = retry_after.map(|d| self.clock.now() + to_chrono(d));

        let returned = sqlx::query(
            r#"
            UPDATE relay_events e
            SET status = CASE WHEN $5::timestamptz IS NULL THEN 'pending' ELSE 'failed' END,
                not_before = $5,
                retry_count = e.retry_count + $6,
                last_error = COALESCE($7, e.last_error),
                claimed_by = NULL,
                claim_epoch = NULL,
                claim_expires_at = NULL
            FROM unnest($2::int4[], $3::int8[]) AS f(shard_id, epoch)
            WHERE e.seq = ANY($1)
              AND e.shard_id = f.shard_id
              AND e.claim_epoch = f.epoch
              AND e.claimed_by = $4
              AND e.status IN ('claimed', 'processing')
            "#,
        )
        .bind(raw_ids(ids))
        .bind(&shards)
        .bind(&epochs)
        .bind(fence.agent.0)
        .bind(not_before)
        .bind(if count_attempt { 1i32 } else { 0i32 })
        .bind(error)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(returned as usize)
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn append(&self, event: NewEvent) -> Result<EventId> {
        let mut conn = self.pool.acquire().await?;
        self.append_in_tx(&mut *conn, event).await
    }

    #[tracing::instrument(skip(self, fence), fields(agent = %fence.agent, shards = fence.epochs.len()))]
    async fn claim(&self, fence: &Fence, max_batch_size: usize, visibility_timeout: Duration) -> Result<Batch> {
        validate_claim(fence, max_batch_size)?;
        let now = self.clock.now();
        let (shards, epochs) = fence_arrays(fence);

        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            WITH fence AS (
                SELECT * FROM unnest($1::int4[], $2::int8[]) AS f(shard_id, epoch)
            ),
            owned AS (
                SELECT l.shard_id, l.epoch
                FROM relay_shard_leases l
                JOIN fence f ON f.shard_id = l.shard_id AND f.epoch = l.epoch
                WHERE l.owner = $3 AND l.expires_at > $4
                FOR SHARE OF l
            ),
            candidates AS (
                SELECT e.seq, o.epoch
                FROM relay_events e
                JOIN owned o ON o.shard_id = e.shard_id
                WHERE (e.status = 'pending' OR (e.status = 'failed' AND e.not_before <= $4))
                  AND NOT EXISTS (
                      SELECT 1 FROM relay_events p
                      WHERE p.entity_type = e.entity_type
                        AND p.entity_id = e.entity_id
                        AND p.seq < e.seq
                        AND NOT (p.status = 'pending' OR (p.status = 'failed' AND p.not_before <= $4))
                  )
                ORDER BY e.seq
                LIMIT $5
                FOR UPDATE OF e SKIP LOCKED
            )
            UPDATE relay_events e
            SET status = 'claimed',
                claimed_by = $3,
                claim_epoch = c.epoch,
                claim_expires_at = $6
            FROM candidates c
            WHERE e.seq = c.seq
            RETURNING e.*
            "#,
        )
        .bind(&shards)
        .bind(&epochs)
        .bind(fence.agent.0)
        .bind(now)
        .bind(max_batch_size as i64)
        .bind(now + to_chrono(visibility_timeout))
        .fetch_all(&self.pool)
        .await?;

        let mut events = rows
            .into_iter()
            .map(OutboxEvent::try_from)
            .collect::<Result<Vec<_>>>()?;
        events.sort_by_key(|e| e.id);

        tracing::debug!(claimed = events.len(), "Claimed events");
        Ok(Batch {
            agent: fence.agent,
            events,
        })
    }

    async fn mark_processing(&self, fence: &Fence, ids: &[EventId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let (shards, epochs) = fence_arrays(fence);
        let marked = sqlx::query(
            r#"
            UPDATE relay_events e
            SET status = 'processing'
            FROM unnest($2::int4[], $3::int8[]) AS f(shard_id, epoch)
            WHERE e.seq = ANY($1)
              AND e.shard_id = f.shard_id
              AND e.claim_epoch = f.epoch
              AND e.claimed_by = $4
              AND e.status = 'claimed'
            "#,
        )
        .bind(raw_ids(ids))
        .bind(&shards)
        .bind(&epochs)
        .bind(fence.agent.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(marked as usize)
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let swept = sqlx::query(
            r#"
            UPDATE relay_events
            SET status = 'pending', claimed_by = NULL, claim_epoch = NULL, claim_expires_at = NULL
            WHERE status IN ('claimed', 'processing')
              AND (claim_expires_at IS NULL OR claim_expires_at <= $1)
            "#,
        )
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(swept as usize)
    }

    async fn acknowledge(&self, fence: &Fence, ids: &[EventId]) -> Result<AckReport> {
        let mut report = AckReport::default();
        if ids.is_empty() {
            return Ok(report);
        }
        let mut tx = self.pool.begin().await?;

        let rows: Vec<AckCandidate> = sqlx::query_as(
            r#"
            SELECT seq, shard_id, status, claimed_by, claim_epoch
            FROM relay_events
            WHERE seq = ANY($1)
            FOR UPDATE
            "#,
        )
        .bind(raw_ids(ids))
        .fetch_all(&mut *tx)
        .await?;

        let mut shard_ids: Vec<i32> = rows.iter().map(|r| r.shard_id).collect();
        shard_ids.sort_unstable();
        shard_ids.dedup();

        let leases: Vec<LeaseFenceRow> = sqlx::query_as(
            r#"
            SELECT shard_id, owner, epoch
            FROM relay_shard_leases
            WHERE shard_id = ANY($1)
            FOR SHARE
            "#,
        )
        .bind(&shard_ids)
        .fetch_all(&mut *tx)
        .await?;

        for shard_id in &shard_ids {
            let shard = ShardId(*shard_id as u32);
            let context = format!("acknowledge by agent {}", fence.agent);
            let Some(epoch) = fence.epoch_for(shard) else {
                return Err(RelayError::shard_not_owned(shard, context));
            };
            let held = leases.iter().any(|l| {
                l.shard_id == *shard_id
                    && l.owner == Some(fence.agent.0)
                    && Epoch(l.epoch as u64) == epoch
            });
            if !held {
                return Err(RelayError::lease_lost(shard, context));
            }
        }

        let mut owned = Vec::new();
        for id in ids {
            match rows.iter().find(|r| r.seq == id.0) {
                None => report.missing.push(*id),
                Some(row) => {
                    let in_flight = row.status == EventStatus::Claimed.as_str()
                        || row.status == EventStatus::Processing.as_str();
                    let mine = row.claimed_by == Some(fence.agent.0)
                        && row.claim_epoch.map(|e| Epoch(e as u64))
                            == fence.epoch_for(ShardId(row.shard_id as u32));
                    if in_flight && mine {
                        owned.push(id.0);
                        report.acknowledged.push(*id);
                    } else {
                        report.not_owned.push(*id);
                    }
                }
            }
        }

        if !owned.is_empty() {
            sqlx::query("DELETE FROM relay_events WHERE seq = ANY($1)")
                .bind(&owned)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(report)
    }

    async fn release(
        &self,
        fence: &Fence,
        ids: &[EventId],
        retry_after: Option<Duration>,
        error: Option<&str>,
    ) -> Result<usize> {
        self.return_events(fence, ids, retry_after, error, true).await
    }

    async fn hand_back(&self, fence: &Fence, ids: &[EventId], retry_after: Option<Duration>) -> Result<usize> {
        self.return_events(fence, ids, retry_after, None, false).await
    }

    async fn dead_letter(&self, fence: &Fence, entries: &[DeadLetterEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let (shards, epochs) = fence_arrays(fence);
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let mut moved = 0;
        for entry in entries {
            moved += sqlx::query(
                r#"
                WITH moved AS (
                    DELETE FROM relay_events e
                    USING unnest($2::int4[], $3::int8[]) AS f(shard_id, epoch)
                    WHERE e.seq = $1
                      AND e.shard_id = f.shard_id
                      AND e.claim_epoch = f.epoch
                      AND e.claimed_by = $4
                      AND e.status IN ('claimed', 'processing')
                    RETURNING e.*
                )
                INSERT INTO relay_dead_letters
                    (seq, shard_id, entity_type, entity_id, kind, routing_key, created_at,
                     retry_count, reason, error, dead_lettered_at)
                SELECT seq, shard_id, entity_type, entity_id, kind, routing_key, created_at,
                       retry_count, $5, $6, $7
                FROM moved
                "#,
            )
            .bind(entry.id.0)
            .bind(&shards)
            .bind(&epochs)
            .bind(fence.agent.0)
            .bind(entry.reason.to_string())
            .bind(&entry.error)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(moved)
    }

    async fn find(&self, id: EventId) -> Result<Option<OutboxEvent>> {
        let sql = format!("SELECT {} FROM relay_events WHERE seq = $1", EVENT_COLUMNS);
        let row: Option<EventRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(OutboxEvent::try_from).transpose()
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        let rows: Vec<DeadLetterRow> = sqlx::query_as(
            r#"
            SELECT seq, shard_id, entity_type, entity_id, kind, routing_key, created_at,
                   retry_count, reason, error, dead_lettered_at
            FROM relay_dead_letters
            ORDER BY seq
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeadLetterRecord::try_from).collect()
    }

    async fn requeue_dead_letter(&self, id: EventId) -> Result<EventId> {
        let mut tx = self.pool.begin().await?;

        let row: Option<DeadLetterRow> = sqlx::query_as(
            r#"
            DELETE FROM relay_dead_letters
            WHERE seq = $1
            RETURNING seq, shard_id, entity_type, entity_id, kind, routing_key, created_at,
                      retry_count, reason, error, dead_lettered_at
            "#,
        )
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let record = match row {
            Some(row) => DeadLetterRecord::try_from(row)?,
            None => return Err(RelayError::not_found("DeadLetter", id.to_string())),
        };

        let event = NewEvent {
            entity: record.entity,
            kind: record.kind,
            routing_key: record.routing_key,
        };
        let new_id = self.append_in_tx(&mut *tx, event).await?;

        tx.commit().await?;
        tracing::info!(dead_letter = %id, event = %new_id, "Requeued dead letter");
        Ok(new_id)
    }

    async fn discard_dead_letter(&self, id: EventId) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM relay_dead_letters WHERE seq = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if deleted == 0 {
            return Err(RelayError::not_found("DeadLetter", id.to_string()));
        }
        Ok(())
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM relay_events GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let oldest_pending_at: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MIN(created_at) FROM relay_events WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;

        let dead_lettered: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM relay_dead_letters")
            .fetch_one(&self.pool)
            .await?;

        let mut stats = OutboxStats {
            dead_lettered: dead_lettered as u64,
            oldest_pending_at,
            ..Default::default()
        };
        for (status, count) in counts {
            let count = count as u64;
            match status.parse::<EventStatus>()? {
                EventStatus::Pending => stats.pending = count,
                EventStatus::Claimed => stats.claimed = count,
                EventStatus::Processing => stats.processing = count,
                EventStatus::Failed => stats.failed = count,
                EventStatus::Done => {}
            }
        }
        Ok(stats)
    }
}
