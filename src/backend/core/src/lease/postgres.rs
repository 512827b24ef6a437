//! PostgreSQL lease store.
//!
//! Each lease mutation is a single conditional statement on the shard's row,
//! so concurrent agents in different processes race safely:
//!
//! ```text
//! acquire: INSERT .. ON CONFLICT DO UPDATE .. WHERE <unowned | mine | expired>
//! renew:   UPDATE .. WHERE owner = $agent AND epoch = $epoch
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use uuid::Uuid;

use super::{
    AgentId, AgentRecord, Epoch, LeaseGrant, LeaseResult, LeaseStore, RenewResult, ShardId,
    ShardLease,
};
use crate::clock::{to_chrono, SharedClock};
use crate::error::{ErrorCode, RelayError, Result};

#[derive(Debug, sqlx::FromRow)]
struct AgentRow {
    agent_id: Uuid,
    name: String,
    registered_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl From<AgentRow> for AgentRecord {
    fn from(row: AgentRow) -> Self {
        Self {
            id: AgentId(row.agent_id),
            name: row.name,
            registered_at: row.registered_at,
            last_heartbeat: row.last_heartbeat,
            expires_at: row.expires_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LeaseRow {
    shard_id: i32,
    owner: Option<Uuid>,
    epoch: i64,
    expires_at: Option<DateTime<Utc>>,
}

impl From<LeaseRow> for ShardLease {
    fn from(row: LeaseRow) -> Self {
        Self {
            shard: ShardId(row.shard_id as u32),
            owner: row.owner.map(AgentId),
            epoch: Epoch(row.epoch as u64),
            expires_at: row.expires_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct GrantRow {
    epoch: i64,
    expires_at: Option<DateTime<Utc>>,
}

/// Lease table and agent registry in PostgreSQL.
pub struct PgLeaseStore {
    pool: PgPool,
    clock: SharedClock,
}

impl PgLeaseStore {
    pub fn new(pool: PgPool, clock: SharedClock) -> Self {
        Self { pool, clock }
    }

    /// Create the agent and lease tables if they do not exist.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relay_agents (
                agent_id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                registered_at TIMESTAMPTZ NOT NULL,
                last_heartbeat TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relay_shard_leases (
                shard_id INTEGER PRIMARY KEY,
                owner UUID,
                epoch BIGINT NOT NULL DEFAULT 0,
                expires_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_relay_shard_leases_owner
            ON relay_shard_leases (owner)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn not_registered(agent: AgentId) -> RelayError {
    RelayError::new(
        ErrorCode::AgentNotRegistered,
        format!("Agent {} is not registered", agent),
    )
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn register_agent(&self, agent: AgentId, name: &str, ttl: Duration) -> Result<AgentRecord> {
        let now = self.clock.now();
        let row: AgentRow = sqlx::query_as(
            r#"
            INSERT INTO relay_agents (agent_id, name, registered_at, last_heartbeat, expires_at)
            VALUES ($1, $2, $3, $3, $4)
            ON CONFLICT (agent_id) DO UPDATE SET
                name = EXCLUDED.name,
                last_heartbeat = EXCLUDED.last_heartbeat,
                expires_at = EXCLUDED.expires_at
            RETURNING agent_id, name, registered_at, last_heartbeat, expires_at
            "#,
        )
        .bind(agent.0)
        .bind(name)
        .bind(now)
        .bind(now + to_chrono(ttl))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn heartbeat(&self, agent: AgentId, ttl: Duration) -> Result<AgentRecord> {
        let now = self.clock.now();
        let row: Option<AgentRow> = sqlx::query_as(
            r#"
            UPDATE relay_agents
            SET last_heartbeat = $2, expires_at = $3
            WHERE agent_id = $1
            RETURNING agent_id, name, registered_at, last_heartbeat, expires_at
            "#,
        )
        .bind(agent.0)
        .bind(now)
        .bind(now + to_chrono(ttl))
        .fetch_optional(&self.pool)
        .await?;

        row.map(AgentRecord::from).ok_or_else(|| not_registered(agent))
    }

    async fn unregister_agent(&self, agent: AgentId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE relay_shard_leases SET owner = NULL, expires_at = NULL WHERE owner = $1")
            .bind(agent.0)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM relay_agents WHERE agent_id = $1")
            .bind(agent.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn reap_dead_agents(&self) -> Result<Vec<AgentId>> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let dead: Vec<Uuid> = sqlx::query_scalar(
            "DELETE FROM relay_agents WHERE expires_at < $1 RETURNING agent_id",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        if !dead.is_empty() {
            sqlx::query(
                "UPDATE relay_shard_leases SET owner = NULL, expires_at = NULL WHERE owner = ANY($1)",
            )
            .bind(&dead)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(dead.into_iter().map(AgentId).collect())
    }

    async fn agents(&self) -> Result<Vec<AgentRecord>> {
        let rows: Vec<AgentRow> = sqlx::query_as(
            r#"
            SELECT agent_id, name, registered_at, last_heartbeat, expires_at
            FROM relay_agents
            ORDER BY registered_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(AgentRecord::from).collect())
    }

    async fn acquire(&self, agent: AgentId, shards: &[ShardId], duration: Duration) -> Result<LeaseResult> {
        let now = self.clock.now();
        let expires_at = now + to_chrono(duration);
        let mut tx = self.pool.begin().await?;

        let registered: Option<Uuid> =
            sqlx::query_scalar("SELECT agent_id FROM relay_agents WHERE agent_id = $1 FOR SHARE")
                .bind(agent.0)
                .fetch_optional(&mut *tx)
                .await?;
        if registered.is_none() {
            return Err(not_registered(agent));
        }

        let mut result = LeaseResult::default();
        for &shard in shards {
            // SET expressions read the old row, so the CASE sees the previous owner.
            let row: Option<GrantRow> = sqlx::query_as(
                r#"
                INSERT INTO relay_shard_leases (shard_id, owner, epoch, expires_at)
                VALUES ($1, $2, 1, $3)
                ON CONFLICT (shard_id) DO UPDATE SET
                    owner = EXCLUDED.owner,
                    epoch = CASE
                        WHEN relay_shard_leases.owner IS NOT DISTINCT FROM EXCLUDED.owner
                            THEN relay_shard_leases.epoch
                        ELSE relay_shard_leases.epoch + 1
                    END,
                    expires_at = EXCLUDED.expires_at
                WHERE relay_shard_leases.owner IS NULL
                   OR relay_shard_leases.owner = EXCLUDED.owner
                   OR relay_shard_leases.expires_at IS NULL
                   OR relay_shard_leases.expires_at <= $4
                RETURNING epoch, expires_at
                "#,
            )
            .bind(shard.0 as i32)
            .bind(agent.0)
            .bind(expires_at)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

            match row {
                Some(row) => result.granted.push(LeaseGrant {
                    shard,
                    epoch: Epoch(row.epoch as u64),
                    expires_at: row.expires_at.unwrap_or(expires_at),
                }),
                None => result.denied.push(shard),
            }
        }

        tx.commit().await?;
        Ok(result)
    }

    async fn renew(&self, agent: AgentId, grants: &[LeaseGrant], duration: Duration) -> Result<RenewResult> {
        let expires_at = self.clock.now() + to_chrono(duration);
        let mut tx = self.pool.begin().await?;

        let mut result = RenewResult::default();
        for grant in grants {
            let renewed = sqlx::query(
                r#"
                UPDATE relay_shard_leases
                SET expires_at = $4
                WHERE shard_id = $1 AND owner = $2 AND epoch = $3
                "#,
            )
            .bind(grant.shard.0 as i32)
            .bind(agent.0)
            .bind(grant.epoch.0 as i64)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if renewed == 1 {
                result.renewed.push(LeaseGrant {
                    shard: grant.shard,
                    epoch: grant.epoch,
                    expires_at,
                });
            } else {
                result.lost.push(grant.shard);
            }
        }

        tx.commit().await?;
        Ok(result)
    }

    async fn release(&self, agent: AgentId, shards: &[ShardId]) -> Result<usize> {
        let ids: Vec<i32> = shards.iter().map(|s| s.0 as i32).collect();
        let released = sqlx::query(
            r#"
            UPDATE relay_shard_leases
            SET owner = NULL, expires_at = NULL
            WHERE owner = $1 AND shard_id = ANY($2)
            "#,
        )
        .bind(agent.0)
        .bind(&ids)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(released as usize)
    }

    async fn leases(&self) -> Result<Vec<ShardLease>> {
        let rows: Vec<LeaseRow> = sqlx::query_as(
            "SELECT shard_id, owner, epoch, expires_at FROM relay_shard_leases ORDER BY shard_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ShardLease::from).collect())
    }
}
