//! Admin request handlers.
//!
//! All handlers return `Result<impl IntoResponse, RelayError>` so that errors
//! are converted to HTTP status codes via `RelayError`'s `IntoResponse`.

use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AdminState, ApiResponse};
use crate::error::RelayError;
use crate::lease::AgentId;
use crate::outbox::EventId;

const DEFAULT_DEAD_LETTER_LIMIT: usize = 100;
const MAX_DEAD_LETTER_LIMIT: usize = 1000;

// ═══════════════════════════════════════════════════════════════════════════════
// Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn prometheus_metrics(State(state): State<AdminState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Outbox
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn outbox_stats(State(state): State<AdminState>) -> Result<impl IntoResponse, RelayError> {
    let stats = state.outbox.stats().await?;
    Ok(Json(ApiResponse::success(stats)))
}

#[derive(Debug, Deserialize)]
pub struct ListDeadLettersParams {
    pub limit: Option<usize>,
}

pub async fn list_dead_letters(
    State(state): State<AdminState>,
    Query(params): Query<ListDeadLettersParams>,
) -> Result<impl IntoResponse, RelayError> {
    let limit = params.limit.unwrap_or(DEFAULT_DEAD_LETTER_LIMIT);
    if limit == 0 {
        return Err(RelayError::validation("limit must be greater than zero"));
    }

    let records = state
        .outbox
        .list_dead_letters(limit.min(MAX_DEAD_LETTER_LIMIT))
        .await?;
    Ok(Json(ApiResponse::success(records)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequeueResponse {
    pub original_id: EventId,
    pub new_id: EventId,
}

pub async fn requeue_dead_letter(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, RelayError> {
    let new_id = state.outbox.requeue_dead_letter(EventId(id)).await?;
    tracing::info!(original_id = id, new_id = new_id.0, "Dead letter requeued");

    Ok(Json(ApiResponse::success(RequeueResponse {
        original_id: EventId(id),
        new_id,
    })))
}

pub async fn discard_dead_letter(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, RelayError> {
    state.outbox.discard_dead_letter(EventId(id)).await?;
    tracing::info!(id, "Dead letter discarded");

    Ok(Json(ApiResponse::success(serde_json::json!({ "discarded": id }))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Leases and Agents
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseEntry {
    pub shard: u32,
    pub owner: Option<AgentId>,
    pub epoch: u64,
    pub expires_at: Option<DateTime<Utc>>,
    /// Owned and not yet expired
    pub live: bool,
}

pub async fn list_leases(State(state): State<AdminState>) -> Result<impl IntoResponse, RelayError> {
    let now = state.clock.now();
    let leases: Vec<LeaseEntry> = state
        .leases
        .leases()
        .await?
        .into_iter()
        .map(|lease| LeaseEntry {
            shard: lease.shard.0,
            owner: lease.owner,
            epoch: lease.epoch.0,
            expires_at: lease.expires_at,
            live: lease.live_owner(now).is_some(),
        })
        .collect();

    Ok(Json(ApiResponse::success(leases)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    pub id: AgentId,
    pub name: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub alive: bool,
    /// Shards this agent holds a live lease on
    pub shards: Vec<u32>,
}

pub async fn list_agents(State(state): State<AdminState>) -> Result<impl IntoResponse, RelayError> {
    let now = state.clock.now();
    let leases = state.leases.leases().await?;
    let agents: Vec<AgentEntry> = state
        .leases
        .agents()
        .await?
        .into_iter()
        .map(|agent| AgentEntry {
            shards: leases
                .iter()
                .filter(|l| l.live_owner(now) == Some(agent.id))
                .map(|l| l.shard.0)
                .collect(),
            alive: agent.is_alive(now),
            id: agent.id,
            name: agent.name,
            registered_at: agent.registered_at,
            last_heartbeat: agent.last_heartbeat,
            expires_at: agent.expires_at,
        })
        .collect();

    Ok(Json(ApiResponse::success(agents)))
}
