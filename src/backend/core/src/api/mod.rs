//! Admin HTTP API.
//!
//! ```text
//! GET    /health                         component report
//! GET    /health/live                    liveness probe
//! GET    /health/ready                   readiness probe
//! GET    /metrics                        Prometheus scrape
//! GET    /v1/outbox/stats                event counts by status
//! GET    /v1/dead-letters?limit=N        newest dead letters first
//! POST   /v1/dead-letters/:id/requeue    append again as a fresh event
//! DELETE /v1/dead-letters/:id            drop for good
//! GET    /v1/leases                      shard lease table
//! GET    /v1/agents                      agent registry with held shards
//! ```
//!
//! Successful responses use the `{ success, data }` envelope; errors render
//! through `RelayError`'s `IntoResponse`.

mod handlers;

use axum::{
    extract::FromRef,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::clock::SharedClock;
use crate::health::{self, HealthService};
use crate::lease::LeaseStore;
use crate::outbox::OutboxStore;
use crate::telemetry::MetricsRegistry;

pub use handlers::{AgentEntry, LeaseEntry, ListDeadLettersParams, RequeueResponse};

/// State shared across admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub outbox: Arc<dyn OutboxStore>,
    pub leases: Arc<dyn LeaseStore>,
    pub health: Arc<HealthService>,
    pub metrics: MetricsRegistry,
    pub clock: SharedClock,
}

impl FromRef<AdminState> for Arc<HealthService> {
    fn from_ref(state: &AdminState) -> Self {
        state.health.clone()
    }
}

/// Build the admin router.
pub fn build_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/health/live", get(health::liveness_check))
        .route("/health/ready", get(health::readiness_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .nest("/v1", v1_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn v1_router() -> Router<AdminState> {
    Router::new()
        .route("/outbox/stats", get(handlers::outbox_stats))
        .route("/dead-letters", get(handlers::list_dead_letters))
        .route("/dead-letters/:id", delete(handlers::discard_dead_letter))
        .route("/dead-letters/:id/requeue", post(handlers::requeue_dead_letter))
        .route("/leases", get(handlers::list_leases))
        .route("/agents", get(handlers::list_agents))
}

/// Serve until `shutdown` fires.
pub async fn serve(listener: TcpListener, state: AdminState, shutdown: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Admin API listening");
    }
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Standard API response wrapper.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}
