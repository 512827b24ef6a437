//! Admin API tests.
//!
//! Each test serves the router on an ephemeral port and talks to it over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use relay_core::api::{serve, AdminState};
use relay_core::clock::ManualClock;
use relay_core::health::{EventLogHealthChecker, HealthService};
use relay_core::lease::{AgentId, Fence, InMemoryLeaseStore, LeaseStore, ShardId};
use relay_core::outbox::{
    DeadLetterEntry, DeadLetterReason, EventId, InMemoryOutboxStore, NewEvent, OutboxStore,
};
use relay_core::telemetry::MetricsRegistry;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test Utilities
// ============================================================================

struct TestServer {
    base: String,
    client: reqwest::Client,
    leases: Arc<InMemoryLeaseStore>,
    outbox: Arc<InMemoryOutboxStore>,
    shutdown: CancellationToken,
}

impl TestServer {
    async fn start() -> Self {
        let clock = ManualClock::starting_now();
        let leases = Arc::new(InMemoryLeaseStore::new(clock.clone()));
        let outbox = Arc::new(InMemoryOutboxStore::new(1, leases.clone(), clock.clone()));

        let health = HealthService::new("relay-test", Duration::from_secs(1))
            .with_checker(Arc::new(EventLogHealthChecker::new(outbox.clone(), clock.clone())));
        let state = AdminState {
            outbox: outbox.clone(),
            leases: leases.clone(),
            health: Arc::new(health),
            metrics: MetricsRegistry::disabled(),
            clock: clock.clone(),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, state, shutdown.clone()));

        Self {
            base: format!("http://{}", addr),
            client: reqwest::Client::new(),
            leases,
            outbox,
            shutdown,
        }
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let response = self.client.get(format!("{}{}", self.base, path)).send().await.unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    /// Append an event and dead-letter it under a fresh agent's lease.
    async fn dead_letter_one(&self, entity_id: &str) -> EventId {
        let agent = AgentId::new();
        self.leases
            .register_agent(agent, "seeder", Duration::from_secs(60))
            .await
            .unwrap();
        let granted = self
            .leases
            .acquire(agent, &[ShardId(0)], Duration::from_secs(30))
            .await
            .unwrap();
        let fence = Fence::from_grants(agent, &granted.granted);

        let id = self.outbox.append(NewEvent::update("Book", entity_id)).await.unwrap();
        self.outbox.claim(&fence, 10, Duration::from_secs(60)).await.unwrap();
        self.outbox
            .dead_letter(
                &fence,
                &[DeadLetterEntry {
                    id,
                    reason: DeadLetterReason::Validation,
                    error: "malformed: bad mapping".into(),
                }],
            )
            .await
            .unwrap();
        self.leases.unregister_agent(agent).await.unwrap();
        id
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ============================================================================
// Health and Metrics
// ============================================================================

#[tokio::test]
async fn test_health_endpoints() {
    let server = TestServer::start().await;

    let (status, body) = server.get("/health/live").await;
    assert_eq!(status, 200);
    assert_eq!(body["alive"], true);
    assert_eq!(body["service"], "relay-test");

    let (status, body) = server.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["components"][0]["name"], "event_log");

    let (status, body) = server.get("/health/ready").await;
    assert_eq!(status, 200);
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn test_metrics_endpoint_serves_text() {
    let server = TestServer::start().await;

    let response = server
        .client
        .get(format!("{}/metrics", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/plain"));
}

// ============================================================================
// Outbox and Dead Letters
// ============================================================================

#[tokio::test]
async fn test_outbox_stats() {
    let server = TestServer::start().await;
    server.outbox.append(NewEvent::add("Book", "1")).await.unwrap();
    server.outbox.append(NewEvent::add("Book", "2")).await.unwrap();
    server.dead_letter_one("3").await;

    let (status, body) = server.get("/v1/outbox/stats").await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["pending"], 2);
    assert_eq!(body["data"]["dead_lettered"], 1);
}

#[tokio::test]
async fn test_list_and_requeue_dead_letter() {
    let server = TestServer::start().await;
    let id = server.dead_letter_one("9").await;

    let (status, body) = server.get("/v1/dead-letters").await;
    assert_eq!(status, 200);
    let records = body["data"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["id"], id.0);
    assert_eq!(records[0]["reason"], "validation");
    assert_eq!(records[0]["entity"]["entity_id"], "9");

    let response = server
        .client
        .post(format!("{}/v1/dead-letters/{}/requeue", server.base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["original_id"], id.0);
    assert!(body["data"]["new_id"].as_i64().unwrap() > id.0);

    let stats = server.outbox.stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.dead_lettered, 0);
}

#[tokio::test]
async fn test_discard_dead_letter() {
    let server = TestServer::start().await;
    let id = server.dead_letter_one("5").await;

    let url = format!("{}/v1/dead-letters/{}", server.base, id);
    let response = server.client.delete(&url).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(server.outbox.list_dead_letters(10).await.unwrap().is_empty());

    let response = server.client.delete(&url).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error_code"], "RECORD_NOT_FOUND");
}

#[tokio::test]
async fn test_zero_limit_is_rejected() {
    let server = TestServer::start().await;

    let (status, body) = server.get("/v1/dead-letters?limit=0").await;
    assert_eq!(status, 422);
    assert_eq!(body["error_code"], "VALIDATION_ERROR");
}

// ============================================================================
// Leases and Agents
// ============================================================================

#[tokio::test]
async fn test_lease_and_agent_tables() {
    let server = TestServer::start().await;
    let agent = AgentId::new();
    server
        .leases
        .register_agent(agent, "indexer-1", Duration::from_secs(60))
        .await
        .unwrap();
    server
        .leases
        .acquire(agent, &[ShardId(0)], Duration::from_secs(30))
        .await
        .unwrap();

    let (status, body) = server.get("/v1/leases").await;
    assert_eq!(status, 200);
    let leases = body["data"].as_array().unwrap();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0]["shard"], 0);
    assert_eq!(leases[0]["epoch"], 1);
    assert_eq!(leases[0]["live"], true);

    let (status, body) = server.get("/v1/agents").await;
    assert_eq!(status, 200);
    let agents = body["data"].as_array().unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["name"], "indexer-1");
    assert_eq!(agents[0]["alive"], true);
    assert_eq!(agents[0]["shards"], serde_json::json!([0]));
}
