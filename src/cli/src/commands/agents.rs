//! Agent registry.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Debug, Deserialize, Serialize)]
struct Agent {
    id: String,
    name: String,
    registered_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    alive: bool,
    #[serde(default)]
    shards: Vec<u32>,
}

#[derive(Tabled)]
struct AgentRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Shards")]
    shards: String,
    #[tabled(rename = "Last Heartbeat")]
    last_heartbeat: String,
}

impl From<&Agent> for AgentRow {
    fn from(a: &Agent) -> Self {
        Self {
            id: a.id.chars().take(8).collect(),
            name: a.name.clone(),
            status: output::status_label(if a.alive { "alive" } else { "dead" }),
            shards: format_shards(&a.shards),
            last_heartbeat: output::short_time(&a.last_heartbeat),
        }
    }
}

fn format_shards(shards: &[u32]) -> String {
    if shards.is_empty() {
        return "-".into();
    }
    shards.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
}

pub async fn execute(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let agents: Vec<Agent> = client.get("/v1/agents").await?;
    let rows: Vec<AgentRow> = agents.iter().map(AgentRow::from).collect();
    output::print_list(&rows, &agents, format)
}
