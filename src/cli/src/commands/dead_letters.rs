//! Dead-letter inspection and recovery.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum DeadLetterCommands {
    /// List dead-lettered events, newest first
    List {
        /// Maximum number of results
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Append a dead-lettered event again as a fresh pending event
    Requeue {
        /// Sequence id of the dead-lettered event
        id: i64,
    },

    /// Drop a dead-lettered event for good
    Discard {
        id: i64,

        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Debug, Deserialize, Serialize)]
struct EntityRef {
    entity_type: String,
    entity_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct DeadLetter {
    id: i64,
    shard: u32,
    entity: EntityRef,
    kind: String,
    #[serde(default)]
    routing_key: Option<String>,
    created_at: DateTime<Utc>,
    retry_count: u32,
    reason: String,
    error: String,
    dead_lettered_at: DateTime<Utc>,
}

#[derive(Tabled)]
struct DeadLetterRow {
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Entity")]
    entity: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Shard")]
    shard: u32,
    #[tabled(rename = "Retries")]
    retries: u32,
    #[tabled(rename = "Reason")]
    reason: String,
    #[tabled(rename = "Error")]
    error: String,
    #[tabled(rename = "Dead-lettered")]
    at: String,
}

impl From<&DeadLetter> for DeadLetterRow {
    fn from(d: &DeadLetter) -> Self {
        Self {
            id: d.id,
            entity: format!("{}:{}", d.entity.entity_type, d.entity.entity_id),
            kind: d.kind.clone(),
            shard: d.shard,
            retries: d.retry_count,
            reason: d.reason.clone(),
            error: truncate(&d.error, 48),
            at: output::short_time(&d.dead_lettered_at),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct RequeueResponse {
    original_id: i64,
    new_id: i64,
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

pub async fn execute(cmd: DeadLetterCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        DeadLetterCommands::List { limit } => {
            let records: Vec<DeadLetter> = client.get(&format!("/v1/dead-letters?limit={}", limit)).await?;
            let rows: Vec<DeadLetterRow> = records.iter().map(DeadLetterRow::from).collect();
            output::print_list(&rows, &records, format)?;
        }

        DeadLetterCommands::Requeue { id } => {
            let resp: RequeueResponse = client.post(&format!("/v1/dead-letters/{}/requeue", id)).await?;
            match format {
                OutputFormat::Table => output::print_success(&format!(
                    "Dead letter {} requeued as event {}",
                    resp.original_id, resp.new_id
                )),
                _ => output::print_item(&resp, format)?,
            }
        }

        DeadLetterCommands::Discard { id, force } => {
            if !force {
                output::print_warning(&format!(
                    "This permanently drops dead letter {}. Use --force to confirm.",
                    id
                ));
                return Ok(());
            }
            let resp: serde_json::Value = client.delete(&format!("/v1/dead-letters/{}", id)).await?;
            match format {
                OutputFormat::Table => output::print_success(&format!("Dead letter {} discarded", id)),
                _ => output::print_item(&resp, format)?,
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 8), "abcde...");
    }

    #[test]
    fn test_row_from_record() {
        let record: DeadLetter = serde_json::from_value(serde_json::json!({
            "id": 7,
            "shard": 3,
            "entity": { "entity_type": "Book", "entity_id": "42" },
            "kind": "update",
            "routing_key": null,
            "created_at": "2024-01-01T00:00:00Z",
            "retry_count": 5,
            "reason": "retries_exhausted",
            "error": "timeout: index did not answer",
            "dead_lettered_at": "2024-01-01T00:05:00Z"
        }))
        .unwrap();

        let row = DeadLetterRow::from(&record);
        assert_eq!(row.entity, "Book:42");
        assert_eq!(row.retries, 5);
        assert_eq!(row.at, "2024-01-01 00:05:00");
    }
}
