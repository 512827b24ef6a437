//! Outbox backlog counts.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Debug, Deserialize, Serialize)]
struct OutboxStats {
    pending: u64,
    claimed: u64,
    processing: u64,
    failed: u64,
    dead_lettered: u64,
    oldest_pending_at: Option<DateTime<Utc>>,
}

pub async fn execute(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let stats: OutboxStats = client.get("/v1/outbox/stats").await?;

    match format {
        OutputFormat::Table => {
            output::print_header("Outbox");
            output::print_detail("Pending", &stats.pending.to_string());
            output::print_detail("Claimed", &stats.claimed.to_string());
            output::print_detail("Processing", &stats.processing.to_string());
            output::print_detail("Waiting for retry", &stats.failed.to_string());
            output::print_detail("Dead-lettered", &stats.dead_lettered.to_string());
            if let Some(oldest) = &stats.oldest_pending_at {
                let age = Utc::now().signed_duration_since(*oldest);
                output::print_detail(
                    "Oldest pending",
                    &format!("{} ({}s ago)", output::short_time(oldest), age.num_seconds().max(0)),
                );
            }
            if stats.dead_lettered > 0 {
                output::print_warning("Dead letters need attention: see `relayctl dead-letters list`");
            }
            Ok(())
        }
        _ => output::print_item(&stats, format),
    }
}
