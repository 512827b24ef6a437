//! Shard lease table.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Debug, Deserialize, Serialize)]
struct Lease {
    shard: u32,
    owner: Option<String>,
    epoch: u64,
    expires_at: Option<DateTime<Utc>>,
    live: bool,
}

#[derive(Tabled)]
struct LeaseRow {
    #[tabled(rename = "Shard")]
    shard: u32,
    #[tabled(rename = "Owner")]
    owner: String,
    #[tabled(rename = "Epoch")]
    epoch: u64,
    #[tabled(rename = "Expires")]
    expires: String,
    #[tabled(rename = "State")]
    state: String,
}

impl From<&Lease> for LeaseRow {
    fn from(l: &Lease) -> Self {
        let state = match (&l.owner, l.live) {
            (Some(_), true) => "live",
            (Some(_), false) => "expired",
            (None, _) => "free",
        };
        Self {
            shard: l.shard,
            owner: l.owner.clone().unwrap_or_else(|| "-".into()),
            epoch: l.epoch,
            expires: l.expires_at.as_ref().map(output::short_time).unwrap_or_else(|| "-".into()),
            state: output::status_label(state),
        }
    }
}

pub async fn execute(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let leases: Vec<Lease> = client.get("/v1/leases").await?;
    let rows: Vec<LeaseRow> = leases.iter().map(LeaseRow::from).collect();
    output::print_list(&rows, &leases, format)?;

    if matches!(format, OutputFormat::Table) && !leases.is_empty() {
        let live = leases.iter().filter(|l| l.live).count();
        output::print_info(&format!("{} of {} shards leased", live, leases.len()));
    }
    Ok(())
}
