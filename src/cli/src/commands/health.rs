//! Health check command.
//!
//! Queries the `/health` endpoint and displays component status.

use anyhow::Result;
use clap::Args;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Include detailed component checks
    #[arg(short, long)]
    detailed: bool,
}

pub async fn execute(args: HealthArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health: serde_json::Value = client.get_raw("/health").await?;

    match format {
        OutputFormat::Table => {
            let status = health
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");

            output::print_header("Agent Health");
            output::print_detail("Status", &output::status_label(status));
            output::print_detail("Admin URL", client.base_url());

            if let Some(service) = health.get("service").and_then(|v| v.as_str()) {
                output::print_detail("Service", service);
            }
            if let Some(version) = health.get("version").and_then(|v| v.as_str()) {
                output::print_detail("Version", version);
            }
            if let Some(uptime) = health.get("uptime_secs").and_then(|v| v.as_u64()) {
                output::print_detail("Uptime", &format!("{}s", uptime));
            }

            if args.detailed {
                if let Some(components) = health.get("components").and_then(|v| v.as_array()) {
                    output::print_header("Components");
                    for comp in components {
                        let name = comp.get("name").and_then(|v| v.as_str()).unwrap_or("?");
                        let comp_status = comp.get("status").and_then(|v| v.as_str()).unwrap_or("?");
                        let message = comp.get("message").and_then(|v| v.as_str()).unwrap_or("");
                        output::print_detail(name, &format!("{} {}", output::status_label(comp_status), message));
                    }
                }
            }

            match status {
                "healthy" => output::print_success("All components operational"),
                "degraded" => output::print_warning("Agent is degraded"),
                other => output::print_error(&format!("Agent status: {}", other)),
            }
            Ok(())
        }
        _ => output::print_item(&health, format),
    }
}
