//! relayctl - operator CLI for relay agents.
//!
//! Talks to one agent's admin API to inspect the outbox backlog, leases and
//! agents, and to recover dead-lettered events.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{agents, config, dead_letters, health, leases, stats};
use output::OutputFormat;

/// relayctl - operate a relay outbox deployment
#[derive(Parser)]
#[command(
    name = "relayctl",
    version,
    about = "Operate relay outbox agents",
    long_about = "Inspect outbox backlog, shard leases and agents, and recover dead-lettered events.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Admin API URL of any agent
    #[arg(long, global = true, env = "RELAY_API_URL")]
    api_url: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Outbox backlog counts
    Stats,

    /// Dead-letter inspection and recovery
    #[command(subcommand)]
    DeadLetters(dead_letters::DeadLetterCommands),

    /// Shard lease table
    Leases,

    /// Registered agents and the shards they hold
    Agents,

    /// Check agent health
    Health(health::HealthArgs),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let api_url = cli
        .api_url
        .clone()
        .or_else(config::load_api_url)
        .unwrap_or_else(|| "http://localhost:8080".to_string());

    let client = client::ApiClient::new(&api_url)?;
    let format = cli.output;

    let result = match cli.command {
        Commands::Stats => stats::execute(&client, format).await,
        Commands::DeadLetters(cmd) => dead_letters::execute(cmd, &client, format).await,
        Commands::Leases => leases::execute(&client, format).await,
        Commands::Agents => agents::execute(&client, format).await,
        Commands::Health(args) => health::execute(args, &client, format).await,
        Commands::Config(cmd) => config::execute(cmd, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
