//! Configuration management.
//!
//! Values come from an optional file (TOML, YAML or JSON by extension) with
//! `RELAY__*` environment variables layered on top, e.g.
//! `RELAY__POLL__BATCH_SIZE=200` or `RELAY__DATABASE__URL=postgres://..`.
//! Durations are humantime strings such as `"250ms"` or `"30s"`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::{
    DispatchConfig, FanoutIndexWriter, HttpIndexConfig, HttpIndexWriter, InMemoryIndex, IndexWriter,
};
use crate::error::{RelayError, Result};
use crate::lease::{LeaseConfig, ShardAssignment};
use crate::retry::RetryPolicy;
use crate::scheduler::PollConfig;
use crate::telemetry::TelemetryConfig;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub lease: LeaseConfig,

    #[serde(default)]
    pub poll: PollConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL. Without one the agent runs on in-memory
    /// stores.
    #[serde(default)]
    pub url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(with = "humantime_serde", default = "default_acquire_timeout")]
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Human-readable agent name, shown in the agent registry
    #[serde(default = "default_agent_name")]
    pub name: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
        }
    }
}

/// Index backend selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexConfig {
    /// In-process document map
    #[default]
    Memory,
    /// Remote index service
    Http(HttpIndexConfig),
    /// Every listed backend must accept each operation
    Fanout { backends: Vec<IndexConfig> },
}

impl IndexConfig {
    /// Construct the configured backend.
    pub fn build_writer(&self) -> Result<Arc<dyn IndexWriter>> {
        Ok(match self {
            Self::Memory => Arc::new(InMemoryIndex::default()),
            Self::Http(http) => Arc::new(HttpIndexWriter::new(http.clone())?),
            Self::Fanout { backends } => Arc::new(FanoutIndexWriter::new(
                backends
                    .iter()
                    .map(IndexConfig::build_writer)
                    .collect::<Result<Vec<_>>>()?,
            )),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_enabled")]
    pub enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-check timeout for `/health`
    #[serde(with = "humantime_serde", default = "default_health_check_timeout")]
    pub health_check_timeout: Duration,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: default_admin_enabled(),
            host: default_host(),
            port: default_port(),
            health_check_timeout: default_health_check_timeout(),
        }
    }
}

// Default value functions
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_acquire_timeout() -> Duration { Duration::from_secs(5) }
fn default_agent_name() -> String { "relay-agent".to_string() }
fn default_admin_enabled() -> bool { true }
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_health_check_timeout() -> Duration { Duration::from_secs(2) }

impl Config {
    /// Load configuration from the environment only.
    pub fn load() -> Result<Self> {
        Self::build(None)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(Some(path.as_ref()))
    }

    fn build(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let poll = &self.poll;
        if poll.batch_size == 0 {
            return Err(RelayError::configuration("poll.batch_size must be greater than zero"));
        }
        if poll.min_interval.is_zero() {
            return Err(RelayError::configuration("poll.min_interval must be greater than zero"));
        }
        if poll.min_interval > poll.max_interval {
            return Err(RelayError::configuration(format!(
                "poll.min_interval ({:?}) exceeds poll.max_interval ({:?})",
                poll.min_interval, poll.max_interval
            )));
        }
        if poll.visibility_timeout <= self.dispatch.operation_timeout {
            return Err(RelayError::configuration(format!(
                "poll.visibility_timeout ({:?}) must exceed dispatch.operation_timeout ({:?})",
                poll.visibility_timeout, self.dispatch.operation_timeout
            )));
        }

        let lease = &self.lease;
        if lease.shard_count == 0 {
            return Err(RelayError::configuration("lease.shard_count must be greater than zero"));
        }
        if lease.heartbeat_failure_threshold == 0 {
            return Err(RelayError::configuration(
                "lease.heartbeat_failure_threshold must be greater than zero",
            ));
        }
        if lease.heartbeat_interval >= lease.lease_duration {
            return Err(RelayError::configuration(format!(
                "lease.heartbeat_interval ({:?}) must be shorter than lease.lease_duration ({:?})",
                lease.heartbeat_interval, lease.lease_duration
            )));
        }
        if let ShardAssignment::Static { shards } = &lease.assignment {
            if shards.is_empty() {
                return Err(RelayError::configuration("static shard assignment lists no shards"));
            }
            if let Some(bad) = shards.iter().find(|s| **s >= lease.shard_count) {
                return Err(RelayError::configuration(format!(
                    "static shard {} is out of range for {} shards",
                    bad, lease.shard_count
                )));
            }
        }

        if self.dispatch.parallelism == 0 {
            return Err(RelayError::configuration("dispatch.parallelism must be greater than zero"));
        }
        if self.retry.max_attempts == 0 {
            return Err(RelayError::configuration("retry.max_attempts must be at least one"));
        }

        validate_index(&self.index)?;

        if let Some(url) = &self.database.url {
            if url.trim().is_empty() {
                return Err(RelayError::configuration("database.url is empty"));
            }
        }

        Ok(())
    }
}

fn validate_index(index: &IndexConfig) -> Result<()> {
    match index {
        IndexConfig::Memory => Ok(()),
        IndexConfig::Http(http) if http.endpoint.trim().is_empty() => {
            Err(RelayError::configuration(format!("index '{}' has no endpoint", http.name)))
        }
        IndexConfig::Http(_) => Ok(()),
        IndexConfig::Fanout { backends } if backends.is_empty() => {
            Err(RelayError::configuration("fanout index lists no backends"))
        }
        IndexConfig::Fanout { backends } => backends.iter().try_for_each(validate_index),
    }
}
