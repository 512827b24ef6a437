//! Prometheus metrics.
//!
//! Engine code records through the `metrics` facade macros; this module only
//! installs the Prometheus recorder and describes the relay's metric names.
//! Without an installed recorder every macro call is a no-op, which is what
//! tests rely on.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Histogram buckets (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
}

/// Handle used to render the scrape body.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// Registry that renders nothing.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the Prometheus recorder.
///
/// # Errors
///
/// Fails on invalid buckets or if a recorder is already installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new().add_global_label("service", service_name);
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = builder.install_recorder()?;
    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    // Event flow
    describe_counter!("relay_events_claimed_total", "Events claimed from the outbox");
    describe_counter!(
        "relay_events_acknowledged_total",
        "Events deleted after successful delivery or coalescing"
    );
    describe_counter!("relay_events_retried_total", "Events released for a later retry");
    describe_counter!("relay_events_dead_lettered_total", "Events moved to the dead-letter table");

    // Scheduler
    describe_counter!("relay_cycles_total", "Polling cycles by outcome");
    describe_histogram!("relay_cycle_duration_seconds", "Wall time of one polling cycle");
    describe_gauge!("relay_poll_interval_seconds", "Current adaptive poll interval");

    // Dispatch
    describe_histogram!(
        "relay_dispatch_duration_seconds",
        "Index write latency per operation, by backend"
    );

    // Leases
    describe_gauge!("relay_leased_shards", "Shards currently leased by this agent");
    describe_counter!("relay_lease_lost_total", "Leases lost to expiry, reaping or takeover");

    // Errors
    describe_counter!("relay_errors_total", "Errors by code and severity");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_registry_renders_nothing() {
        let config = MetricsConfig {
            enabled: false,
            ..Default::default()
        };
        let registry = init_metrics(&config, "relay-test").unwrap();
        assert!(!registry.is_enabled());
        assert_eq!(registry.render(), "");
    }

    #[test]
    fn test_default_buckets_are_sorted() {
        let buckets = MetricsConfig::default().duration_buckets;
        assert!(buckets.windows(2).all(|w| w[0] < w[1]));
    }
}
