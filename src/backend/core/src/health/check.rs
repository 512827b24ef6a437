//! Health status types.
//!
//! - **Healthy**: component is fully operational
//! - **Degraded**: operational with issues (backlog growing, no shards held)
//! - **Unhealthy**: not operational
//!
//! ```rust,ignore
//! let outbox = ComponentHealth::healthy("event_log").with_metadata("pending", 12);
//! let report = HealthReport::new("relay-agent").with_component(outbox);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Health status of a component or the entire agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Healthy or degraded.
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// The worse of the two.
    pub fn combine(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }

    pub fn to_http_status(&self) -> u16 {
        match self {
            Self::Healthy | Self::Degraded => 200,
            Self::Unhealthy => 503,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health information for a single component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Latency of the check in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,

    pub checked_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,

    /// Present only when unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn with_initial(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
            message: None,
            latency_ms: None,
            checked_at: Utc::now(),
            metadata: HashMap::new(),
            error: None,
        }
    }

    pub fn healthy(name: impl Into<String>) -> Self {
        Self::with_initial(name, HealthStatus::Healthy)
    }

    pub fn degraded(name: impl Into<String>) -> Self {
        Self::with_initial(name, HealthStatus::Degraded)
    }

    pub fn unhealthy(name: impl Into<String>) -> Self {
        Self::with_initial(name, HealthStatus::Unhealthy)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = Some(latency.as_millis() as u64);
        self
    }

    /// Add an error message (sets status to Unhealthy).
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.status = HealthStatus::Unhealthy;
        self.error = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), v);
        }
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }
}

/// Aggregated health report for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall status, the worst component status
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentHealth>,

    pub summary: HealthSummary,
}

impl HealthReport {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            service: service.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            uptime_secs: None,
            components: Vec::new(),
            summary: HealthSummary::default(),
        }
    }

    pub fn with_component(self, component: ComponentHealth) -> Self {
        self.with_components(vec![component])
    }

    pub fn with_components(mut self, components: Vec<ComponentHealth>) -> Self {
        for component in components {
            self.status = self.status.combine(component.status);
            self.components.push(component);
        }
        self.update_summary();
        self
    }

    pub fn with_uptime(mut self, uptime: Duration) -> Self {
        self.uptime_secs = Some(uptime.as_secs());
        self
    }

    pub fn is_operational(&self) -> bool {
        self.status.is_operational()
    }

    pub fn http_status(&self) -> u16 {
        self.status.to_http_status()
    }

    pub fn get_component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.name == name)
    }

    fn update_summary(&mut self) {
        let mut summary = HealthSummary {
            total: self.components.len(),
            ..Default::default()
        };
        for component in &self.components {
            match component.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
            }
        }
        self.summary = summary;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
}

/// Liveness probe response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub alive: bool,
    pub service: String,
    pub timestamp: DateTime<Utc>,
}

impl LivenessResponse {
    pub fn alive(service: impl Into<String>) -> Self {
        Self {
            alive: true,
            service: service.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Readiness probe response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub service: String,
    pub timestamp: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unready_components: Vec<String>,
}

impl ReadinessResponse {
    pub fn from_health_report(report: &HealthReport) -> Self {
        let unready_components: Vec<String> = report
            .components
            .iter()
            .filter(|c| !c.status.is_operational())
            .map(|c| c.name.clone())
            .collect();

        Self {
            ready: unready_components.is_empty(),
            service: report.service.clone(),
            timestamp: Utc::now(),
            reason: (!unready_components.is_empty())
                .then(|| "One or more components are unhealthy".to_string()),
            unready_components,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_combine() {
        use HealthStatus::*;
        assert_eq!(Healthy.combine(Healthy), Healthy);
        assert_eq!(Healthy.combine(Degraded), Degraded);
        assert_eq!(Degraded.combine(Unhealthy), Unhealthy);
    }

    #[test]
    fn test_report_takes_worst_status() {
        let report = HealthReport::new("relay-agent").with_components(vec![
            ComponentHealth::healthy("event_log"),
            ComponentHealth::degraded("leases").with_message("no shards"),
        ]);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.summary.degraded, 1);
        assert_eq!(report.http_status(), 200);
        assert!(ReadinessResponse::from_health_report(&report).ready);
    }

    #[test]
    fn test_unhealthy_component_fails_readiness() {
        let report = HealthReport::new("relay-agent")
            .with_component(ComponentHealth::healthy("leases"))
            .with_component(ComponentHealth::healthy("event_log").with_error("connection refused"));

        assert_eq!(report.http_status(), 503);
        let readiness = ReadinessResponse::from_health_report(&report);
        assert!(!readiness.ready);
        assert_eq!(readiness.unready_components, vec!["event_log".to_string()]);
    }
}
