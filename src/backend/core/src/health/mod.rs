//! Health checks for the relay agent, served as Kubernetes-style probes.

mod check;
mod checker;
mod routes;

pub use check::*;
pub use checker::*;
pub use routes::*;

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Runs every registered checker concurrently, each under its own timeout.
pub struct HealthService {
    service: String,
    check_timeout: Duration,
    checkers: Vec<Arc<dyn HealthChecker>>,
    started_at: Instant,
}

impl HealthService {
    pub fn new(service: impl Into<String>, check_timeout: Duration) -> Self {
        Self {
            service: service.into(),
            check_timeout,
            checkers: Vec::new(),
            started_at: Instant::now(),
        }
    }

    pub fn register_checker(&mut self, checker: Arc<dyn HealthChecker>) {
        self.checkers.push(checker);
    }

    pub fn with_checker(mut self, checker: Arc<dyn HealthChecker>) -> Self {
        self.register_checker(checker);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub async fn check_health(&self) -> HealthReport {
        let futures = self.checkers.iter().map(|checker| {
            let timeout = self.check_timeout;
            async move {
                let start = Instant::now();
                match tokio::time::timeout(timeout, checker.check()).await {
                    Ok(health) => health,
                    Err(_) => ComponentHealth::unhealthy(checker.name())
                        .with_error(format!("Health check timed out after {:?}", timeout))
                        .with_latency(start.elapsed()),
                }
            }
        });

        let components = futures::future::join_all(futures).await;

        HealthReport::new(self.service.clone())
            .with_uptime(self.started_at.elapsed())
            .with_components(components)
    }

    pub async fn is_ready(&self) -> bool {
        self.check_health().await.is_operational()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Fixed(&'static str, HealthStatus);

    #[async_trait]
    impl HealthChecker for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        async fn check(&self) -> ComponentHealth {
            let mut health = ComponentHealth::healthy(self.0);
            health.status = self.1;
            health
        }
    }

    struct Hanging;

    #[async_trait]
    impl HealthChecker for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn check(&self) -> ComponentHealth {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ComponentHealth::healthy("hanging")
        }
    }

    #[tokio::test]
    async fn test_aggregates_components() {
        let service = HealthService::new("relay-agent", Duration::from_secs(1))
            .with_checker(Arc::new(Fixed("a", HealthStatus::Healthy)))
            .with_checker(Arc::new(Fixed("b", HealthStatus::Degraded)));

        let report = service.check_health().await;
        assert_eq!(report.components.len(), 2);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(service.is_ready().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_checker_times_out() {
        let service = HealthService::new("relay-agent", Duration::from_millis(50))
            .with_checker(Arc::new(Hanging));

        let report = service.check_health().await;
        let hanging = report.get_component("hanging").unwrap();
        assert_eq!(hanging.status, HealthStatus::Unhealthy);
        assert!(hanging.error.as_deref().unwrap().contains("timed out"));
    }
}
