//! Active health probing of registered instances.
//!
//! Each cycle probes every instance's health-check URL in parallel and writes
//! the outcome back to the registry. Probes only ever set the health state;
//! they never refresh heartbeats, so a probe-healthy but silent instance
//! still ages out of the registry.
use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio::time::sleep;

use crate::{
    config::HealthCheckSettings,
    core::{
        instance::{HealthState, ServiceInstance},
        registry::ServiceRegistry,
    },
    metrics,
    ports::http_client::HttpClient,
    utils::graceful_shutdown::ShutdownToken,
};

/// Background prober driving registry health states.
pub struct HealthChecker {
    registry: Arc<ServiceRegistry>,
    http_client: Arc<dyn HttpClient>,
    settings: HealthCheckSettings,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        http_client: Arc<dyn HttpClient>,
        settings: HealthCheckSettings,
    ) -> Self {
        Self {
            registry,
            http_client,
            settings,
        }
    }

    /// Run the probe loop until shutdown.
    pub async fn run(&self, mut shutdown: ShutdownToken) {
        if !self.settings.enabled {
            tracing::info!("Health checking is disabled");
            return;
        }

        let interval = Duration::from_secs(self.settings.interval_secs);
        tracing::info!(
            "Starting health checker with interval: {}s, timeout: {}s",
            self.settings.interval_secs,
            self.settings.timeout_secs
        );

        loop {
            // Sleep first so freshly registered instances get a grace period.
            tokio::select! {
                _ = shutdown.wait_for_shutdown() => {
                    tracing::info!("Health checker shutting down");
                    return;
                }
                _ = sleep(interval) => {}
            }

            self.run_cycle().await;
            tracing::debug!("Health check cycle completed");
        }
    }

    /// One full probe cycle over a registry snapshot.
    pub async fn run_cycle(&self) {
        let instances = self.registry.all_instances();
        if instances.is_empty() {
            return;
        }

        tracing::debug!("Probing {} registered instances", instances.len());
        let probes = instances
            .into_iter()
            .map(|instance| self.probe_instance(instance));
        join_all(probes).await;
    }

    /// Probe one instance and record the outcome. Any error counts as an
    /// unhealthy answer; one instance's failure never affects the others.
    async fn probe_instance(&self, instance: ServiceInstance) {
        let is_healthy = match self
            .http_client
            .probe(&instance.health_check_url, self.settings.timeout_secs)
            .await
        {
            Ok(is_healthy) => is_healthy,
            Err(e) => {
                tracing::debug!("Probe of {} failed: {}", instance.health_check_url, e);
                false
            }
        };

        metrics::set_instance_health(&instance.id, is_healthy);

        let target = if is_healthy {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        };
        if instance.health == target {
            return;
        }

        if is_healthy {
            tracing::info!("Instance {} probed healthy", instance.id);
        } else {
            tracing::warn!("Instance {} probed unhealthy", instance.id);
        }
        // The instance may have been deregistered while the probe ran.
        if let Err(e) = self.registry.update_status(&instance.id, target) {
            tracing::debug!("Probe result for {} dropped: {}", instance.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::body::Body as AxumBody;
    use hyper::{Request, Response};

    use super::*;
    use crate::{
        config::RegistrySettings,
        core::instance::Endpoint,
        ports::http_client::{ForwardError, ForwardResult},
    };

    struct MockHttpClient {
        verdicts: Mutex<std::collections::HashMap<String, ForwardResult<bool>>>,
    }

    impl MockHttpClient {
        fn new() -> Self {
            Self {
                verdicts: Mutex::new(std::collections::HashMap::new()),
            }
        }

        fn set(&self, url: &str, verdict: ForwardResult<bool>) {
            self.verdicts.lock().unwrap().insert(url.to_string(), verdict);
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn forward(&self, _req: Request<AxumBody>) -> ForwardResult<Response<AxumBody>> {
            Err(ForwardError::Connection("not used in tests".to_string()))
        }

        async fn probe(&self, url: &str, _timeout_secs: u64) -> ForwardResult<bool> {
            match self.verdicts.lock().unwrap().remove(url) {
                Some(verdict) => verdict,
                None => Ok(false),
            }
        }
    }

    fn settings() -> HealthCheckSettings {
        HealthCheckSettings {
            enabled: true,
            interval_secs: 30,
            timeout_secs: 5,
            default_path: "/health".to_string(),
        }
    }

    fn register(registry: &ServiceRegistry, id: &str, port: u16) {
        registry
            .register(ServiceInstance::new(
                id,
                "orders",
                "1.0.0",
                Endpoint::new("10.0.0.5", port, "http").unwrap(),
            ))
            .unwrap();
    }

    #[tokio::test]
    async fn test_cycle_promotes_and_demotes() {
        let registry = Arc::new(ServiceRegistry::new(RegistrySettings::default()));
        register(&registry, "orders-1", 9000);
        register(&registry, "orders-2", 9001);
        registry
            .update_status("orders-2", HealthState::Healthy)
            .unwrap();

        let client = Arc::new(MockHttpClient::new());
        client.set("http://10.0.0.5:9000/health", Ok(true));
        client.set("http://10.0.0.5:9001/health", Ok(false));

        let checker = HealthChecker::new(registry.clone(), client, settings());
        checker.run_cycle().await;

        assert_eq!(registry.get("orders-1").unwrap().health, HealthState::Healthy);
        assert_eq!(
            registry.get("orders-2").unwrap().health,
            HealthState::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_probe_error_counts_as_unhealthy() {
        let registry = Arc::new(ServiceRegistry::new(RegistrySettings::default()));
        register(&registry, "orders-1", 9000);
        registry
            .update_status("orders-1", HealthState::Healthy)
            .unwrap();

        let client = Arc::new(MockHttpClient::new());
        client.set("http://10.0.0.5:9000/health", Err(ForwardError::Timeout(5)));

        let checker = HealthChecker::new(registry.clone(), client, settings());
        checker.run_cycle().await;

        assert_eq!(
            registry.get("orders-1").unwrap().health,
            HealthState::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_unchanged_state_does_not_refresh_heartbeat() {
        let registry = Arc::new(ServiceRegistry::new(RegistrySettings::default()));
        register(&registry, "orders-1", 9000);
        registry
            .update_status("orders-1", HealthState::Healthy)
            .unwrap();
        registry.backdate_heartbeat("orders-1", Duration::from_secs(45));

        let client = Arc::new(MockHttpClient::new());
        client.set("http://10.0.0.5:9000/health", Ok(true));

        let checker = HealthChecker::new(registry.clone(), client, settings());
        checker.run_cycle().await;

        // Probe agreed with the current state, so the heartbeat stayed stale.
        let instance = registry.get("orders-1").unwrap();
        assert!(instance.heartbeat_age() >= Duration::from_secs(45));
    }
}
