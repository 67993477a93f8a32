//! Authoritative, in-memory table of live service instances.
//!
//! The registry owns the instance lifecycle: registration, heartbeats,
//! health-state transitions, deregistration, and the background sweep that
//! retires silent instances. Query methods hand out snapshots filtered by the
//! usability predicate; watchers receive ordered, synchronous notifications
//! per service name. All I/O stays outside this module.
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use scc::HashMap;
use thiserror::Error;

use crate::{
    config::RegistrySettings,
    core::instance::{HealthState, ServiceInstance},
    metrics,
    utils::graceful_shutdown::ShutdownToken,
};

/// Errors reported by registry operations. Both variants are normal,
/// reportable outcomes rather than faults.
#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistryError {
    /// An instance with this id is already registered
    #[error("Instance already registered: {0}")]
    Conflict(String),

    /// No instance with this id exists
    #[error("Instance not found: {0}")]
    NotFound(String),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Lifecycle events delivered to watchers of a service name.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A new instance joined the service
    Registered(ServiceInstance),
    /// An instance left the service (snapshot carries the `Stopped` state)
    Deregistered(ServiceInstance),
    /// An instance changed health state
    StatusChanged {
        instance: ServiceInstance,
        previous: HealthState,
    },
}

impl RegistryEvent {
    /// Service name the event belongs to.
    pub fn service_name(&self) -> &str {
        match self {
            RegistryEvent::Registered(i) => &i.service_name,
            RegistryEvent::Deregistered(i) => &i.service_name,
            RegistryEvent::StatusChanged { instance, .. } => &instance.service_name,
        }
    }
}

/// Subscriber interface for registry events.
///
/// Delivery is synchronous and in subscription order; a panicking watcher is
/// logged and isolated, it never poisons delivery to the others.
pub trait RegistryWatcher: Send + Sync {
    fn on_event(&self, event: &RegistryEvent);
}

type WatcherList = Vec<Arc<dyn RegistryWatcher>>;

/// The service registry. Cheap to share behind an `Arc`; every map entry is
/// locked individually so concurrent heartbeats for different instances never
/// contend.
pub struct ServiceRegistry {
    instances: HashMap<String, ServiceInstance>,
    watchers: RwLock<std::collections::HashMap<String, WatcherList>>,
    settings: RegistrySettings,
    health_path: String,
}

impl ServiceRegistry {
    pub fn new(settings: RegistrySettings) -> Self {
        Self {
            instances: HashMap::new(),
            watchers: RwLock::new(std::collections::HashMap::new()),
            settings,
            health_path: "/health".to_string(),
        }
    }

    /// Override the path appended when an instance registers without an
    /// explicit health-check URL.
    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = path.into();
        self
    }

    /// Liveness window used by the usability predicate.
    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.settings.liveness_window_secs)
    }

    /// Register a new instance.
    ///
    /// A duplicate id is a reported `Conflict`, not a fault. An empty
    /// health-check URL is defaulted to the endpoint plus the configured
    /// health path.
    pub fn register(&self, mut instance: ServiceInstance) -> RegistryResult<()> {
        if instance.health_check_url.is_empty() {
            instance.health_check_url =
                format!("{}{}", instance.endpoint.base_url(), self.health_path);
        }

        let snapshot = instance.clone();
        match self.instances.insert_sync(instance.id.clone(), instance) {
            Ok(()) => {
                tracing::info!(
                    "Registered instance {} for service {} at {}",
                    snapshot.id,
                    snapshot.service_name,
                    snapshot.endpoint
                );
                metrics::set_registered_instances(self.instances.len());
                self.notify(RegistryEvent::Registered(snapshot));
                Ok(())
            }
            Err((id, _)) => Err(RegistryError::Conflict(id)),
        }
    }

    /// Deregister an instance: mark it `Stopped`, notify watchers, remove it.
    pub fn deregister(&self, id: &str) -> RegistryResult<()> {
        let snapshot = self.instances.update_sync(id, |_, instance| {
            instance.health = HealthState::Stopped;
            instance.clone()
        });

        match snapshot {
            Some(snapshot) => {
                tracing::info!(
                    "Deregistered instance {} of service {}",
                    snapshot.id,
                    snapshot.service_name
                );
                self.notify(RegistryEvent::Deregistered(snapshot));
                self.instances.remove_sync(id);
                metrics::set_registered_instances(self.instances.len());
                Ok(())
            }
            None => Err(RegistryError::NotFound(id.to_string())),
        }
    }

    /// Set an instance's health state, refreshing its heartbeat.
    ///
    /// A `status_change` event fires only when the state actually changed.
    pub fn update_status(&self, id: &str, state: HealthState) -> RegistryResult<()> {
        let change = self.instances.update_sync(id, |_, instance| {
            let previous = instance.health;
            instance.health = state;
            instance.last_heartbeat = std::time::Instant::now();
            (previous, instance.clone())
        });

        match change {
            Some((previous, instance)) => {
                if previous != state {
                    tracing::debug!(
                        "Instance {} transitioned {} -> {}",
                        instance.id,
                        previous,
                        state
                    );
                    self.notify(RegistryEvent::StatusChanged { instance, previous });
                }
                Ok(())
            }
            None => Err(RegistryError::NotFound(id.to_string())),
        }
    }

    /// Record a liveness signal. An `Unhealthy` instance is transparently
    /// promoted back to `Healthy`.
    pub fn heartbeat(&self, id: &str) -> RegistryResult<()> {
        let promoted = self.instances.update_sync(id, |_, instance| {
            instance.last_heartbeat = std::time::Instant::now();
            if instance.health == HealthState::Unhealthy {
                instance.health = HealthState::Healthy;
                Some(instance.clone())
            } else {
                None
            }
        });

        match promoted {
            Some(Some(instance)) => {
                tracing::info!("Instance {} recovered via heartbeat", instance.id);
                self.notify(RegistryEvent::StatusChanged {
                    instance,
                    previous: HealthState::Unhealthy,
                });
                Ok(())
            }
            Some(None) => Ok(()),
            None => Err(RegistryError::NotFound(id.to_string())),
        }
    }

    /// Snapshot of a single instance regardless of usability.
    pub fn get(&self, id: &str) -> Option<ServiceInstance> {
        self.instances.read_sync(id, |_, instance| instance.clone())
    }

    /// Usable instances of a logical service.
    pub fn services_by_name(&self, name: &str) -> Vec<ServiceInstance> {
        let liveness = self.liveness_window();
        let mut found = Vec::new();
        self.instances.iter_sync(|_, instance| {
            if instance.service_name == name && instance.is_usable(liveness) {
                found.push(instance.clone());
            }
            true
        });
        found
    }

    /// Usable instances carrying a tag.
    pub fn services_by_tag(&self, tag: &str) -> Vec<ServiceInstance> {
        let liveness = self.liveness_window();
        let mut found = Vec::new();
        self.instances.iter_sync(|_, instance| {
            if instance.tags.contains(tag) && instance.is_usable(liveness) {
                found.push(instance.clone());
            }
            true
        });
        found
    }

    /// Snapshot of every registered instance (used by the health checker).
    pub fn all_instances(&self) -> Vec<ServiceInstance> {
        let mut all = Vec::new();
        self.instances.iter_sync(|_, instance| {
            all.push(instance.clone());
            true
        });
        all
    }

    /// Total number of registered instances.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Number of instances currently passing the usability predicate.
    pub fn usable_instance_count(&self) -> usize {
        let liveness = self.liveness_window();
        let mut count = 0;
        self.instances.iter_sync(|_, instance| {
            if instance.is_usable(liveness) {
                count += 1;
            }
            true
        });
        count
    }

    /// Subscribe a watcher to all events of one service name.
    pub fn watch(&self, service_name: &str, watcher: Arc<dyn RegistryWatcher>) {
        let mut watchers = self
            .watchers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        watchers
            .entry(service_name.to_string())
            .or_default()
            .push(watcher);
    }

    /// Remove a previously subscribed watcher (matched by identity).
    pub fn unwatch(&self, service_name: &str, watcher: &Arc<dyn RegistryWatcher>) {
        let mut watchers = self
            .watchers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = watchers.get_mut(service_name) {
            list.retain(|w| !Arc::ptr_eq(w, watcher));
            if list.is_empty() {
                watchers.remove(service_name);
            }
        }
    }

    fn notify(&self, event: RegistryEvent) {
        let subscribers: WatcherList = {
            let watchers = self
                .watchers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match watchers.get(event.service_name()) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        for watcher in subscribers {
            if catch_unwind(AssertUnwindSafe(|| watcher.on_event(&event))).is_err() {
                tracing::warn!(
                    "Registry watcher for service {} panicked; continuing delivery",
                    event.service_name()
                );
            }
        }
    }

    /// One sweep pass: mark silent instances unhealthy, retire prolonged
    /// silence entirely.
    ///
    /// Unlike [`update_status`](Self::update_status) this does not refresh
    /// heartbeats, otherwise a swept instance could never age out.
    pub fn sweep(&self) {
        let unhealthy_after = Duration::from_secs(self.settings.unhealthy_after_secs);
        let deregister_after = Duration::from_secs(self.settings.deregister_after_secs);

        let mut to_mark = Vec::new();
        let mut to_retire = Vec::new();
        self.instances.iter_sync(|id, instance| {
            let age = instance.heartbeat_age();
            if age > deregister_after {
                to_retire.push(id.clone());
            } else if age > unhealthy_after && instance.health == HealthState::Healthy {
                to_mark.push(id.clone());
            }
            true
        });

        for id in to_mark {
            let change = self.instances.update_sync(&id, |_, instance| {
                let previous = instance.health;
                instance.health = HealthState::Unhealthy;
                (previous, instance.clone())
            });
            if let Some((previous, instance)) = change {
                tracing::warn!(
                    "Instance {} marked unhealthy after {}s of heartbeat silence",
                    instance.id,
                    instance.heartbeat_age().as_secs()
                );
                self.notify(RegistryEvent::StatusChanged { instance, previous });
            }
        }

        for id in to_retire {
            tracing::warn!("Retiring instance {} after prolonged heartbeat silence", id);
            if let Err(e) = self.deregister(&id) {
                tracing::debug!("Sweep deregistration of {} skipped: {}", id, e);
            }
        }
    }

    /// Long-running sweep loop. Runs until shutdown; one pass's problems are
    /// logged and never terminate the task.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: ShutdownToken) {
        let interval = Duration::from_secs(self.settings.sweep_interval_secs);
        tracing::info!(
            "Registry sweeper started (interval {}s, unhealthy after {}s, deregister after {}s)",
            self.settings.sweep_interval_secs,
            self.settings.unhealthy_after_secs,
            self.settings.deregister_after_secs
        );

        loop {
            tokio::select! {
                _ = shutdown.wait_for_shutdown() => {
                    tracing::info!("Registry sweeper shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    if catch_unwind(AssertUnwindSafe(|| self.sweep())).is_err() {
                        tracing::error!("Registry sweep pass panicked; loop continues");
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_heartbeat(&self, id: &str, age: Duration) {
        self.instances.update_sync(id, |_, instance| {
            if let Some(past) = std::time::Instant::now().checked_sub(age) {
                instance.last_heartbeat = past;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::core::instance::Endpoint;

    fn instance(id: &str, service: &str) -> ServiceInstance {
        ServiceInstance::new(
            id,
            service,
            "1.0.0",
            Endpoint::new("10.0.0.5", 9000, "http").unwrap(),
        )
    }

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(RegistrySettings::default())
    }

    struct RecordingWatcher {
        seen: Mutex<Vec<String>>,
    }

    impl RecordingWatcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl RegistryWatcher for RecordingWatcher {
        fn on_event(&self, event: &RegistryEvent) {
            let tag = match event {
                RegistryEvent::Registered(i) => format!("register:{}", i.id),
                RegistryEvent::Deregistered(i) => format!("deregister:{}", i.id),
                RegistryEvent::StatusChanged { instance, .. } => {
                    format!("status:{}:{}", instance.id, instance.health)
                }
            };
            self.seen.lock().unwrap().push(tag);
        }
    }

    struct PanickingWatcher;

    impl RegistryWatcher for PanickingWatcher {
        fn on_event(&self, _event: &RegistryEvent) {
            panic!("watcher blew up");
        }
    }

    #[test]
    fn test_register_duplicate_is_conflict() {
        let registry = registry();
        registry.register(instance("orders-1", "orders")).unwrap();

        let err = registry.register(instance("orders-1", "orders")).unwrap_err();
        assert_eq!(err, RegistryError::Conflict("orders-1".to_string()));
    }

    #[test]
    fn test_register_defaults_health_check_url() {
        let registry = registry();
        registry.register(instance("orders-1", "orders")).unwrap();

        let stored = registry.get("orders-1").unwrap();
        assert_eq!(stored.health_check_url, "http://10.0.0.5:9000/health");
    }

    #[test]
    fn test_register_uses_configured_health_path() {
        let registry =
            ServiceRegistry::new(RegistrySettings::default()).with_health_path("/livez");
        registry.register(instance("orders-1", "orders")).unwrap();

        let stored = registry.get("orders-1").unwrap();
        assert_eq!(stored.health_check_url, "http://10.0.0.5:9000/livez");
    }

    #[test]
    fn test_deregister_unknown_is_not_found() {
        let registry = registry();
        let err = registry.deregister("ghost").unwrap_err();
        assert_eq!(err, RegistryError::NotFound("ghost".to_string()));
    }

    #[test]
    fn test_services_by_name_filters_usability() {
        let registry = registry();
        registry.register(instance("orders-1", "orders")).unwrap();
        registry.register(instance("orders-2", "orders")).unwrap();
        registry.register(instance("billing-1", "billing")).unwrap();

        // Starting instances are not usable.
        assert!(registry.services_by_name("orders").is_empty());

        registry
            .update_status("orders-1", HealthState::Healthy)
            .unwrap();
        let usable = registry.services_by_name("orders");
        assert_eq!(usable.len(), 1);
        assert_eq!(usable[0].id, "orders-1");
    }

    #[test]
    fn test_services_by_tag() {
        let registry = registry();
        registry
            .register(instance("orders-1", "orders").with_tag("canary"))
            .unwrap();
        registry
            .update_status("orders-1", HealthState::Healthy)
            .unwrap();

        assert_eq!(registry.services_by_tag("canary").len(), 1);
        assert!(registry.services_by_tag("stable").is_empty());
    }

    #[test]
    fn test_heartbeat_promotes_unhealthy() {
        let registry = registry();
        registry.register(instance("orders-1", "orders")).unwrap();
        registry
            .update_status("orders-1", HealthState::Unhealthy)
            .unwrap();

        registry.heartbeat("orders-1").unwrap();
        assert_eq!(registry.get("orders-1").unwrap().health, HealthState::Healthy);
    }

    #[test]
    fn test_status_change_event_only_on_transition() {
        let registry = registry();
        let watcher = RecordingWatcher::new();
        registry.watch("orders", watcher.clone());

        registry.register(instance("orders-1", "orders")).unwrap();
        registry
            .update_status("orders-1", HealthState::Healthy)
            .unwrap();
        registry
            .update_status("orders-1", HealthState::Healthy)
            .unwrap();
        registry.deregister("orders-1").unwrap();

        assert_eq!(
            watcher.events(),
            vec![
                "register:orders-1".to_string(),
                "status:orders-1:healthy".to_string(),
                "deregister:orders-1".to_string(),
            ]
        );
    }

    #[test]
    fn test_panicking_watcher_is_isolated() {
        let registry = registry();
        let recording = RecordingWatcher::new();
        registry.watch("orders", Arc::new(PanickingWatcher));
        registry.watch("orders", recording.clone());

        registry.register(instance("orders-1", "orders")).unwrap();
        assert_eq!(recording.events(), vec!["register:orders-1".to_string()]);
    }

    #[test]
    fn test_unwatch_stops_delivery() {
        let registry = registry();
        let watcher = RecordingWatcher::new();
        let as_dyn: Arc<dyn RegistryWatcher> = watcher.clone();
        registry.watch("orders", as_dyn.clone());
        registry.unwatch("orders", &as_dyn);

        registry.register(instance("orders-1", "orders")).unwrap();
        assert!(watcher.events().is_empty());
    }

    #[test]
    fn test_sweep_marks_silent_instances_unhealthy() {
        let registry = registry();
        registry.register(instance("orders-1", "orders")).unwrap();
        registry
            .update_status("orders-1", HealthState::Healthy)
            .unwrap();

        registry.backdate_heartbeat("orders-1", Duration::from_secs(90));
        registry.sweep();

        assert_eq!(
            registry.get("orders-1").unwrap().health,
            HealthState::Unhealthy
        );
        assert!(registry.services_by_name("orders").is_empty());
    }

    #[test]
    fn test_sweep_retires_prolonged_silence() {
        let registry = registry();
        registry.register(instance("orders-1", "orders")).unwrap();
        registry
            .update_status("orders-1", HealthState::Healthy)
            .unwrap();

        registry.backdate_heartbeat("orders-1", Duration::from_secs(6 * 60));
        registry.sweep();

        assert!(registry.get("orders-1").is_none());
        assert!(registry.services_by_name("orders").is_empty());
    }
}
