//! Read-optimized discovery layer over the registry.
//!
//! Discovery answers "who can serve X right now" from a short-lived cache so
//! hot routing paths do not scan the registry on every request. Entries expire
//! lazily at read time; there is no background refresh task.
use std::time::{Duration, Instant};

use scc::HashMap;

use crate::core::{instance::ServiceInstance, registry::ServiceRegistry};
use std::sync::Arc;

#[derive(Clone)]
struct CacheEntry {
    instances: Vec<ServiceInstance>,
    fetched_at: Instant,
}

impl CacheEntry {
    fn fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

/// Caching facade over [`ServiceRegistry`] lookups.
///
/// Within the TTL a cached snapshot is returned verbatim, including snapshots
/// of instances the registry has since retired; staleness up to the TTL is the
/// accepted trade-off.
pub struct ServiceDiscovery {
    registry: Arc<ServiceRegistry>,
    ttl: Duration,
    by_name: HashMap<String, CacheEntry>,
    by_tag: HashMap<String, CacheEntry>,
}

impl ServiceDiscovery {
    pub fn new(registry: Arc<ServiceRegistry>, ttl: Duration) -> Self {
        Self {
            registry,
            ttl,
            by_name: HashMap::new(),
            by_tag: HashMap::new(),
        }
    }

    /// Usable instances of a logical service, served from cache within the TTL.
    pub fn discover(&self, service_name: &str) -> Vec<ServiceInstance> {
        if let Some(cached) = self.by_name.read_sync(service_name, |_, entry| {
            entry.fresh(self.ttl).then(|| entry.instances.clone())
        }) {
            if let Some(instances) = cached {
                return instances;
            }
        }

        let instances = self.registry.services_by_name(service_name);
        self.store(&self.by_name, service_name, instances.clone());
        instances
    }

    /// Usable instances carrying a tag, served from cache within the TTL.
    pub fn discover_by_tag(&self, tag: &str) -> Vec<ServiceInstance> {
        if let Some(cached) = self.by_tag.read_sync(tag, |_, entry| {
            entry.fresh(self.ttl).then(|| entry.instances.clone())
        }) {
            if let Some(instances) = cached {
                return instances;
            }
        }

        let instances = self.registry.services_by_tag(tag);
        self.store(&self.by_tag, tag, instances.clone());
        instances
    }

    /// Drop cached entries for one service name, or everything when `None`.
    ///
    /// Tag caches are always cleared wholesale: membership of a tag cannot be
    /// derived from a service name alone.
    pub fn invalidate(&self, service_name: Option<&str>) {
        match service_name {
            Some(name) => {
                self.by_name.remove_sync(name);
                self.by_tag.clear_sync();
                tracing::debug!("Discovery cache invalidated for service {}", name);
            }
            None => {
                self.by_name.clear_sync();
                self.by_tag.clear_sync();
                tracing::debug!("Discovery cache fully invalidated");
            }
        }
    }

    fn store(&self, cache: &HashMap<String, CacheEntry>, key: &str, instances: Vec<ServiceInstance>) {
        let entry = CacheEntry {
            instances,
            fetched_at: Instant::now(),
        };
        // Whole-entry replacement; concurrent refreshes of the same key are
        // idempotent enough that last-writer-wins is fine.
        match cache.entry_sync(key.to_string()) {
            scc::hash_map::Entry::Occupied(mut slot) => {
                *slot.get_mut() = entry;
            }
            scc::hash_map::Entry::Vacant(slot) => {
                slot.insert_entry(entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RegistrySettings,
        core::instance::{Endpoint, HealthState},
    };

    fn healthy_instance(id: &str, service: &str, registry: &ServiceRegistry) {
        let instance = ServiceInstance::new(
            id,
            service,
            "1.0.0",
            Endpoint::new("10.0.0.5", 9000, "http").unwrap(),
        );
        registry.register(instance).unwrap();
        registry.update_status(id, HealthState::Healthy).unwrap();
    }

    #[test]
    fn test_discover_serves_stale_snapshot_within_ttl() {
        let registry = Arc::new(ServiceRegistry::new(RegistrySettings::default()));
        let discovery = ServiceDiscovery::new(registry.clone(), Duration::from_secs(30));

        healthy_instance("orders-1", "orders", &registry);
        assert_eq!(discovery.discover("orders").len(), 1);

        // The registry change is invisible until the entry expires.
        registry.deregister("orders-1").unwrap();
        assert_eq!(discovery.discover("orders").len(), 1);
    }

    #[test]
    fn test_discover_refetches_after_expiry() {
        let registry = Arc::new(ServiceRegistry::new(RegistrySettings::default()));
        let discovery = ServiceDiscovery::new(registry.clone(), Duration::from_secs(0));

        healthy_instance("orders-1", "orders", &registry);
        assert_eq!(discovery.discover("orders").len(), 1);

        registry.deregister("orders-1").unwrap();
        assert!(discovery.discover("orders").is_empty());
    }

    #[test]
    fn test_invalidate_single_service() {
        let registry = Arc::new(ServiceRegistry::new(RegistrySettings::default()));
        let discovery = ServiceDiscovery::new(registry.clone(), Duration::from_secs(30));

        healthy_instance("orders-1", "orders", &registry);
        assert_eq!(discovery.discover("orders").len(), 1);

        registry.deregister("orders-1").unwrap();
        discovery.invalidate(Some("orders"));
        assert!(discovery.discover("orders").is_empty());
    }

    #[test]
    fn test_discover_by_tag_cached_independently() {
        let registry = Arc::new(ServiceRegistry::new(RegistrySettings::default()));
        let discovery = ServiceDiscovery::new(registry.clone(), Duration::from_secs(30));

        let instance = ServiceInstance::new(
            "orders-1",
            "orders",
            "1.0.0",
            Endpoint::new("10.0.0.5", 9000, "http").unwrap(),
        )
        .with_tag("canary");
        registry.register(instance).unwrap();
        registry
            .update_status("orders-1", HealthState::Healthy)
            .unwrap();

        assert_eq!(discovery.discover_by_tag("canary").len(), 1);
        assert!(discovery.discover_by_tag("stable").is_empty());
    }
}
