use std::{
    collections::{HashMap, HashSet},
    fmt,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors related to instance construction
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum InstanceError {
    /// Error when the endpoint is structurally invalid
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Result type for instance operations
pub type InstanceResult<T> = Result<T, InstanceError>;

/// Health state of a registered service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Instance registered but not yet probed
    Starting,
    /// Instance is serving traffic
    Healthy,
    /// Instance failed probing or went silent
    Unhealthy,
    /// Instance is deregistering
    Stopped,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Starting => write!(f, "starting"),
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
            HealthState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Network address of one instance: host, port and URL scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// URL scheme used to reach the instance ("http" unless stated otherwise)
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "http".to_string()
}

impl Endpoint {
    /// Build an endpoint, rejecting empty hosts and zero ports.
    pub fn new(host: impl Into<String>, port: u16, protocol: impl Into<String>) -> InstanceResult<Self> {
        let host = host.into();
        if host.is_empty() {
            return Err(InstanceError::InvalidEndpoint("host must not be empty".to_string()));
        }
        if port == 0 {
            return Err(InstanceError::InvalidEndpoint("port must not be zero".to_string()));
        }
        Ok(Self {
            host,
            port,
            protocol: protocol.into(),
        })
    }

    /// Base URL of the instance, e.g. `http://10.0.0.5:9000`.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    /// `host:port` key used for connection accounting.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base_url())
    }
}

/// One running, addressable replica of a named logical service.
///
/// Instances are owned exclusively by the [`ServiceRegistry`](crate::core::registry::ServiceRegistry):
/// created on registration, mutated only through registry operations, removed
/// on deregistration or prolonged heartbeat silence. Values handed out by
/// query methods are snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInstance {
    /// Unique instance identifier
    pub id: String,
    /// Logical service this instance belongs to
    pub service_name: String,
    /// Deployed version of the service
    pub version: String,
    /// Network address
    pub endpoint: Endpoint,
    /// Current health state
    pub health: HealthState,
    /// Free-form metadata (key conventions are up to the embedder)
    pub metadata: HashMap<String, String>,
    /// Tags used for tag-scoped discovery
    pub tags: HashSet<String>,
    /// Absolute URL probed by the health checker
    pub health_check_url: String,
    /// Last liveness signal
    #[serde(skip)]
    pub last_heartbeat: Instant,
    /// When the instance was registered
    #[serde(skip)]
    pub registered_at: Instant,
}

impl ServiceInstance {
    /// Create an instance in the `Starting` state.
    ///
    /// An empty `health_check_url` is defaulted by the registry at
    /// registration time, using its configured health path.
    pub fn new(
        id: impl Into<String>,
        service_name: impl Into<String>,
        version: impl Into<String>,
        endpoint: Endpoint,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            service_name: service_name.into(),
            version: version.into(),
            endpoint,
            health: HealthState::Starting,
            metadata: HashMap::new(),
            tags: HashSet::new(),
            health_check_url: String::new(),
            last_heartbeat: now,
            registered_at: now,
        }
    }

    /// Attach a tag (builder style).
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Attach a metadata entry (builder style).
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Age of the last heartbeat.
    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.elapsed()
    }

    /// Whether the instance may receive traffic: healthy and recently alive.
    pub fn is_usable(&self, liveness_window: Duration) -> bool {
        self.health == HealthState::Healthy && self.heartbeat_age() < liveness_window
    }
}

/// Advisory description of a service: dependencies and capabilities.
///
/// Purely descriptive metadata keyed by name+version; routing never consults
/// it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_validation() {
        assert!(Endpoint::new("10.0.0.5", 9000, "http").is_ok());
        assert!(Endpoint::new("", 9000, "http").is_err());
        assert!(Endpoint::new("10.0.0.5", 0, "http").is_err());
    }

    #[test]
    fn test_endpoint_urls() {
        let ep = Endpoint::new("10.0.0.5", 9000, "http").unwrap();
        assert_eq!(ep.base_url(), "http://10.0.0.5:9000");
        assert_eq!(ep.authority(), "10.0.0.5:9000");
    }

    #[test]
    fn test_instance_starts_unusable() {
        let ep = Endpoint::new("10.0.0.5", 9000, "http").unwrap();
        let instance = ServiceInstance::new("orders-1", "orders", "1.0.0", ep);

        assert_eq!(instance.health, HealthState::Starting);
        assert!(!instance.is_usable(Duration::from_secs(30)));
    }

    #[test]
    fn test_instance_usability_requires_fresh_heartbeat() {
        let ep = Endpoint::new("10.0.0.5", 9000, "http").unwrap();
        let mut instance = ServiceInstance::new("orders-1", "orders", "1.0.0", ep);
        instance.health = HealthState::Healthy;

        assert!(instance.is_usable(Duration::from_secs(30)));
        // A zero-width liveness window makes any heartbeat stale.
        assert!(!instance.is_usable(Duration::from_secs(0)));
    }
}
