//! Meshgate - a service-mesh control-plane gateway.
//!
//! Meshgate combines a service registry, active health checking, cached
//! discovery, load balancing, per-route rate limiting and circuit breaking,
//! and an HTTP gateway that routes inbound traffic to registered service
//! instances. It implements a **hexagonal architecture**: business logic in
//! `core`, traits at the boundaries in `ports`, I/O in `adapters`.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use meshgate::{
//!     adapters::{GatewayServer, HttpClientAdapter, middleware::default_registry},
//!     config::GatewayConfig,
//!     core::{GatewayService, LoadBalancer, RouteManager, ServiceDiscovery, ServiceRegistry},
//! };
//!
//! # fn main() -> eyre::Result<()> {
//! let config = GatewayConfig::default();
//! let registry = Arc::new(ServiceRegistry::new(config.registry.clone()));
//! let discovery = Arc::new(ServiceDiscovery::new(
//!     registry.clone(),
//!     std::time::Duration::from_secs(config.discovery.ttl_secs),
//! ));
//! let gateway = Arc::new(GatewayService::new(
//!     Arc::new(RouteManager::new()),
//!     discovery,
//!     Arc::new(LoadBalancer::new()),
//!     Arc::new(HttpClientAdapter::new()),
//!     None,
//!     Arc::new(default_registry()),
//! ));
//! let server = GatewayServer::new(gateway, registry);
//! // Register routes and instances, then call `server.start(...)`.
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Fallible APIs return domain-specific error types at module boundaries and
//! `eyre::Result<T>` at the application edge, with context attached via
//! `WrapErr`.
//!
//! # Concurrency & Data Structures
//! Shared mutable maps use `scc::HashMap` for per-entry locking under
//! contention; cross-field state (the circuit breaker) uses a plain mutex.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{GatewayServer, HealthChecker, HttpClientAdapter},
    core::{GatewayService, LoadBalancer, RouteManager, ServiceDiscovery, ServiceRegistry},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
