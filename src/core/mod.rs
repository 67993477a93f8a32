//! Core domain logic, free of I/O: registry, discovery, balancing, admission
//! control and the request pipeline.
pub mod balancer;
pub mod breaker;
pub mod discovery;
pub mod gateway;
pub mod instance;
pub mod rate_limit;
pub mod registry;
pub mod routes;

pub use balancer::{LoadBalancer, Strategy};
pub use breaker::{BreakerPolicy, BreakerState, CircuitBreaker};
pub use discovery::ServiceDiscovery;
pub use gateway::{GatewayError, GatewayService};
pub use instance::{Endpoint, HealthState, ServiceDefinition, ServiceInstance};
pub use rate_limit::{RateLimitPolicy, RateLimiter};
pub use registry::{RegistryError, RegistryEvent, RegistryWatcher, ServiceRegistry};
pub use routes::{Route, RouteManager, RouteRule};
