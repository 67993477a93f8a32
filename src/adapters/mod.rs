//! Adapters binding the core to the outside world: inbound HTTP serving,
//! outbound HTTP calls, health probing and built-in middlewares.
pub mod health_checker;
pub mod http_client;
pub mod http_server;
pub mod middleware;

pub use health_checker::HealthChecker;
pub use http_client::HttpClientAdapter;
pub use http_server::GatewayServer;
