//! Configuration model for the gateway and its background tasks.
//!
//! Every section has serde defaults, so an empty file is a valid (if not very
//! useful) configuration.
use std::time::Duration;

use eyre::{Result, WrapErr, eyre};
use serde::{Deserialize, Serialize};

use crate::core::{
    balancer::Strategy,
    breaker::BreakerPolicy,
    rate_limit::RateLimitPolicy,
    routes::RouteRule,
};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address the gateway listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Registry lifecycle tuning
    #[serde(default)]
    pub registry: RegistrySettings,

    /// Active health probing
    #[serde(default)]
    pub health_check: HealthCheckSettings,

    /// Discovery cache tuning
    #[serde(default)]
    pub discovery: DiscoverySettings,

    /// Rate limiter housekeeping
    #[serde(default)]
    pub rate_limiter: RateLimiterSettings,

    /// Routes registered at startup, in precedence order
    #[serde(default)]
    pub routes: Vec<RouteRuleConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            registry: RegistrySettings::default(),
            health_check: HealthCheckSettings::default(),
            discovery: DiscoverySettings::default(),
            rate_limiter: RateLimiterSettings::default(),
            routes: Vec::new(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

/// Registry sweep and liveness windows, all in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Interval between sweep passes
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Heartbeat age beyond which an instance stops receiving traffic
    #[serde(default = "default_liveness_window")]
    pub liveness_window_secs: u64,
    /// Heartbeat age beyond which a healthy instance is marked unhealthy
    #[serde(default = "default_unhealthy_after")]
    pub unhealthy_after_secs: u64,
    /// Heartbeat age beyond which an instance is deregistered outright
    #[serde(default = "default_deregister_after")]
    pub deregister_after_secs: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            liveness_window_secs: default_liveness_window(),
            unhealthy_after_secs: default_unhealthy_after(),
            deregister_after_secs: default_deregister_after(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    10
}

fn default_liveness_window() -> u64 {
    30
}

fn default_unhealthy_after() -> u64 {
    60
}

fn default_deregister_after() -> u64 {
    300
}

/// Health checker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval between probe cycles
    #[serde(default = "default_probe_interval")]
    pub interval_secs: u64,
    /// Per-probe timeout
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
    /// Path appended to an instance endpoint when it registers without an
    /// explicit health-check URL
    #[serde(default = "default_health_path")]
    pub default_path: String,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_probe_interval(),
            timeout_secs: default_probe_timeout(),
            default_path: default_health_path(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_probe_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_health_path() -> String {
    "/health".to_string()
}

/// Discovery cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Cache entry lifetime
    #[serde(default = "default_discovery_ttl")]
    pub ttl_secs: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_discovery_ttl(),
        }
    }
}

fn default_discovery_ttl() -> u64 {
    30
}

/// Rate limiter housekeeping configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterSettings {
    /// Idle time after which per-key state is evicted
    #[serde(default = "default_idle_key_ttl")]
    pub idle_key_ttl_secs: u64,
    /// Interval between eviction passes
    #[serde(default = "default_limiter_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            idle_key_ttl_secs: default_idle_key_ttl(),
            sweep_interval_secs: default_limiter_sweep_interval(),
        }
    }
}

fn default_idle_key_ttl() -> u64 {
    3600
}

fn default_limiter_sweep_interval() -> u64 {
    60
}

/// Declarative route entry as it appears in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRuleConfig {
    pub id: String,
    pub pattern: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub target_service: String,
    #[serde(default)]
    pub path_rewrite: Option<String>,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default = "default_route_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub rate_limit: Option<RateLimitPolicy>,
    #[serde(default)]
    pub circuit_breaker: Option<BreakerPolicy>,
    #[serde(default)]
    pub middlewares: Vec<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_route_timeout() -> u64 {
    30
}

impl RouteRuleConfig {
    /// Convert to the runtime rule, parsing the method string.
    pub fn into_rule(self) -> Result<RouteRule> {
        let method = http::Method::from_bytes(self.method.to_uppercase().as_bytes())
            .wrap_err_with(|| eyre!("Route {}: invalid method '{}'", self.id, self.method))?;
        Ok(RouteRule {
            id: self.id,
            pattern: self.pattern,
            method,
            target_service: self.target_service,
            path_rewrite: self.path_rewrite,
            strategy: self.strategy,
            timeout: Duration::from_secs(self.timeout_secs),
            retry_count: self.retry_count,
            auth_required: self.auth_required,
            rate_limit: self.rate_limit,
            circuit_breaker: self.circuit_breaker,
            middlewares: self.middlewares,
        })
    }
}
