//! Route table: glob patterns, per-route policies, first-match lookup.
//!
//! A route binds a path pattern and HTTP method to a target service plus the
//! policies applied on the way there (strategy, timeout, retries, auth, rate
//! limit, circuit breaker, middleware chain). Lookup scans routes in
//! insertion order and stops at the first match, so registration order is the
//! precedence order.
use std::{
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use regex::Regex;
use thiserror::Error;

use crate::core::{
    balancer::Strategy,
    breaker::{BreakerPolicy, CircuitBreaker},
    rate_limit::{RateLimitPolicy, RateLimiter},
};

/// Errors from route registration.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RouteError {
    /// A route with this id already exists
    #[error("Route already exists: {0}")]
    Conflict(String),

    /// The path pattern could not be compiled
    #[error("Invalid path pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Result type for route operations
pub type RouteResult<T> = Result<T, RouteError>;

/// Compiled glob path pattern.
///
/// `*` matches any run of characters (including `/`); every other character
/// matches literally. The whole path must match.
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    regex: Regex,
}

impl PathPattern {
    pub fn compile(pattern: &str) -> RouteResult<Self> {
        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        for ch in pattern.chars() {
            if ch == '*' {
                expr.push_str(".*");
            } else {
                expr.push_str(&regex::escape(&ch.to_string()));
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| RouteError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Literal prefix before the first `*`, used by path rewriting.
    fn literal_prefix(&self) -> &str {
        match self.source.find('*') {
            Some(i) => &self.source[..i],
            None => &self.source,
        }
    }
}

/// Declarative description of one route.
#[derive(Debug, Clone)]
pub struct RouteRule {
    /// Unique route identifier
    pub id: String,
    /// Glob pattern matched against the request path
    pub pattern: String,
    /// HTTP method the route answers
    pub method: http::Method,
    /// Logical service name resolved through discovery
    pub target_service: String,
    /// Optional replacement for the pattern's literal prefix
    pub path_rewrite: Option<String>,
    /// Load-balancing strategy for this route
    pub strategy: Strategy,
    /// Per-attempt timeout for downstream calls
    pub timeout: Duration,
    /// Transport-failure retries after the first attempt
    pub retry_count: u32,
    /// Whether a verified bearer token is required
    pub auth_required: bool,
    /// Optional per-route rate limit
    pub rate_limit: Option<RateLimitPolicy>,
    /// Optional per-route circuit breaker
    pub circuit_breaker: Option<BreakerPolicy>,
    /// Named middlewares applied in order before forwarding
    pub middlewares: Vec<String>,
}

impl RouteRule {
    /// Minimal rule with defaults: round-robin, 30s timeout, no retries, no
    /// auth, no rate limit, no breaker.
    pub fn new(
        id: impl Into<String>,
        pattern: impl Into<String>,
        method: http::Method,
        target_service: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            pattern: pattern.into(),
            method,
            target_service: target_service.into(),
            path_rewrite: None,
            strategy: Strategy::default(),
            timeout: Duration::from_secs(30),
            retry_count: 0,
            auth_required: false,
            rate_limit: None,
            circuit_breaker: None,
            middlewares: Vec::new(),
        }
    }
}

/// A registered route: the rule plus its compiled pattern and live policy
/// state. Policy state is per route and survives for the route's lifetime.
pub struct Route {
    pub rule: RouteRule,
    pattern: PathPattern,
    limiter: Option<RateLimiter>,
    breaker: Option<CircuitBreaker>,
}

impl Route {
    fn build(rule: RouteRule) -> RouteResult<Self> {
        let pattern = PathPattern::compile(&rule.pattern)?;
        let limiter = rule.rate_limit.map(RateLimiter::new);
        let breaker = rule.circuit_breaker.map(CircuitBreaker::new);
        Ok(Self {
            rule,
            pattern,
            limiter,
            breaker,
        })
    }

    pub fn matches(&self, path: &str, method: &http::Method) -> bool {
        self.rule.method == *method && self.pattern.matches(path)
    }

    /// Rate-limit admission for a client key; no policy means always allowed.
    pub fn allow(&self, key: &str) -> bool {
        match &self.limiter {
            Some(limiter) => limiter.allow(key),
            None => true,
        }
    }

    /// Circuit-breaker admission; no policy means always allowed.
    pub fn can_execute(&self) -> bool {
        match &self.breaker {
            Some(breaker) => breaker.can_execute(),
            None => true,
        }
    }

    pub fn record_success(&self) {
        if let Some(breaker) = &self.breaker {
            breaker.record_success();
        }
    }

    pub fn record_failure(&self) {
        if let Some(breaker) = &self.breaker {
            breaker.record_failure();
        }
    }

    /// Breaker state label for the status endpoint, if a breaker is set.
    pub fn breaker_label(&self) -> Option<&'static str> {
        self.breaker.as_ref().map(|b| b.state().label())
    }

    /// Downstream path after applying the optional rewrite.
    ///
    /// The rewrite replaces the pattern's literal prefix; the wildcard
    /// remainder of the incoming path is preserved.
    pub fn rewrite_path(&self, path: &str) -> String {
        match &self.rule.path_rewrite {
            None => path.to_string(),
            Some(target) => {
                let prefix = self.pattern.literal_prefix();
                match path.strip_prefix(prefix) {
                    Some(rest) => format!("{target}{rest}"),
                    None => target.clone(),
                }
            }
        }
    }

    fn evict_idle_keys(&self, max_idle: Duration) {
        if let Some(limiter) = &self.limiter {
            limiter.evict_idle(max_idle);
        }
    }
}

/// Ordered route table.
pub struct RouteManager {
    routes: RwLock<Vec<Arc<Route>>>,
}

impl RouteManager {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
        }
    }

    /// Register a route at the end of the table.
    pub fn add_route(&self, rule: RouteRule) -> RouteResult<()> {
        let route = Arc::new(Route::build(rule)?);
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        if routes.iter().any(|r| r.rule.id == route.rule.id) {
            return Err(RouteError::Conflict(route.rule.id.clone()));
        }
        tracing::info!(
            "Route {} registered: {} {} -> {}",
            route.rule.id,
            route.rule.method,
            route.rule.pattern,
            route.rule.target_service
        );
        routes.push(route);
        Ok(())
    }

    /// Remove a route by id. Returns whether a route was removed.
    pub fn remove_route(&self, id: &str) -> bool {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        let before = routes.len();
        routes.retain(|r| r.rule.id != id);
        let removed = routes.len() < before;
        if removed {
            tracing::info!("Route {} removed", id);
        }
        removed
    }

    /// First route (in registration order) matching path and method.
    pub fn find_route(&self, path: &str, method: &http::Method) -> Option<Arc<Route>> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        routes.iter().find(|r| r.matches(path, method)).cloned()
    }

    /// Snapshot of all routes, in registration order.
    pub fn routes(&self) -> Vec<Arc<Route>> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Evict idle rate-limit keys across every route.
    pub fn evict_idle_keys(&self, max_idle: Duration) {
        for route in self.routes() {
            route.evict_idle_keys(max_idle);
        }
    }
}

impl Default for RouteManager {
    fn default() -> Self {
        Self::new()
    }
}
