use std::{collections::HashSet, net::SocketAddr};

use crate::{
    config::models::{GatewayConfig, RouteRuleConfig},
    core::routes::PathPattern,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, Vec<ValidationError>>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Route conflict detected: {message}")]
    RouteConflict { message: String },
}

/// Gateway configuration validator
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire gateway configuration, collecting every problem.
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(reason) = config.listen_addr.parse::<SocketAddr>() {
            errors.push(ValidationError::InvalidListenAddress {
                address: config.listen_addr.clone(),
                reason: reason.to_string(),
            });
        }

        if config.registry.unhealthy_after_secs >= config.registry.deregister_after_secs {
            errors.push(ValidationError::InvalidField {
                field: "registry.unhealthy_after_secs".to_string(),
                message: "must be smaller than deregister_after_secs".to_string(),
            });
        }
        if config.registry.sweep_interval_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "registry.sweep_interval_secs".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if config.health_check.enabled && config.health_check.interval_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check.interval_secs".to_string(),
                message: "must be positive when health checking is enabled".to_string(),
            });
        }

        let mut seen_ids = HashSet::new();
        for route in &config.routes {
            if !seen_ids.insert(route.id.clone()) {
                errors.push(ValidationError::RouteConflict {
                    message: format!("duplicate route id '{}'", route.id),
                });
            }
            errors.extend(Self::validate_route(route));
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_route(route: &RouteRuleConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let field = |name: &str| format!("routes[{}].{}", route.id, name);

        if route.id.is_empty() {
            errors.push(ValidationError::InvalidField {
                field: "routes[].id".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if route.target_service.is_empty() {
            errors.push(ValidationError::InvalidField {
                field: field("target_service"),
                message: "must not be empty".to_string(),
            });
        }
        if http::Method::from_bytes(route.method.to_uppercase().as_bytes()).is_err() {
            errors.push(ValidationError::InvalidField {
                field: field("method"),
                message: format!("'{}' is not an HTTP method", route.method),
            });
        }
        if let Err(e) = PathPattern::compile(&route.pattern) {
            errors.push(ValidationError::InvalidField {
                field: field("pattern"),
                message: e.to_string(),
            });
        }
        if route.timeout_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: field("timeout_secs"),
                message: "must be positive".to_string(),
            });
        }
        if let Some(limit) = &route.rate_limit {
            if limit.requests_per_minute == 0 || limit.requests_per_hour == 0 {
                errors.push(ValidationError::InvalidField {
                    field: field("rate_limit"),
                    message: "window budgets must be positive".to_string(),
                });
            }
            if limit.burst_size == 0 {
                errors.push(ValidationError::InvalidField {
                    field: field("rate_limit.burst_size"),
                    message: "must be positive".to_string(),
                });
            }
        }
        if let Some(breaker) = &route.circuit_breaker {
            if breaker.failure_threshold == 0 || breaker.half_open_max_calls == 0 {
                errors.push(ValidationError::InvalidField {
                    field: field("circuit_breaker"),
                    message: "thresholds must be positive".to_string(),
                });
            }
        }

        errors
    }
}
