//! Built-in middlewares and the default registry wiring.
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use hyper::{
    Request, Response,
    header::{HeaderName, HeaderValue},
};
use uuid::Uuid;

use crate::ports::middleware::{GatewayMiddleware, MiddlewareRegistry};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Stamps a request id on inbound requests that lack one, so downstream
/// services can correlate logs across hops.
pub struct RequestIdMiddleware;

#[async_trait]
impl GatewayMiddleware for RequestIdMiddleware {
    fn name(&self) -> &str {
        "request_id"
    }

    async fn handle(&self, req: &mut Request<Body>) -> Option<Response<Body>> {
        let header = HeaderName::from_static(REQUEST_ID_HEADER);
        if !req.headers().contains_key(&header) {
            let id = Uuid::new_v4().to_string();
            if let Ok(value) = HeaderValue::from_str(&id) {
                req.headers_mut().insert(header, value);
            }
        }
        None
    }
}

/// Registry pre-populated with the built-in middlewares.
pub fn default_registry() -> MiddlewareRegistry {
    let mut registry = MiddlewareRegistry::new();
    registry.register(Arc::new(RequestIdMiddleware));
    registry
}
