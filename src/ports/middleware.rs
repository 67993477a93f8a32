use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response};

/// A named request middleware applied before forwarding.
///
/// A middleware may mutate the request in place and, by returning a response,
/// short-circuit the pipeline entirely (the downstream call never happens).
#[async_trait]
pub trait GatewayMiddleware: Send + Sync + 'static {
    /// Stable name routes refer to in their middleware lists.
    fn name(&self) -> &str;

    /// Inspect or mutate the request. `Some(response)` ends the pipeline.
    async fn handle(&self, req: &mut Request<Body>) -> Option<Response<Body>>;
}

/// Registry of available middlewares, looked up by name at request time.
#[derive(Default)]
pub struct MiddlewareRegistry {
    entries: HashMap<String, Arc<dyn GatewayMiddleware>>,
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, middleware: Arc<dyn GatewayMiddleware>) {
        self.entries
            .insert(middleware.name().to_string(), middleware);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn GatewayMiddleware>> {
        self.entries.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}
