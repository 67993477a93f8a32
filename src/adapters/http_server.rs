//! Inbound HTTP surface: the proxy entry point plus operational endpoints.
//!
//! Every request that is not an operational endpoint falls through to the
//! gateway pipeline. Operational endpoints live under a reserved prefix so
//! they can never shadow a registered route pattern by accident:
//!
//! * `GET /__meshgate/health` — liveness of the gateway itself
//! * `GET /__meshgate/status` — registry, route and connection overview
use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, State},
    response::Response,
    routing::get,
};
use eyre::{Result, WrapErr};
use hyper::Request;

use crate::{
    core::{gateway::GatewayService, registry::ServiceRegistry, routes::RouteRule},
    utils::graceful_shutdown::ShutdownToken,
};

struct AppState {
    gateway: Arc<GatewayService>,
    registry: Arc<ServiceRegistry>,
}

/// The embeddable gateway server.
pub struct GatewayServer {
    state: Arc<AppState>,
}

impl GatewayServer {
    pub fn new(gateway: Arc<GatewayService>, registry: Arc<ServiceRegistry>) -> Self {
        Self {
            state: Arc::new(AppState { gateway, registry }),
        }
    }

    /// Register a route on the running server.
    pub fn register_route(&self, rule: RouteRule) -> Result<()> {
        self.state
            .gateway
            .route_manager()
            .add_route(rule)
            .wrap_err("Failed to register route")
    }

    /// Remove a route by id. Returns whether a route was removed.
    pub fn remove_route(&self, id: &str) -> bool {
        self.state.gateway.route_manager().remove_route(id)
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.state.registry
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/__meshgate/health", get(handle_health))
            .route("/__meshgate/status", get(handle_status))
            .fallback(handle_proxy)
            .with_state(self.state.clone())
    }

    /// Bind and serve until shutdown is signalled.
    pub async fn start(&self, listen_addr: &str, mut shutdown: ShutdownToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(listen_addr)
            .await
            .wrap_err_with(|| format!("Failed to bind {listen_addr}"))?;
        let local_addr = listener
            .local_addr()
            .wrap_err("Failed to read local address")?;
        tracing::info!("Gateway listening on {}", local_addr);

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for_shutdown().await;
            tracing::info!("Gateway server draining connections");
        })
        .await
        .wrap_err("Gateway server failed")
    }
}

async fn handle_proxy(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response<Body> {
    state.gateway.handle_request(req, Some(addr)).await
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn handle_status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(status_snapshot(&state))
}

fn status_snapshot(state: &AppState) -> serde_json::Value {
    let routes: Vec<serde_json::Value> = state
        .gateway
        .route_manager()
        .routes()
        .iter()
        .map(|route| {
            serde_json::json!({
                "id": route.rule.id,
                "method": route.rule.method.as_str(),
                "pattern": route.rule.pattern,
                "target_service": route.rule.target_service,
                "circuit_breaker": route.breaker_label(),
            })
        })
        .collect();

    serde_json::json!({
        "status": "ok",
        "instances": {
            "registered": state.registry.instance_count(),
            "usable": state.registry.usable_instance_count(),
        },
        "routes": routes,
    })
}
