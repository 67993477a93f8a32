//! The request pipeline: route lookup, admission control, authentication,
//! middleware, then forwarding with retries.
//!
//! `handle_request` is total: every failure mode maps to an HTTP error
//! response, and every response (success or error) carries an
//! `x-gateway-latency` header. Stage order is fixed: routing, rate limit,
//! circuit breaker, authentication, middlewares, forward.
use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::body::Body;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{
    Request, Response, StatusCode,
    header::{HeaderName, HeaderValue},
};
use thiserror::Error;

use crate::{
    core::{
        balancer::LoadBalancer,
        discovery::ServiceDiscovery,
        routes::{Route, RouteManager},
    },
    metrics,
    ports::{
        auth::TokenVerifier,
        http_client::HttpClient,
        middleware::MiddlewareRegistry,
    },
};

/// Header stamped on every gateway response with the total handling time in
/// seconds.
pub const LATENCY_HEADER: &str = "x-gateway-latency";

/// Terminal pipeline outcomes, each with a fixed HTTP status.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    /// No route matched path and method
    #[error("No route matched")]
    RouteNotFound,

    /// The route's rate limit rejected the client
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// The route's circuit breaker is open
    #[error("Service temporarily unavailable")]
    CircuitOpen,

    /// Authentication was required and failed
    #[error("Unauthorized: {0}")]
    Unauthenticated(String),

    /// No usable instance of the target service
    #[error("No available instances for service: {0}")]
    ServiceUnavailable(String),

    /// Forwarding failed after exhausting all attempts
    #[error("Forwarding failed: {0}")]
    Forwarding(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound => StatusCode::NOT_FOUND,
            GatewayError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            GatewayError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Forwarding(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn into_response(self) -> Response<Body> {
        let body = serde_json::json!({ "error": self.to_string() }).to_string();
        let builder = Response::builder()
            .status(self.status())
            .header(hyper::header::CONTENT_TYPE, "application/json");
        match builder.body(Body::from(body)) {
            Ok(response) => response,
            // The builder cannot fail with a valid status and header, but the
            // pipeline must stay total.
            Err(_) => {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        }
    }
}

/// The gateway pipeline, wired once at startup and shared across requests.
pub struct GatewayService {
    route_manager: Arc<RouteManager>,
    discovery: Arc<ServiceDiscovery>,
    balancer: Arc<LoadBalancer>,
    http_client: Arc<dyn HttpClient>,
    verifier: Option<Arc<dyn TokenVerifier>>,
    middlewares: Arc<MiddlewareRegistry>,
}

impl GatewayService {
    pub fn new(
        route_manager: Arc<RouteManager>,
        discovery: Arc<ServiceDiscovery>,
        balancer: Arc<LoadBalancer>,
        http_client: Arc<dyn HttpClient>,
        verifier: Option<Arc<dyn TokenVerifier>>,
        middlewares: Arc<MiddlewareRegistry>,
    ) -> Self {
        Self {
            route_manager,
            discovery,
            balancer,
            http_client,
            verifier,
            middlewares,
        }
    }

    pub fn route_manager(&self) -> &Arc<RouteManager> {
        &self.route_manager
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    /// Run one request through the full pipeline.
    ///
    /// Never fails: pipeline errors become their mapped HTTP responses, and
    /// the latency header is stamped on every exit path.
    pub async fn handle_request(
        &self,
        req: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Response<Body> {
        let start = Instant::now();
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        let mut response = match self.process(req, client_addr).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("{} {} rejected: {}", method, path, e);
                e.into_response()
            }
        };

        let elapsed = start.elapsed();
        if let Ok(value) = HeaderValue::from_str(&format!("{:.6}", elapsed.as_secs_f64())) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(LATENCY_HEADER), value);
        }

        metrics::increment_request_total(&path, method.as_str(), response.status().as_u16());
        metrics::record_request_duration(&path, method.as_str(), elapsed);
        response
    }

    async fn process(
        &self,
        mut req: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<Body>, GatewayError> {
        let route = self
            .route_manager
            .find_route(req.uri().path(), req.method())
            .ok_or(GatewayError::RouteNotFound)?;

        let client_ip = client_ip(&req, client_addr);
        let rate_key = format!("{}:{}", client_ip, route.rule.id);
        if !route.allow(&rate_key) {
            return Err(GatewayError::RateLimitExceeded);
        }

        if !route.can_execute() {
            return Err(GatewayError::CircuitOpen);
        }

        if route.rule.auth_required {
            self.authenticate(&mut req).await?;
        }

        for name in &route.rule.middlewares {
            match self.middlewares.get(name) {
                Some(middleware) => {
                    if let Some(response) = middleware.handle(&mut req).await {
                        tracing::debug!("Middleware {} short-circuited the request", name);
                        return Ok(response);
                    }
                }
                None => {
                    tracing::warn!("Route {} names unknown middleware {}", route.rule.id, name);
                }
            }
        }

        self.forward(req, &route, &client_ip).await
    }

    async fn authenticate(&self, req: &mut Request<Body>) -> Result<(), GatewayError> {
        let verifier = match &self.verifier {
            Some(verifier) => verifier,
            None => {
                tracing::warn!("Route requires auth but no token verifier is configured");
                return Ok(());
            }
        };

        let token = req
            .headers()
            .get(hyper::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| GatewayError::Unauthenticated("Missing bearer token".to_string()))?;

        let claims = verifier
            .verify(token)
            .await
            .map_err(|e| GatewayError::Unauthenticated(e.to_string()))?;
        tracing::debug!("Authenticated request for subject {}", claims.subject);
        req.extensions_mut().insert(claims);
        Ok(())
    }

    /// Forward with retries. The body is buffered once so every attempt sends
    /// the same bytes; any HTTP status from the instance counts as success
    /// (only transport failures and timeouts are retried).
    async fn forward(
        &self,
        req: Request<Body>,
        route: &Route,
        client_ip: &str,
    ) -> Result<Response<Body>, GatewayError> {
        let (parts, body) = req.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| GatewayError::Forwarding(format!("Failed to read request body: {e}")))?
            .to_bytes();

        let downstream_path = route.rewrite_path(parts.uri.path());
        let query = parts.uri.query().map(|q| format!("?{q}")).unwrap_or_default();

        let attempts = 1 + route.rule.retry_count;
        let mut last_error = GatewayError::ServiceUnavailable(route.rule.target_service.clone());

        for attempt in 0..attempts {
            let candidates = self.discovery.discover(&route.rule.target_service);
            let instance = match self.balancer.select(
                &candidates,
                &route.rule.strategy,
                Some(client_ip),
            ) {
                Some(instance) => instance,
                None => {
                    last_error =
                        GatewayError::ServiceUnavailable(route.rule.target_service.clone());
                    continue;
                }
            };

            let authority = instance.endpoint.authority();
            let url = format!("{}{}{}", instance.endpoint.base_url(), downstream_path, query);
            let downstream = match build_downstream_request(
                &parts,
                &url,
                body_bytes.clone(),
                client_ip,
            ) {
                Ok(downstream) => downstream,
                Err(e) => return Err(GatewayError::Forwarding(e)),
            };

            let _guard = self.balancer.track(&authority);
            let outcome =
                tokio::time::timeout(route.rule.timeout, self.http_client.forward(downstream))
                    .await;

            match outcome {
                Ok(Ok(response)) => {
                    route.record_success();
                    return Ok(response);
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        "Attempt {}/{} to {} failed: {}",
                        attempt + 1,
                        attempts,
                        url,
                        e
                    );
                    last_error = GatewayError::Forwarding(e.to_string());
                }
                Err(_) => {
                    tracing::warn!(
                        "Attempt {}/{} to {} timed out after {:?}",
                        attempt + 1,
                        attempts,
                        url,
                        route.rule.timeout
                    );
                    last_error = GatewayError::Forwarding(format!(
                        "Timeout after {:?}",
                        route.rule.timeout
                    ));
                }
            }
        }

        route.record_failure();
        Err(last_error)
    }
}

/// Client IP for rate limiting and `X-Forwarded-For`: the first
/// `X-Forwarded-For` entry when present, the socket address otherwise.
fn client_ip(req: &Request<Body>, client_addr: Option<SocketAddr>) -> String {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| client_addr.map(|a| a.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn build_downstream_request(
    parts: &http::request::Parts,
    url: &str,
    body: Bytes,
    client_ip: &str,
) -> Result<Request<Body>, String> {
    let mut builder = Request::builder().method(parts.method.clone()).uri(url);

    for (name, value) in &parts.headers {
        // Hop-by-hop and recomputed headers stay behind.
        if name == hyper::header::HOST
            || name == hyper::header::TRANSFER_ENCODING
            || name == hyper::header::CONTENT_ENCODING
            || name == hyper::header::CONTENT_LENGTH
        {
            continue;
        }
        builder = builder.header(name, value);
    }

    let forwarded = match parts.headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip.to_string(),
    };
    builder = builder
        .header("x-forwarded-for", forwarded)
        .header("x-forwarded-proto", "http");

    builder
        .body(Body::from(body))
        .map_err(|e| format!("Failed to build downstream request: {e}"))
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Mutex,
        time::Duration,
    };

    use async_trait::async_trait;
    use http::Method;

    use super::*;
    use crate::{
        config::RegistrySettings,
        core::{
            breaker::BreakerPolicy,
            instance::{Endpoint, HealthState, ServiceInstance},
            rate_limit::RateLimitPolicy,
            registry::ServiceRegistry,
            routes::RouteRule,
        },
        ports::http_client::{ForwardError, ForwardResult},
    };

    struct MockHttpClient {
        responses: Mutex<Vec<ForwardResult<u16>>>,
        requests: Mutex<Vec<(String, String)>>,
    }

    impl MockHttpClient {
        fn new(responses: Vec<ForwardResult<u16>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn seen_urls(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|(url, _)| url.clone())
                .collect()
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn forward(&self, req: Request<Body>) -> ForwardResult<Response<Body>> {
            let forwarded_for = req
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            self.requests
                .lock()
                .unwrap()
                .push((req.uri().to_string(), forwarded_for));

            let next = self.responses.lock().unwrap().pop();
            match next {
                Some(Ok(status)) => Ok(Response::builder()
                    .status(status)
                    .body(Body::from("downstream"))
                    .unwrap()),
                Some(Err(e)) => Err(e),
                None => Err(ForwardError::Connection("no scripted response".to_string())),
            }
        }

        async fn probe(&self, _url: &str, _timeout_secs: u64) -> ForwardResult<bool> {
            Ok(true)
        }
    }

    struct Fixture {
        gateway: GatewayService,
        registry: Arc<ServiceRegistry>,
        client: Arc<MockHttpClient>,
    }

    fn fixture(responses: Vec<ForwardResult<u16>>) -> Fixture {
        let registry = Arc::new(ServiceRegistry::new(RegistrySettings::default()));
        let discovery = Arc::new(ServiceDiscovery::new(
            registry.clone(),
            Duration::from_secs(0),
        ));
        let client = MockHttpClient::new(responses);
        let gateway = GatewayService::new(
            Arc::new(RouteManager::new()),
            discovery,
            Arc::new(LoadBalancer::new()),
            client.clone(),
            None,
            Arc::new(MiddlewareRegistry::new()),
        );
        Fixture {
            gateway,
            registry,
            client,
        }
    }

    fn register_healthy(registry: &ServiceRegistry, id: &str, service: &str, port: u16) {
        registry
            .register(ServiceInstance::new(
                id,
                service,
                "1.0.0",
                Endpoint::new("127.0.0.1", port, "http").unwrap(),
            ))
            .unwrap();
        registry.update_status(id, HealthState::Healthy).unwrap();
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_unmatched_path_is_404() {
        let f = fixture(vec![]);
        let response = f.gateway.handle_request(get("/nowhere"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().contains_key(LATENCY_HEADER));
    }

    #[tokio::test]
    async fn test_successful_forward_relays_response() {
        let f = fixture(vec![Ok(200)]);
        register_healthy(&f.registry, "orders-1", "orders", 9000);
        f.gateway
            .route_manager()
            .add_route(RouteRule::new("orders", "/orders/*", Method::GET, "orders"))
            .unwrap();

        let response = f.gateway.handle_request(get("/orders/42"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(LATENCY_HEADER));
        assert_eq!(
            f.client.seen_urls(),
            vec!["http://127.0.0.1:9000/orders/42".to_string()]
        );
    }

    #[tokio::test]
    async fn test_downstream_error_status_is_relayed_not_retried() {
        let f = fixture(vec![Ok(502)]);
        register_healthy(&f.registry, "orders-1", "orders", 9000);
        let mut rule = RouteRule::new("orders", "/orders/*", Method::GET, "orders");
        rule.retry_count = 2;
        f.gateway.route_manager().add_route(rule).unwrap();

        let response = f.gateway.handle_request(get("/orders/42"), None).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(f.client.seen_urls().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_is_retried() {
        // Scripted responses pop from the end: failure first, then success.
        let f = fixture(vec![
            Ok(200),
            Err(ForwardError::Connection("refused".to_string())),
        ]);
        register_healthy(&f.registry, "orders-1", "orders", 9000);
        let mut rule = RouteRule::new("orders", "/orders/*", Method::GET, "orders");
        rule.retry_count = 1;
        f.gateway.route_manager().add_route(rule).unwrap();

        let response = f.gateway.handle_request(get("/orders/42"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(f.client.seen_urls().len(), 2);
    }

    #[tokio::test]
    async fn test_no_instances_is_503() {
        let f = fixture(vec![]);
        f.gateway
            .route_manager()
            .add_route(RouteRule::new("orders", "/orders/*", Method::GET, "orders"))
            .unwrap();

        let response = f.gateway.handle_request(get("/orders/42"), None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_rate_limit_maps_to_429() {
        let f = fixture(vec![Ok(200), Ok(200)]);
        register_healthy(&f.registry, "orders-1", "orders", 9000);
        let mut rule = RouteRule::new("orders", "/orders/*", Method::GET, "orders");
        rule.rate_limit = Some(RateLimitPolicy {
            requests_per_minute: 60,
            requests_per_hour: 1000,
            burst_size: 1,
        });
        f.gateway.route_manager().add_route(rule).unwrap();

        let first = f.gateway.handle_request(get("/orders/1"), None).await;
        assert_eq!(first.status(), StatusCode::OK);
        let second = f.gateway.handle_request(get("/orders/2"), None).await;
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_rate_limit_keys_are_per_client() {
        let f = fixture(vec![Ok(200), Ok(200)]);
        register_healthy(&f.registry, "orders-1", "orders", 9000);
        let mut rule = RouteRule::new("orders", "/orders/*", Method::GET, "orders");
        rule.rate_limit = Some(RateLimitPolicy {
            requests_per_minute: 60,
            requests_per_hour: 1000,
            burst_size: 1,
        });
        f.gateway.route_manager().add_route(rule).unwrap();

        let from = |ip: &str| {
            Request::builder()
                .method(Method::GET)
                .uri("/orders/1")
                .header("x-forwarded-for", ip)
                .body(Body::empty())
                .unwrap()
        };

        assert_eq!(
            f.gateway.handle_request(from("203.0.113.1"), None).await.status(),
            StatusCode::OK
        );
        assert_eq!(
            f.gateway.handle_request(from("203.0.113.2"), None).await.status(),
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn test_open_breaker_maps_to_503_without_forwarding() {
        let f = fixture(vec![
            Err(ForwardError::Connection("refused".to_string())),
        ]);
        register_healthy(&f.registry, "orders-1", "orders", 9000);
        let mut rule = RouteRule::new("orders", "/orders/*", Method::GET, "orders");
        rule.circuit_breaker = Some(BreakerPolicy {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        });
        f.gateway.route_manager().add_route(rule).unwrap();

        // The transport failure trips the breaker.
        let first = f.gateway.handle_request(get("/orders/1"), None).await;
        assert_eq!(first.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let second = f.gateway.handle_request(get("/orders/2"), None).await;
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
        // Only the first request reached the client.
        assert_eq!(f.client.seen_urls().len(), 1);
    }

    #[tokio::test]
    async fn test_path_rewrite_applied_to_downstream_url() {
        let f = fixture(vec![Ok(200)]);
        register_healthy(&f.registry, "orders-1", "orders", 9000);
        let mut rule = RouteRule::new("orders", "/api/orders/*", Method::GET, "orders");
        rule.path_rewrite = Some("/orders/".to_string());
        f.gateway.route_manager().add_route(rule).unwrap();

        let response = f
            .gateway
            .handle_request(get("/api/orders/42?verbose=1"), None)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            f.client.seen_urls(),
            vec!["http://127.0.0.1:9000/orders/42?verbose=1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_forwarded_for_appended() {
        let f = fixture(vec![Ok(200)]);
        register_healthy(&f.registry, "orders-1", "orders", 9000);
        f.gateway
            .route_manager()
            .add_route(RouteRule::new("orders", "/orders/*", Method::GET, "orders"))
            .unwrap();

        let addr: SocketAddr = "198.51.100.9:55555".parse().unwrap();
        let response = f.gateway.handle_request(get("/orders/1"), Some(addr)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let forwarded = f.client.requests.lock().unwrap()[0].1.clone();
        assert_eq!(forwarded, "198.51.100.9");
    }

    #[tokio::test]
    async fn test_auth_required_without_token_is_401() {
        struct RejectAll;

        #[async_trait]
        impl TokenVerifier for RejectAll {
            async fn verify(
                &self,
                _token: &str,
            ) -> Result<crate::ports::auth::AuthClaims, crate::ports::auth::AuthError> {
                Err(crate::ports::auth::AuthError::Expired)
            }
        }

        let registry = Arc::new(ServiceRegistry::new(RegistrySettings::default()));
        let discovery = Arc::new(ServiceDiscovery::new(
            registry.clone(),
            Duration::from_secs(0),
        ));
        let client = MockHttpClient::new(vec![Ok(200)]);
        let gateway = GatewayService::new(
            Arc::new(RouteManager::new()),
            discovery,
            Arc::new(LoadBalancer::new()),
            client,
            Some(Arc::new(RejectAll)),
            Arc::new(MiddlewareRegistry::new()),
        );
        register_healthy(&registry, "orders-1", "orders", 9000);
        let mut rule = RouteRule::new("orders", "/orders/*", Method::GET, "orders");
        rule.auth_required = true;
        gateway.route_manager().add_route(rule).unwrap();

        let missing = gateway.handle_request(get("/orders/1"), None).await;
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let with_token = Request::builder()
            .method(Method::GET)
            .uri("/orders/1")
            .header("authorization", "Bearer not-valid")
            .body(Body::empty())
            .unwrap();
        let rejected = gateway.handle_request(with_token, None).await;
        assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);
    }
}
