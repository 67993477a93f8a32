use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use http_body_util::BodyExt;
use hyper::{Request, Response, StatusCode, Version, header, header::HeaderValue};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use tokio::time::timeout;

use crate::ports::http_client::{ForwardError, ForwardResult, HttpClient};

/// Outbound HTTP adapter over Hyper (HTTP/1.1, plain TCP).
///
/// Responsibilities:
/// * Request forwarding to selected instances with a default User-Agent
/// * GET based health probes with timeout
/// * Converting between Hyper and Axum body types
///
/// Retries, timeouts per route and circuit breaking are layered above; this
/// adapter performs exactly one call per invocation.
pub struct HttpClientAdapter {
    client: Client<HttpConnector, AxumBody>,
}

impl HttpClientAdapter {
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        tracing::info!("Created outbound HTTP client (HTTP/1.1)");
        Self { client }
    }
}

impl Default for HttpClientAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn forward(&self, mut req: Request<AxumBody>) -> ForwardResult<Response<AxumBody>> {
        // Host header must match the instance the URI points at.
        let host_value = match req.uri().host() {
            Some(host) => {
                let authority = match req.uri().port() {
                    Some(port) => format!("{host}:{}", port.as_u16()),
                    None => host.to_string(),
                };
                HeaderValue::from_str(&authority)
                    .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?
            }
            None => {
                return Err(ForwardError::InvalidRequest(
                    "Outgoing URI has no host".to_string(),
                ));
            }
        };
        req.headers_mut().insert(header::HOST, host_value);
        if !req.headers().contains_key(header::USER_AGENT) {
            req.headers_mut().insert(
                header::USER_AGENT,
                HeaderValue::from_static("Meshgate/1.0"),
            );
        }

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        let method = parts.method.clone();
        let uri = parts.uri.clone();
        let outgoing = Request::from_parts(parts, body);

        tracing::debug!("Forwarding {} {}", method, uri);

        match self.client.request(outgoing).await {
            Ok(response) => {
                let (mut parts, hyper_body) = response.into_parts();
                // The body is re-framed on the way back out.
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Err(e) => Err(ForwardError::Connection(format!(
                "Request to {method} {uri} failed: {e}"
            ))),
        }
    }

    async fn probe(&self, url: &str, timeout_secs: u64) -> ForwardResult<bool> {
        let request = Request::builder()
            .method("GET")
            .uri(url)
            .version(Version::HTTP_11)
            .body(AxumBody::empty())
            .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;

        tracing::debug!("Probing {}", url);

        match timeout(Duration::from_secs(timeout_secs), self.client.request(request)).await {
            Ok(Ok(response)) => {
                let is_healthy = response.status() == StatusCode::OK;
                // Consume the body to release the connection.
                let _ = response.into_body().collect().await;
                tracing::debug!("Probe for {} result: {}", url, is_healthy);
                Ok(is_healthy)
            }
            Ok(Err(e)) => {
                tracing::debug!("Probe error for {}: {}", url, e);
                Ok(false)
            }
            Err(_) => {
                tracing::debug!("Probe timeout for {}", url);
                Err(ForwardError::Timeout(timeout_secs))
            }
        }
    }
}
