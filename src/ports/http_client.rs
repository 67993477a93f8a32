use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Errors produced when talking to a downstream service instance.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ForwardError {
    /// Connection to the instance could not be established or broke mid-flight
    #[error("Connection error: {0}")]
    Connection(String),

    /// The call did not complete within the allotted time
    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    /// The outgoing request could not be constructed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for outbound HTTP operations
pub type ForwardResult<T> = Result<T, ForwardError>;

/// HttpClient defines the port (interface) for outbound HTTP traffic: request
/// forwarding to selected instances and health probing of registered ones.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Relay an HTTP request to a downstream service instance.
    ///
    /// The request URI must already point at the selected instance; the
    /// adapter performs no routing of its own.
    async fn forward(&self, req: Request<AxumBody>) -> ForwardResult<Response<AxumBody>>;

    /// Probe an instance's health endpoint.
    ///
    /// Returns `Ok(true)` only for an HTTP 200 answer within `timeout_secs`;
    /// non-200 answers map to `Ok(false)` and transport timeouts to
    /// [`ForwardError::Timeout`].
    async fn probe(&self, url: &str, timeout_secs: u64) -> ForwardResult<bool>;
}
