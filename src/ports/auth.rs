use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from the external token verifier.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AuthError {
    /// The token is malformed or its signature does not verify
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// The token verified but is no longer valid
    #[error("Token expired")]
    Expired,

    /// The verifier itself could not be reached or failed internally
    #[error("Verification error: {0}")]
    Verification(String),
}

/// Claims extracted from a successfully verified bearer token.
#[derive(Debug, Clone)]
pub struct AuthClaims {
    /// Principal the token was issued to
    pub subject: String,
    /// Remaining claims as reported by the verifier
    pub claims: HashMap<String, serde_json::Value>,
}

/// TokenVerifier is the port for the external authentication collaborator.
///
/// The gateway only ever calls `verify`; token issuance and the verification
/// mechanics (JWT, opaque introspection, ...) live behind this boundary.
#[async_trait]
pub trait TokenVerifier: Send + Sync + 'static {
    /// Verify a bearer token and return its claims.
    async fn verify(&self, token: &str) -> Result<AuthClaims, AuthError>;
}
