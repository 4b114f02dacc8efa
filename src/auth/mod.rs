//! Caller and agent authentication.
//!
//! - `token`: signed caller tokens (issue, verify, route authorization)
//! - `routes`: `*` / `**` route pattern matching
//! - `handshake`: agent upgrade credential (`timestamp.signature`)
//!
//! Caller endpoints except `/api/health` and `/api/v1/auth/*` require an
//! `Authorization: Bearer <token>` header, enforced by [`require_token`].

pub mod handshake;
pub mod routes;
pub mod token;

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::Span;

use crate::error::BrokerError;
use crate::store::StoreError;

pub use handshake::{sign_agent_credential, HandshakeError, HandshakeVerifier};
pub use token::{Claims, TokenService};

/// Caller-token failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid API key")]
    InvalidApiKey,
    #[error("customer is inactive")]
    CustomerInactive,
    #[error("customer not found")]
    CustomerNotFound,
    #[error("missing or malformed Authorization header")]
    MissingToken,
    #[error("token expired")]
    TokenExpired,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("route {0} is not allowed for this customer")]
    RouteNotAllowed(String),
    #[error("failed to sign token: {0}")]
    Signing(jsonwebtoken::errors::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuthError {
    /// Short label used for the auth failure metric.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidApiKey => "invalid_api_key",
            Self::CustomerInactive => "customer_inactive",
            Self::CustomerNotFound => "customer_not_found",
            Self::MissingToken => "missing_token",
            Self::TokenExpired => "token_expired",
            Self::InvalidToken(_) => "invalid_token",
            Self::RouteNotAllowed(_) => "route_not_allowed",
            Self::Signing(_) => "signing",
            Self::Store(_) => "store",
        }
    }
}

/// Axum middleware that verifies the bearer token and stores the resulting
/// [`Claims`] as a request extension for downstream handlers.
pub async fn require_token(
    State(tokens): State<Arc<TokenService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());

    let Some(token) = provided else {
        return BrokerError::from(AuthError::MissingToken).into_response();
    };

    match tokens.verify_token(token).await {
        Ok(claims) => {
            Span::current().record("customer_id", claims.customer_id.as_str());
            request.extensions_mut().insert(claims);
            next.run(request).await
        }
        Err(e) => BrokerError::from(e).into_response(),
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        diff |= e ^ provided.get(i).copied().unwrap_or(0xff);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }
}
