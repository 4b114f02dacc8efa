//! Caller-facing error taxonomy.
//!
//! Every failure that reaches a caller is a [`BrokerError`] with a stable
//! reason code. The JSON body keeps the relay's usual shape:
//!
//! ```json
//! {"error": "agent a1 disconnected", "code": "AGENT_DISCONNECTED"}
//! ```
//!
//! Validation failures add a `reason` with the specific check that failed.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::auth::{AuthError, HandshakeError};
use crate::resilience::ValidationError;
use crate::store::StoreError;
use crate::tunnel::{RegistryError, TunnelError};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("request rejected: {0}")]
    ValidationFailed(#[from] ValidationError),
    #[error("{0}")]
    Unauthenticated(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("circuit open for customer {0}")]
    CircuitOpen(String),
    #[error("no agent available for customer {0}")]
    NoAgentAvailable(String),
    #[error("agent {0} disconnected")]
    AgentDisconnected(String),
    #[error("agent did not respond within {}s", .0.as_secs())]
    GatewayTimeout(Duration),
    #[error("agent reported an error: {0}")]
    UpstreamError(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ValidationFailed(_) => "VALIDATION_FAILED",
            Self::Unauthenticated(_) => "UNAUTHENTICATED",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::CircuitOpen(_) => "CIRCUIT_OPEN",
            Self::NoAgentAvailable(_) => "NO_AGENT_AVAILABLE",
            Self::AgentDisconnected(_) => "AGENT_DISCONNECTED",
            Self::GatewayTimeout(_) => "GATEWAY_TIMEOUT",
            Self::UpstreamError(_) => "UPSTREAM_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::ValidationFailed(v) => v.status(),
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Unauthorized(_) => StatusCode::FORBIDDEN,
            Self::CircuitOpen(_) | Self::NoAgentAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::AgentDisconnected(_) | Self::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            Self::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && !matches!(self, Self::GatewayTimeout(_)) {
            error!(code = self.code(), error = %self, "Request failed");
        }
        let body = match &self {
            Self::ValidationFailed(v) => json!({
                "error": self.to_string(),
                "code": self.code(),
                "reason": v.reason_code(),
            }),
            _ => json!({"error": self.to_string(), "code": self.code()}),
        };
        (status, Json(body)).into_response()
    }
}

impl From<AuthError> for BrokerError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::RouteNotAllowed(_) => Self::Unauthorized(e.to_string()),
            AuthError::Signing(_) | AuthError::Store(_) => Self::Internal(e.to_string()),
            _ => Self::Unauthenticated(e.to_string()),
        }
    }
}

impl From<HandshakeError> for BrokerError {
    fn from(e: HandshakeError) -> Self {
        match e {
            HandshakeError::AgentCustomerMismatch => Self::Unauthorized(e.to_string()),
            HandshakeError::Store(_) => Self::Internal(e.to_string()),
            _ => Self::Unauthenticated(e.to_string()),
        }
    }
}

impl From<TunnelError> for BrokerError {
    fn from(e: TunnelError) -> Self {
        match e {
            TunnelError::Disconnected(agent_id) | TunnelError::Write { agent_id, .. } => {
                Self::AgentDisconnected(agent_id)
            }
            TunnelError::Timeout(after) => Self::GatewayTimeout(after),
            TunnelError::Upstream(message) => Self::UpstreamError(message),
            TunnelError::Encode(err) => Self::Internal(err.to_string()),
        }
    }
}

impl From<RegistryError> for BrokerError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(agent_id) => Self::NotFound(format!("agent {agent_id}")),
            RegistryError::Unauthorized { .. } => Self::Unauthorized(e.to_string()),
            RegistryError::Tunnel(t) => t.into(),
        }
    }
}

impl From<StoreError> for BrokerError {
    fn from(e: StoreError) -> Self {
        Self::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (BrokerError::Unauthenticated(String::new()), 401, "UNAUTHENTICATED"),
            (BrokerError::Unauthorized(String::new()), 403, "UNAUTHORIZED"),
            (BrokerError::CircuitOpen("c".into()), 503, "CIRCUIT_OPEN"),
            (BrokerError::NoAgentAvailable("c".into()), 503, "NO_AGENT_AVAILABLE"),
            (BrokerError::AgentDisconnected("a".into()), 502, "AGENT_DISCONNECTED"),
            (BrokerError::GatewayTimeout(Duration::from_secs(3)), 504, "GATEWAY_TIMEOUT"),
            (BrokerError::UpstreamError(String::new()), 502, "UPSTREAM_ERROR"),
            (BrokerError::Internal(String::new()), 500, "INTERNAL_ERROR"),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status().as_u16(), status);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn test_validation_keeps_sub_status() {
        let err = BrokerError::from(ValidationError::RateLimited("a1".into()));
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.code(), "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn test_json_body() {
        let resp = BrokerError::from(ValidationError::MissingHeader("X-Agent-ID".into()))
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "VALIDATION_FAILED");
        assert_eq!(body["reason"], "MISSING_HEADER");
    }

    #[test]
    fn test_auth_mapping() {
        assert_eq!(
            BrokerError::from(AuthError::RouteNotAllowed("/x".into())).code(),
            "UNAUTHORIZED"
        );
        assert_eq!(BrokerError::from(AuthError::TokenExpired).code(), "UNAUTHENTICATED");
        assert_eq!(
            BrokerError::from(TunnelError::Timeout(Duration::from_secs(1))).code(),
            "GATEWAY_TIMEOUT"
        );
    }
}
