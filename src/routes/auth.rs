//! Token issuance and verification endpoints.

use axum::{extract::State, Json};
use serde::Deserialize;

use crate::auth::token::IssuedToken;
use crate::auth::Claims;
use crate::error::BrokerError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub token: String,
}

/// `POST /api/v1/auth/token`: exchange an API key for a signed token.
pub async fn issue_token(
    State(state): State<AppState>,
    Json(req): Json<TokenRequest>,
) -> Result<Json<IssuedToken>, BrokerError> {
    Ok(Json(state.tokens.issue_token(&req.api_key).await?))
}

/// `POST /api/v1/auth/verify`: return the claims of a valid token.
pub async fn verify_token(
    State(state): State<AppState>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<Claims>, BrokerError> {
    Ok(Json(state.tokens.verify_token(&req.token).await?))
}
