//! Metrics endpoints: per-customer JSON for callers and the Prometheus scrape.

use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    Extension, Json,
};

use crate::auth::Claims;
use crate::error::BrokerError;
use crate::models::MetricsResponse;
use crate::state::AppState;

/// `GET /api/v1/metrics`: last hour's aggregation plus live gauges.
pub async fn customer_metrics(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<MetricsResponse>, BrokerError> {
    Ok(Json(state.metrics.get_metrics(&claims.customer_id).await?))
}

/// `GET /metrics`: text exposition of the broker's signals.
pub async fn prometheus(State(state): State<AppState>) -> Result<Response, BrokerError> {
    let (content_type, body) = state
        .metrics
        .recorder()
        .encode()
        .map_err(|e| BrokerError::Internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}
