//! Caller-facing HTTP surface.
//!
//! | Method | Path                     | Auth             | Handler                     |
//! |--------|--------------------------|------------------|-----------------------------|
//! | GET    | `/api/health`            | No               | [`health::health`]          |
//! | POST   | `/api/v1/auth/token`     | API key in body  | [`auth::issue_token`]       |
//! | POST   | `/api/v1/auth/verify`    | No               | [`auth::verify_token`]      |
//! | GET    | `/api/v1/metrics`        | Bearer           | [`metrics::customer_metrics`] |
//! | GET    | `/metrics`               | No               | [`metrics::prometheus`]     |
//! | ANY    | `/api/v1/proxy/{*path}`  | Validator+Bearer | [`proxy::proxy`]            |
//!
//! The agent-facing endpoints live in [`crate::tunnel::relay`] and are merged
//! in by [`router`].

pub mod auth;
pub mod health;
pub mod metrics;
pub mod proxy;

use std::any::Any;
use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use serde_json::json;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, field, info_span, warn};

use crate::auth::require_token;
use crate::error::BrokerError;
use crate::state::AppState;
use crate::tunnel::relay_router;

/// Build the complete application router.
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/health", get(health::health))
        .route("/api/v1/auth/token", post(auth::issue_token))
        .route("/api/v1/auth/verify", post(auth::verify_token))
        .route("/metrics", get(metrics::prometheus));

    let authed = Router::new()
        .route("/api/v1/metrics", get(metrics::customer_metrics))
        .layer(middleware::from_fn_with_state(
            state.tokens.clone(),
            require_token,
        ));

    // Layers run bottom-up: validation, then bearer auth.
    let proxied = Router::new()
        .route("/api/v1/proxy/{*path}", any(proxy::proxy))
        .layer(middleware::from_fn_with_state(
            state.tokens.clone(),
            require_token,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            validate_request,
        ));

    let server = &state.config.server;
    let body_limit = usize::try_from(state.config.agent.max_request_size).unwrap_or(usize::MAX);
    let callers = Router::new()
        .merge(public)
        .merge(authed)
        .merge(proxied)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(RequestBodyTimeoutLayer::new(Duration::from_secs(
            server.read_timeout_secs.max(1),
        )))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(server.write_timeout_secs.max(1)),
        ))
        .layer(ConcurrencyLimitLayer::new(
            server.max_concurrent_requests.max(1),
        ))
        .with_state(state.clone());

    Router::new()
        .merge(callers)
        .merge(relay_router(state.relay.clone()))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &Request| {
                info_span!(
                    "http",
                    method = %req.method(),
                    path = %req.uri().path(),
                    customer_id = field::Empty,
                )
            }),
        )
}

/// Admission checks ahead of proxied calls.
async fn validate_request(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    if let Err(e) = state.validator.validate(request.headers(), peer) {
        state.metrics.recorder().validation_failure(e.reason_code());
        warn!(reason = e.reason_code(), error = %e, "Request rejected");
        return BrokerError::from(e).into_response();
    }
    next.run(request).await
}

/// Runs inside the request's `http` span, which carries method, path and
/// (once authenticated) customer id.
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = detail, "Handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": "internal server error",
            "code": "INTERNAL_SERVER_ERROR",
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use chrono::Utc;
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::models::{Customer, CustomerStatus};
    use crate::store::{Directory, InMemoryDirectory, MemoryCache, TypedCache};

    pub(crate) async fn app_state(routes: &[&str]) -> AppState {
        app_state_with(Config::default(), routes).await
    }

    async fn app_state_with(mut config: Config, routes: &[&str]) -> AppState {
        let directory = Arc::new(InMemoryDirectory::new());
        directory
            .put_customer(Customer {
                id: "c1".into(),
                name: "Acme".into(),
                api_key: "key-1".into(),
                status: CustomerStatus::Active,
                allowed_routes: routes.iter().map(|r| (*r).to_string()).collect(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        config.jwt.secret = "test-secret".into();
        AppState::with_stores(
            config,
            directory,
            TypedCache::new(Arc::new(MemoryCache::new())),
            &CancellationToken::new(),
        )
        .unwrap()
    }

    async fn send(app: &Router, req: HttpRequest<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn post_json(uri: &str, body: &Value) -> HttpRequest<Body> {
        HttpRequest::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn proxied(path: &str, token: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::get(path)
            .header("x-agent-id", "a1")
            .header("x-customer-id", "c1")
            .header("x-agent-token", "unused")
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn token(app: &Router) -> String {
        let (status, body) = send(
            app,
            post_json("/api/v1/auth/token", &json!({"api_key": "key-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let app = router(app_state(&[]).await);
        let (status, body) = send(
            &app,
            HttpRequest::get("/api/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["agents"], 0);
    }

    #[tokio::test]
    async fn test_issue_and_verify_token() {
        let app = router(app_state(&["/api/**"]).await);
        let token = token(&app).await;

        let (status, claims) = send(
            &app,
            post_json("/api/v1/auth/verify", &json!({"token": token})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(claims["customer_id"], "c1");

        let (status, body) = send(
            &app,
            post_json("/api/v1/auth/token", &json!({"api_key": "wrong"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNAUTHENTICATED");
    }

    #[tokio::test]
    async fn test_metrics_requires_bearer() {
        let app = router(app_state(&[]).await);
        let (status, _) = send(
            &app,
            HttpRequest::get("/api/v1/metrics").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let token = token(&app).await;
        let (status, body) = send(
            &app,
            HttpRequest::get("/api/v1/metrics")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["customer_id"], "c1");
        assert_eq!(body["aggregated"]["total_requests"], 0);
    }

    #[tokio::test]
    async fn test_prometheus_scrape_counts_rejections() {
        let app = router(app_state(&["/api/**"]).await);
        let (status, _) = send(
            &app,
            HttpRequest::get("/api/v1/proxy/api/widgets")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let resp = app
            .clone()
            .oneshot(HttpRequest::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("proxy_validation_failures_total{reason=\"MISSING_HEADER\"} 1"));
    }

    #[tokio::test]
    async fn test_proxy_admission_order() {
        let app = router(app_state(&["/api/**"]).await);

        // Validation runs before auth.
        let (status, body) = send(
            &app,
            HttpRequest::get("/api/v1/proxy/api/widgets")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["reason"], "MISSING_HEADER");

        let (status, body) = send(&app, proxied("/api/v1/proxy/api/widgets", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNAUTHENTICATED");

        let token = token(&app).await;
        let (status, body) = send(&app, proxied("/api/v1/proxy/admin/users", Some(&token))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "UNAUTHORIZED");

        let (status, body) = send(&app, proxied("/api/v1/proxy/api/widgets", Some(&token))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "NO_AGENT_AVAILABLE");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_body_hits_read_timeout() {
        let mut config = Config::default();
        config.server.read_timeout_secs = 5;
        config.server.write_timeout_secs = 60;
        let app = router(app_state_with(config, &[]).await);

        let stalled = futures::stream::pending::<Result<axum::body::Bytes, std::io::Error>>();
        let req = HttpRequest::post("/api/v1/auth/token")
            .header("content-type", "application/json")
            .body(Body::from_stream(stalled))
            .unwrap();

        let started = tokio::time::Instant::now();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_panic_renders_internal_error() {
        let resp = handle_panic(Box::new("boom"));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "INTERNAL_SERVER_ERROR");
    }
}
