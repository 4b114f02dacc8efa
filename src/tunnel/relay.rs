//! Agent-facing endpoints.
//!
//! - `GET  /api/v1/agent/connect` upgrades to the tunnel WebSocket. Requires
//!   `X-Agent-ID`, `X-Customer-ID` and `X-Agent-Token` (see `auth::handshake`).
//! - `GET  /api/v1/agent/health` and `GET /api/v1/agent/metrics` report on the
//!   agent named by `X-Agent-ID`.
//! - `POST /api/v1/agent/deregister` removes the agent; takes the same three
//!   headers as the upgrade.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header::ORIGIN, HeaderMap},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{info, info_span, warn, Instrument};

use super::connection::{socket_frames, AgentConnection};
use super::reader::{run_reader, TunnelServices};
use super::registry::AgentRegistry;
use crate::auth::HandshakeVerifier;
use crate::config::AgentSettings;
use crate::error::BrokerError;

pub const AGENT_ID_HEADER: &str = "x-agent-id";
pub const CUSTOMER_ID_HEADER: &str = "x-customer-id";
pub const AGENT_TOKEN_HEADER: &str = "x-agent-token";

/// State shared across the agent endpoints.
#[derive(Clone)]
pub struct RelayState {
    pub registry: AgentRegistry,
    pub verifier: Arc<HandshakeVerifier>,
    pub services: Arc<TunnelServices>,
    /// Accepted `Origin` values on upgrade. Empty accepts any.
    pub allowed_origins: Arc<Vec<String>>,
    /// Deadline for one write to an agent, probes included.
    pub write_timeout: Duration,
}

impl RelayState {
    pub fn new(
        settings: &AgentSettings,
        registry: AgentRegistry,
        verifier: Arc<HandshakeVerifier>,
        services: Arc<TunnelServices>,
    ) -> Self {
        Self {
            registry,
            verifier,
            services,
            allowed_origins: Arc::new(settings.allowed_origins.clone()),
            write_timeout: Duration::from_secs(settings.probe_timeout_secs.max(1)),
        }
    }
}

pub fn relay_router(state: RelayState) -> Router {
    Router::new()
        .route("/api/v1/agent/connect", get(agent_connect))
        .route("/api/v1/agent/health", get(agent_health))
        .route("/api/v1/agent/metrics", get(agent_metrics))
        .route("/api/v1/agent/deregister", post(agent_deregister))
        .with_state(state)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn origin_allowed(allowed: &[String], origin: Option<&str>) -> bool {
    allowed.is_empty() || origin.is_some_and(|o| allowed.iter().any(|a| a == o))
}

/// `GET /api/v1/agent/connect`: agent tunnel upgrade.
async fn agent_connect(
    State(state): State<RelayState>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let agent_id = header(&headers, AGENT_ID_HEADER).to_string();
    let customer_id = header(&headers, CUSTOMER_ID_HEADER).to_string();
    let token = header(&headers, AGENT_TOKEN_HEADER);

    if agent_id.is_empty() || customer_id.is_empty() {
        return BrokerError::Unauthenticated("missing agent credentials".into()).into_response();
    }

    let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok());
    if !origin_allowed(&state.allowed_origins, origin) {
        warn!(agent_id, origin, "Agent upgrade from disallowed origin");
        return BrokerError::Unauthorized("origin not allowed".into()).into_response();
    }

    if let Err(e) = state.verifier.verify(&agent_id, &customer_id, token).await {
        warn!(agent_id, customer_id, error = %e, "Agent authentication failed");
        return BrokerError::from(e).into_response();
    }

    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    info!(agent_id, customer_id, "Agent connecting...");
    let span = info_span!(
        parent: state.registry.span(),
        "agent",
        agent_id = %agent_id,
        customer_id = %customer_id,
    );
    ws.on_upgrade(move |socket| {
        handle_agent_socket(socket, state, agent_id, customer_id).instrument(span)
    })
}

async fn handle_agent_socket(
    socket: WebSocket,
    state: RelayState,
    agent_id: String,
    customer_id: String,
) {
    let (sink, stream) = socket.split();
    let conn = Arc::new(AgentConnection::new(
        agent_id,
        customer_id,
        Box::new(sink),
        state.write_timeout,
    ));
    state.registry.register(conn.clone()).await;
    run_reader(conn, socket_frames(stream), state.registry, state.services).await;
    info!("Agent disconnected");
}

/// `GET /api/v1/agent/health`
async fn agent_health(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<Json<Value>, BrokerError> {
    let agent_id = header(&headers, AGENT_ID_HEADER);
    let conn = state
        .registry
        .lookup(agent_id)
        .await
        .ok_or_else(|| BrokerError::NotFound(format!("agent {agent_id}")))?;

    Ok(Json(json!({
        "status": if conn.is_connected() { "healthy" } else { "unhealthy" },
        "agent_id": conn.agent_id(),
        "customer_id": conn.customer_id(),
        "connection": conn.status(),
        "connected_at": conn.connected_at(),
        "uptime_secs": conn.uptime().as_secs(),
        "last_seen_secs_ago": conn.silence().as_secs(),
        "pending_requests": conn.pending_count(),
    })))
}

/// `GET /api/v1/agent/metrics`: latest `metrics_update` from the agent.
async fn agent_metrics(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<Json<Value>, BrokerError> {
    let agent_id = header(&headers, AGENT_ID_HEADER);
    let conn = state
        .registry
        .lookup(agent_id)
        .await
        .ok_or_else(|| BrokerError::NotFound(format!("agent {agent_id}")))?;

    let metrics = conn.metrics().unwrap_or_default();
    state.services.recorder.agent_gauges(agent_id, &metrics);
    Ok(Json(json!({
        "status": "success",
        "agent_id": agent_id,
        "metrics": metrics,
    })))
}

/// `POST /api/v1/agent/deregister`
async fn agent_deregister(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<Json<Value>, BrokerError> {
    let agent_id = header(&headers, AGENT_ID_HEADER);
    let customer_id = header(&headers, CUSTOMER_ID_HEADER);
    let token = header(&headers, AGENT_TOKEN_HEADER);

    state.verifier.verify(agent_id, customer_id, token).await?;
    state.registry.deregister(agent_id, customer_id).await?;
    Ok(Json(json!({"status": "deregistered", "agent_id": agent_id})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;
    use tracing::Span;

    use crate::auth::sign_agent_credential;
    use crate::metrics::MetricsRecorder;
    use crate::models::{AgentMetrics, AgentRecord, AgentStatus, Customer, CustomerStatus};
    use crate::store::{Directory, InMemoryDirectory, MemoryCache, TypedCache};
    use crate::tunnel::AgentConfigSource;

    async fn state() -> RelayState {
        let settings = AgentSettings::default();
        let dir = Arc::new(InMemoryDirectory::new());
        dir.put_customer(Customer {
            id: "c1".into(),
            name: "Acme".into(),
            api_key: "k1".into(),
            status: CustomerStatus::Active,
            allowed_routes: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
        dir.put_agent(AgentRecord {
            id: "a1".into(),
            customer_id: "c1".into(),
            name: "edge".into(),
            status: AgentStatus::Active,
            version: None,
            last_seen: None,
        })
        .await
        .unwrap();

        let cache = TypedCache::new(Arc::new(MemoryCache::new()));
        let recorder = Arc::new(MetricsRecorder::new().unwrap());
        let registry = AgentRegistry::new(
            &settings,
            recorder.clone(),
            Span::none(),
            CancellationToken::new(),
        );
        let verifier = Arc::new(HandshakeVerifier::new(&settings, dir.clone(), cache.clone()));
        let services = Arc::new(TunnelServices {
            directory: dir,
            recorder,
            configs: AgentConfigSource::new(&settings, cache),
        });
        RelayState::new(&settings, registry, verifier, services)
    }

    fn request(method: &str, uri: &str, headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn registered(state: &RelayState) -> Arc<AgentConnection> {
        let (tx, _rx) = mpsc::channel(8);
        let conn = Arc::new(AgentConnection::new(
            "a1",
            "c1",
            Box::new(tx),
            Duration::from_secs(1),
        ));
        state.registry.register(conn.clone()).await;
        conn
    }

    #[test]
    fn test_origin_allowed() {
        assert!(origin_allowed(&[], None));
        let allowed = vec!["https://agents.example.com".to_string()];
        assert!(origin_allowed(&allowed, Some("https://agents.example.com")));
        assert!(!origin_allowed(&allowed, Some("https://evil.example.com")));
        assert!(!origin_allowed(&allowed, None));
    }

    #[tokio::test]
    async fn test_connect_requires_identity_headers() {
        let app = relay_router(state().await);
        let resp = app
            .oneshot(request("GET", "/api/v1/agent/connect", &[]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_credential() {
        let app = relay_router(state().await);
        let resp = app
            .oneshot(request(
                "GET",
                "/api/v1/agent/connect",
                &[
                    ("x-agent-id", "a1"),
                    ("x-customer-id", "c1"),
                    ("x-agent-token", "123.deadbeef"),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_health_and_metrics_for_registered_agent() {
        let state = state().await;
        let conn = registered(&state).await;
        conn.set_metrics(AgentMetrics {
            uptime_secs: 99,
            memory_usage: 1024.0,
            cpu_usage: 0.5,
            ..AgentMetrics::default()
        });
        let app = relay_router(state);

        let resp = app
            .clone()
            .oneshot(request("GET", "/api/v1/agent/health", &[("x-agent-id", "a1")]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["agent_id"], "a1");
        assert_eq!(body["customer_id"], "c1");

        let resp = app
            .clone()
            .oneshot(request("GET", "/api/v1/agent/metrics", &[("x-agent-id", "a1")]))
            .await
            .unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["metrics"]["uptime_secs"], 99);

        let resp = app
            .oneshot(request("GET", "/api/v1/agent/health", &[("x-agent-id", "zz")]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_deregister_requires_credential() {
        let state = state().await;
        registered(&state).await;
        let registry = state.registry.clone();
        let app = relay_router(state);

        let resp = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/v1/agent/deregister",
                &[("x-agent-id", "a1"), ("x-customer-id", "c1")],
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(registry.lookup("a1").await.is_some());

        let credential = sign_agent_credential("a1", "c1", "k1", Utc::now().timestamp());
        let resp = app
            .oneshot(request(
                "POST",
                "/api/v1/agent/deregister",
                &[
                    ("x-agent-id", "a1"),
                    ("x-customer-id", "c1"),
                    ("x-agent-token", credential.as_str()),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(registry.lookup("a1").await.is_none());
    }
}
