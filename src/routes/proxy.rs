//! `ANY /api/v1/proxy/{*path}`: forward an authenticated call to the
//! customer's agent.

use std::collections::BTreeMap;

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::Response,
    Extension,
};
use tracing::debug;

use crate::auth::Claims;
use crate::error::BrokerError;
use crate::models::{ProxyRequest, ProxyResponse};
use crate::state::AppState;

/// Not forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Added to every forwarded request so the agent knows the caller's account.
const CUSTOMER_HEADER: &str = "x-customer-id";

pub async fn proxy(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(path): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, BrokerError> {
    let path = format!("/{path}");
    state.tokens.authorize(&claims, &path).await?;

    let request = ProxyRequest {
        method: method.to_string(),
        path,
        query: uri.query().map(String::from),
        headers: forwarded_headers(&headers, &claims.customer_id),
        body: body.to_vec(),
    };
    let response = state.proxy.forward(&claims.customer_id, request).await?;
    Ok(into_response(response))
}

fn skipped(name: &str) -> bool {
    HOP_BY_HOP.contains(&name) || name == "host" || name == "authorization"
}

/// Caller headers minus hop-by-hop and credentials. Repeated headers are
/// joined with `", "`.
fn forwarded_headers(headers: &HeaderMap, customer_id: &str) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.as_str();
        if skipped(name) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            debug!(header = name, "Dropping non-UTF-8 header");
            continue;
        };
        out.entry(name.to_string())
            .and_modify(|v| {
                v.push_str(", ");
                v.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out.insert(CUSTOMER_HEADER.to_string(), customer_id.to_string());
    out
}

fn into_response(resp: ProxyResponse) -> Response {
    let mut response = Response::new(Body::from(resp.body));
    *response.status_mut() = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let headers = response.headers_mut();
    for (name, value) in resp.headers {
        if skipped(&name.to_ascii_lowercase()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.append(name, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarded_headers_strip_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer t"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("host", HeaderValue::from_static("relay.example.com"));
        headers.insert("x-customer-id", HeaderValue::from_static("spoofed"));
        headers.append("accept", HeaderValue::from_static("text/html"));
        headers.append("accept", HeaderValue::from_static("application/json"));

        let out = forwarded_headers(&headers, "c1");
        assert_eq!(out.get("accept").map(String::as_str), Some("text/html, application/json"));
        assert_eq!(out.get("x-customer-id").map(String::as_str), Some("c1"));
        assert!(!out.contains_key("authorization"));
        assert!(!out.contains_key("connection"));
        assert!(!out.contains_key("host"));
    }

    #[test]
    fn test_agent_response_mapping() {
        let resp = into_response(ProxyResponse {
            status: 201,
            headers: BTreeMap::from([
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Transfer-Encoding".to_string(), "chunked".to_string()),
                ("bad header".to_string(), "x".to_string()),
            ]),
            body: b"{}".to_vec(),
        });
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers()["content-type"], "application/json");
        assert!(resp.headers().get("transfer-encoding").is_none());

        let resp = into_response(ProxyResponse {
            status: 42,
            headers: BTreeMap::new(),
            body: Vec::new(),
        });
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
