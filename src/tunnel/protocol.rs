//! Wire format carried over an agent's WebSocket.
//!
//! Every text frame is one JSON [`Envelope`]:
//!
//! ```json
//! {"type": "proxy_request", "correlation_id": "…", "payload": {…}, "timestamp": "…"}
//! ```
//!
//! Agents built against the older field name may send `request_id` instead of
//! `correlation_id`; both are accepted on input.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{AgentConfig, ProxyRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    ProxyRequest,
    ProxyResponse,
    Heartbeat,
    ConfigUpdate,
    MetricsUpdate,
    Error,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, alias = "request_id", skip_serializing_if = "String::is_empty")]
    pub correlation_id: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Body of an `error` frame sent by an agent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorPayload {
    #[serde(default, alias = "message")]
    pub error: String,
    /// Some agents put the id here rather than on the envelope.
    #[serde(default)]
    pub request_id: Option<String>,
}

impl Envelope {
    pub fn new(kind: MessageType, correlation_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            correlation_id: correlation_id.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn proxy_request(
        correlation_id: &str,
        request: &ProxyRequest,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            MessageType::ProxyRequest,
            correlation_id,
            serde_json::to_value(request)?,
        ))
    }

    pub fn config_update(config: &AgentConfig) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            MessageType::ConfigUpdate,
            String::new(),
            serde_json::to_value(config)?,
        ))
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accepts_request_id_alias() {
        let env = Envelope::decode(
            r#"{"type":"proxy_response","request_id":"r-1","payload":{"status":200}}"#,
        )
        .unwrap();
        assert_eq!(env.kind, MessageType::ProxyResponse);
        assert_eq!(env.correlation_id, "r-1");
        assert_eq!(env.payload["status"], 200);
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let env = Envelope::decode(r#"{"type":"telemetry.v2","payload":null}"#).unwrap();
        assert_eq!(env.kind, MessageType::Unknown);
        assert!(env.correlation_id.is_empty());
    }

    #[test]
    fn test_proxy_request_frame_shape() {
        let req = ProxyRequest {
            method: "POST".into(),
            path: "/orders".into(),
            query: None,
            headers: std::collections::BTreeMap::new(),
            body: b"{}".to_vec(),
        };
        let text = Envelope::proxy_request("abc", &req).unwrap().encode().unwrap();
        let raw: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(raw["type"], "proxy_request");
        assert_eq!(raw["correlation_id"], "abc");
        assert_eq!(raw["payload"]["method"], "POST");
        assert_eq!(raw["payload"]["body"], "e30=");
        assert!(raw["timestamp"].is_string());
    }

    #[test]
    fn test_error_payload_forms() {
        let p: ErrorPayload =
            serde_json::from_value(json!({"request_id": "r", "error": "boom"})).unwrap();
        assert_eq!(p.error, "boom");
        assert_eq!(p.request_id.as_deref(), Some("r"));
        let p: ErrorPayload = serde_json::from_value(json!({"message": "bad"})).unwrap();
        assert_eq!(p.error, "bad");
    }
}
