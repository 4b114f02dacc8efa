//! Domain records shared between the stores, the auth path and the tunnel.
//!
//! Everything here is plain serde data. Persistence lives in [`crate::store`],
//! behaviour lives with the component that owns the record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account status of a customer. Only `active` customers may obtain or use tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomerStatus {
    Active,
    Inactive,
    Suspended,
}

/// A tenant owning agents and a caller identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub api_key: String,
    pub status: CustomerStatus,
    /// Route patterns (`*` = one segment, `**` = remainder) callers may access.
    #[serde(default)]
    pub allowed_routes: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Customer {
    pub fn is_active(&self) -> bool {
        self.status == CustomerStatus::Active
    }
}

/// Registration status of an agent record in the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Inactive,
}

/// Directory record for an agent. Distinct from a live tunnel connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub customer_id: String,
    #[serde(default)]
    pub name: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl AgentRecord {
    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }
}

/// Per-customer proxy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub customer_id: String,
    /// Upper bound for one forwarded call, in seconds.
    pub timeout_secs: u64,
    /// Headers injected into every request forwarded for this customer.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Rate limit advertised to agents in a `config_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub requests: u32,
    pub window_secs: u64,
}

/// Settings pushed to an agent after each heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub customer_id: String,
    pub heartbeat_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub max_request_size: u64,
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub routes: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

/// Gauges reported by an agent in a `metrics_update` frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    #[serde(default, alias = "uptime")]
    pub uptime_secs: u64,
    #[serde(default)]
    pub memory_usage: f64,
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub requests_processed: u64,
    #[serde(default, alias = "average_latency")]
    pub average_latency_ms: f64,
    #[serde(default)]
    pub error_count: u64,
}

/// One forwarded call, appended to the directory after it completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub id: String,
    pub customer_id: String,
    pub path: String,
    pub method: String,
    pub status_code: u16,
    pub latency_ms: f64,
    pub request_size: u64,
    pub response_size: u64,
    pub timestamp: DateTime<Utc>,
}

/// Windowed aggregation over a customer's [`MetricRecord`]s.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    pub total_requests: u64,
    pub average_latency: f64,
    /// Share of calls with status >= 400.
    pub error_rate: f64,
    pub requests_per_minute: f64,
    pub average_request_size: u64,
}

/// Live gauges from the in-process recorder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentMetrics {
    pub active_connections: u64,
    pub request_count: u64,
    pub average_latency: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub customer_id: String,
    pub time_range: TimeRange,
    pub aggregated: AggregatedMetrics,
    pub current: CurrentMetrics,
}

/// HTTP request carried to an agent inside a `proxy_request` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
}

/// HTTP response returned by an agent inside a `proxy_response` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
}

/// Bodies travel as standard base64 strings inside JSON frames.
mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
