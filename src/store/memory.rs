//! In-process [`Directory`], optionally seeded from a TOML file:
//!
//! ```toml
//! [[customers]]
//! id = "c1"
//! name = "Acme"
//! api_key = "acme-key"
//! status = "active"
//! allowed_routes = ["/api/**"]
//!
//! [[agents]]
//! id = "a1"
//! customer_id = "c1"
//! status = "active"
//!
//! [[proxy_configs]]
//! customer_id = "c1"
//! timeout_secs = 15
//! ```
//!
//! Metric records are kept only for the aggregation window.

use std::collections::VecDeque;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::RwLock;

use super::{Directory, StoreError, METRIC_WINDOW_SECS};
use crate::models::{AgentRecord, AggregatedMetrics, Customer, MetricRecord, ProxyConfig};

#[derive(Debug, Default, Deserialize)]
struct Seed {
    #[serde(default)]
    customers: Vec<Customer>,
    #[serde(default)]
    agents: Vec<AgentRecord>,
    #[serde(default)]
    proxy_configs: Vec<ProxyConfig>,
}

pub struct InMemoryDirectory {
    customers: DashMap<String, Customer>,
    agents: DashMap<String, AgentRecord>,
    proxy_configs: DashMap<String, ProxyConfig>,
    /// Oldest first.
    metrics: RwLock<VecDeque<MetricRecord>>,
    retention: TimeDelta,
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self {
            customers: DashMap::new(),
            agents: DashMap::new(),
            proxy_configs: DashMap::new(),
            metrics: RwLock::new(VecDeque::new()),
            retention: TimeDelta::seconds(METRIC_WINDOW_SECS),
        }
    }
}

/// Pop records stamped before `cutoff` off the front.
fn prune(records: &mut VecDeque<MetricRecord>, cutoff: DateTime<Utc>) -> usize {
    let mut dropped = 0;
    while records.front().is_some_and(|r| r.timestamp < cutoff) {
        records.pop_front();
        dropped += 1;
    }
    dropped
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a `memory://` URI, loading `seed_path` when given.
    pub fn open(uri: &str, seed_path: Option<&str>) -> Result<Self, StoreError> {
        if !uri.starts_with("memory://") {
            return Err(StoreError::UnsupportedUri(uri.to_string()));
        }
        match seed_path {
            Some(path) => Self::from_seed_file(path),
            None => Ok(Self::new()),
        }
    }

    pub fn from_seed_file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let seed_err = |reason: String| StoreError::Seed {
            path: path.display().to_string(),
            reason,
        };
        let content = std::fs::read_to_string(path).map_err(|e| seed_err(e.to_string()))?;
        let seed: Seed = toml::from_str(&content).map_err(|e| seed_err(e.to_string()))?;
        Ok(Self::from_seed(seed))
    }

    fn from_seed(seed: Seed) -> Self {
        let dir = Self::new();
        for c in seed.customers {
            dir.customers.insert(c.id.clone(), c);
        }
        for a in seed.agents {
            dir.agents.insert(a.id.clone(), a);
        }
        for p in seed.proxy_configs {
            dir.proxy_configs.insert(p.customer_id.clone(), p);
        }
        dir
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn customer(&self, id: &str) -> Result<Option<Customer>, StoreError> {
        Ok(self.customers.get(id).map(|c| c.clone()))
    }

    async fn customer_by_api_key(&self, api_key: &str) -> Result<Option<Customer>, StoreError> {
        Ok(self
            .customers
            .iter()
            .find(|c| c.api_key == api_key)
            .map(|c| c.clone()))
    }

    async fn put_customer(&self, customer: Customer) -> Result<(), StoreError> {
        self.customers.insert(customer.id.clone(), customer);
        Ok(())
    }

    async fn agent(&self, id: &str) -> Result<Option<AgentRecord>, StoreError> {
        Ok(self.agents.get(id).map(|a| a.clone()))
    }

    async fn put_agent(&self, agent: AgentRecord) -> Result<(), StoreError> {
        self.agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    async fn touch_agent(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(mut agent) = self.agents.get_mut(id) {
            agent.last_seen = Some(at);
        }
        Ok(())
    }

    async fn proxy_config(&self, customer_id: &str) -> Result<Option<ProxyConfig>, StoreError> {
        Ok(self.proxy_configs.get(customer_id).map(|p| p.clone()))
    }

    async fn put_proxy_config(&self, config: ProxyConfig) -> Result<(), StoreError> {
        self.proxy_configs
            .insert(config.customer_id.clone(), config);
        Ok(())
    }

    async fn record_metric(&self, record: MetricRecord) -> Result<(), StoreError> {
        let cutoff = Utc::now() - self.retention;
        let mut metrics = self.metrics.write().await;
        prune(&mut metrics, cutoff);
        if record.timestamp >= cutoff {
            metrics.push_back(record);
        }
        Ok(())
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
    async fn aggregate_metrics(
        &self,
        customer_id: &str,
        since: DateTime<Utc>,
    ) -> Result<AggregatedMetrics, StoreError> {
        let metrics = self.metrics.read().await;
        let window: Vec<&MetricRecord> = metrics
            .iter()
            .filter(|m| m.customer_id == customer_id && m.timestamp >= since)
            .collect();

        let total = window.len() as u64;
        if total == 0 {
            return Ok(AggregatedMetrics::default());
        }

        let latency_sum: f64 = window.iter().map(|m| m.latency_ms).sum();
        let errors = window.iter().filter(|m| m.status_code >= 400).count() as u64;
        let size_sum: u64 = window.iter().map(|m| m.request_size).sum();
        let minutes = ((Utc::now() - since).num_milliseconds() as f64 / 60_000.0).max(1.0 / 60.0);

        Ok(AggregatedMetrics {
            total_requests: total,
            average_latency: latency_sum / total as f64,
            error_rate: errors as f64 / total as f64,
            requests_per_minute: total as f64 / minutes,
            average_request_size: size_sum / total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentStatus, CustomerStatus};
    use chrono::Duration;

    fn record(customer: &str, status: u16, latency: f64, size: u64, age_mins: i64) -> MetricRecord {
        MetricRecord {
            id: uuid::Uuid::new_v4().to_string(),
            customer_id: customer.into(),
            path: "/api/x".into(),
            method: "GET".into(),
            status_code: status,
            latency_ms: latency,
            request_size: size,
            response_size: 0,
            timestamp: Utc::now() - Duration::minutes(age_mins),
        }
    }

    #[tokio::test]
    async fn test_seed_parsing() {
        let seed: Seed = toml::from_str(
            r#"
            [[customers]]
            id = "c1"
            name = "Acme"
            api_key = "k1"
            status = "active"
            allowed_routes = ["/api/**"]

            [[agents]]
            id = "a1"
            customer_id = "c1"
            status = "inactive"
            "#,
        )
        .unwrap();
        let dir = InMemoryDirectory::from_seed(seed);
        let c = dir.customer_by_api_key("k1").await.unwrap().unwrap();
        assert_eq!(c.id, "c1");
        assert_eq!(c.status, CustomerStatus::Active);
        let a = dir.agent("a1").await.unwrap().unwrap();
        assert_eq!(a.status, AgentStatus::Inactive);
        assert!(dir.proxy_config("c1").await.unwrap().is_none());
    }

    #[test]
    fn test_open_rejects_external_uri() {
        assert!(matches!(
            InMemoryDirectory::open("mongodb://db:27017", None),
            Err(StoreError::UnsupportedUri(_))
        ));
        assert!(InMemoryDirectory::open("memory://", None).is_ok());
    }

    #[tokio::test]
    async fn test_aggregate_window_and_error_rate() {
        let dir = InMemoryDirectory::new();
        dir.record_metric(record("c1", 200, 10.0, 100, 5)).await.unwrap();
        dir.record_metric(record("c1", 404, 30.0, 300, 10)).await.unwrap();
        dir.record_metric(record("c1", 500, 20.0, 200, 90)).await.unwrap();
        dir.record_metric(record("c2", 200, 99.0, 1, 1)).await.unwrap();

        let agg = dir
            .aggregate_metrics("c1", Utc::now() - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(agg.total_requests, 2);
        assert!((agg.average_latency - 20.0).abs() < f64::EPSILON);
        assert!((agg.error_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(agg.average_request_size, 200);
        assert!(agg.requests_per_minute > 0.0);
    }

    #[tokio::test]
    async fn test_records_outside_window_are_not_kept() {
        let dir = InMemoryDirectory::new();
        for _ in 0..100 {
            dir.record_metric(record("c1", 200, 1.0, 1, 120)).await.unwrap();
        }
        dir.record_metric(record("c1", 200, 1.0, 1, 1)).await.unwrap();
        assert_eq!(dir.metrics.read().await.len(), 1);
    }

    #[test]
    fn test_prune_pops_expired_front() {
        let mut records: VecDeque<MetricRecord> = [90, 70, 30, 5]
            .into_iter()
            .map(|age| record("c1", 200, 1.0, 1, age))
            .collect();
        let dropped = prune(&mut records, Utc::now() - Duration::hours(1));
        assert_eq!(dropped, 2);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.timestamp > Utc::now() - Duration::hours(1)));
    }

    #[tokio::test]
    async fn test_aggregate_empty() {
        let dir = InMemoryDirectory::new();
        let agg = dir.aggregate_metrics("nobody", Utc::now()).await.unwrap();
        assert_eq!(agg, AggregatedMetrics::default());
    }
}
