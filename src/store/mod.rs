//! Storage boundaries: the authoritative directory and the cache in front of it.

pub mod cache;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{AgentRecord, AggregatedMetrics, Customer, MetricRecord, ProxyConfig};

pub use cache::{Cache, CacheError, MemoryCache, TypedCache};
pub use memory::InMemoryDirectory;

/// Longest window metric aggregation looks back over, in seconds.
pub const METRIC_WINDOW_SECS: i64 = 60 * 60;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("failed to load seed file {path}: {reason}")]
    Seed { path: String, reason: String },
    #[error("unsupported store URI {0:?}; only memory:// is served in-process")]
    UnsupportedUri(String),
}

/// Source of truth for customers, agents, proxy configs and metric records.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn customer(&self, id: &str) -> Result<Option<Customer>, StoreError>;
    async fn customer_by_api_key(&self, api_key: &str) -> Result<Option<Customer>, StoreError>;
    async fn put_customer(&self, customer: Customer) -> Result<(), StoreError>;

    async fn agent(&self, id: &str) -> Result<Option<AgentRecord>, StoreError>;
    async fn put_agent(&self, agent: AgentRecord) -> Result<(), StoreError>;
    /// Stamp `last_seen` on an agent record, if it exists.
    async fn touch_agent(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn proxy_config(&self, customer_id: &str) -> Result<Option<ProxyConfig>, StoreError>;
    async fn put_proxy_config(&self, config: ProxyConfig) -> Result<(), StoreError>;

    /// Append one per-call record.
    async fn record_metric(&self, record: MetricRecord) -> Result<(), StoreError>;
    /// Aggregate a customer's records with `timestamp >= since`.
    async fn aggregate_metrics(
        &self,
        customer_id: &str,
        since: DateTime<Utc>,
    ) -> Result<AggregatedMetrics, StoreError>;
}

/// Open the cache named by `address`. Only `memory://` is served in-process.
pub fn open_cache(address: &str) -> Result<Arc<MemoryCache>, StoreError> {
    if address.starts_with("memory://") {
        Ok(Arc::new(MemoryCache::new()))
    } else {
        Err(StoreError::UnsupportedUri(address.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_cache_scheme() {
        assert!(open_cache("memory://").is_ok());
        assert!(matches!(
            open_cache("redis://localhost:6379"),
            Err(StoreError::UnsupportedUri(_))
        ));
    }
}
