//! Key/value cache boundary.
//!
//! The cache only ever speeds things up. [`TypedCache`] swallows (and logs)
//! every backend or decode error and reports a miss, so callers always fall
//! through to the directory.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::auth::token::Claims;
use crate::models::{AgentConfig, Customer, ProxyConfig};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache value codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// String get/set/delete with per-entry TTL.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Drop expired entries, returning how many went. Backends that expire
    /// keys themselves keep the default.
    async fn purge_expired(&self) -> Result<usize, CacheError> {
        Ok(0)
    }
}

/// In-process cache. Expired entries are dropped on read and by the
/// periodic purge.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.1 > now {
                return Ok(Some(entry.0.clone()));
            }
        }
        self.entries.remove_if(key, |_, (_, expires)| *expires <= now);
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires)| *expires > now);
        Ok(before.saturating_sub(self.entries.len()))
    }
}

/// Cache keys. Kept in one place so producers and consumers agree.
pub mod keys {
    pub fn customer(id: &str) -> String {
        format!("customer:{id}")
    }
    pub fn customer_by_api_key(api_key: &str) -> String {
        format!("customer_api_key:{api_key}")
    }
    pub fn proxy_config(customer_id: &str) -> String {
        format!("proxy_config:{customer_id}")
    }
    pub fn agent_config(customer_id: &str) -> String {
        format!("agent_config:{customer_id}")
    }
    pub fn token(token: &str) -> String {
        format!("token:{token}")
    }
    pub fn route_permission(customer_id: &str, route: &str) -> String {
        format!("route_permission:{customer_id}:{route}")
    }
    pub fn agent_credential(customer_id: &str, agent_id: &str) -> String {
        format!("agent_token:{customer_id}_{agent_id}")
    }
}

/// Best-effort typed accessors over any [`Cache`].
#[derive(Clone)]
pub struct TypedCache {
    inner: Arc<dyn Cache>,
}

impl TypedCache {
    pub fn new(inner: Arc<dyn Cache>) -> Self {
        Self { inner }
    }

    /// Purge expired entries every `period` until `shutdown` fires. Keys that
    /// are never read again (one per token, per checked path) would otherwise
    /// stay resident.
    pub fn spawn_purge(&self, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(
            async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    match inner.purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => debug!(purged, "Purged expired cache entries"),
                        Err(e) => warn!(error = %e, "Cache purge failed"),
                    }
                }
            }
            .instrument(info_span!("cache_purge")),
        )
    }

    /// Decode a JSON value; any error is logged and treated as a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.inner.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "Cache read failed, falling through");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Cached value undecodable, dropping");
                let _ = self.inner.delete(key).await;
                None
            }
        }
    }

    /// Encode and store a JSON value; errors are logged, never returned.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(key, error = %e, "Failed to encode cache value");
                return;
            }
        };
        if let Err(e) = self.inner.set(key, encoded, ttl).await {
            warn!(key, error = %e, "Cache write failed");
        } else {
            debug!(key, ttl_secs = ttl.as_secs(), "Cached");
        }
    }

    pub async fn invalidate(&self, key: &str) {
        if let Err(e) = self.inner.delete(key).await {
            warn!(key, error = %e, "Cache delete failed");
        }
    }

    pub async fn customer(&self, id: &str) -> Option<Customer> {
        self.get_json(&keys::customer(id)).await
    }

    pub async fn set_customer(&self, customer: &Customer, ttl: Duration) {
        self.set_json(&keys::customer(&customer.id), customer, ttl)
            .await;
    }

    pub async fn customer_by_api_key(&self, api_key: &str) -> Option<Customer> {
        self.get_json(&keys::customer_by_api_key(api_key)).await
    }

    pub async fn set_customer_by_api_key(&self, customer: &Customer, ttl: Duration) {
        self.set_json(&keys::customer_by_api_key(&customer.api_key), customer, ttl)
            .await;
    }

    pub async fn proxy_config(&self, customer_id: &str) -> Option<ProxyConfig> {
        self.get_json(&keys::proxy_config(customer_id)).await
    }

    pub async fn set_proxy_config(&self, config: &ProxyConfig, ttl: Duration) {
        self.set_json(&keys::proxy_config(&config.customer_id), config, ttl)
            .await;
    }

    pub async fn agent_config(&self, customer_id: &str) -> Option<AgentConfig> {
        self.get_json(&keys::agent_config(customer_id)).await
    }

    pub async fn set_agent_config(&self, config: &AgentConfig, ttl: Duration) {
        self.set_json(&keys::agent_config(&config.customer_id), config, ttl)
            .await;
    }

    pub async fn token_claims(&self, token: &str) -> Option<Claims> {
        self.get_json(&keys::token(token)).await
    }

    pub async fn set_token_claims(&self, token: &str, claims: &Claims, ttl: Duration) {
        self.set_json(&keys::token(token), claims, ttl).await;
    }

    pub async fn route_permission(&self, customer_id: &str, route: &str) -> Option<bool> {
        self.get_json(&keys::route_permission(customer_id, route))
            .await
    }

    pub async fn set_route_permission(
        &self,
        customer_id: &str,
        route: &str,
        allowed: bool,
        ttl: Duration,
    ) {
        self.set_json(&keys::route_permission(customer_id, route), &allowed, ttl)
            .await;
    }

    /// Whether a handshake credential was verified recently. The stored value
    /// is the credential itself so a different credential still gets checked.
    pub async fn agent_credential(&self, customer_id: &str, agent_id: &str) -> Option<String> {
        self.get_json(&keys::agent_credential(customer_id, agent_id))
            .await
    }

    pub async fn set_agent_credential(
        &self,
        customer_id: &str,
        agent_id: &str,
        credential: &str,
        ttl: Duration,
    ) {
        self.set_json(
            &keys::agent_credential(customer_id, agent_id),
            &credential,
            ttl,
        )
        .await;
    }
}
