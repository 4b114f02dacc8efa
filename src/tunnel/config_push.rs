//! Contents of the `config_update` frame pushed after each heartbeat.

use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::config::AgentSettings;
use crate::models::{AgentConfig, RateLimitSettings};
use crate::store::TypedCache;

/// How long a generated default config stays cached.
const DEFAULT_CONFIG_TTL: Duration = Duration::from_secs(5 * 60);

/// Resolves a customer's [`AgentConfig`] from the cache, falling back to a
/// default built from process settings.
#[derive(Clone)]
pub struct AgentConfigSource {
    cache: TypedCache,
    heartbeat_interval_secs: u64,
    request_timeout_secs: u64,
    max_request_size: u64,
    rate_limit: RateLimitSettings,
    allowed_origins: Vec<String>,
}

impl AgentConfigSource {
    pub fn new(settings: &AgentSettings, cache: TypedCache) -> Self {
        Self {
            cache,
            heartbeat_interval_secs: settings.heartbeat_interval_secs,
            request_timeout_secs: settings.max_request_timeout_secs,
            max_request_size: settings.max_request_size,
            rate_limit: RateLimitSettings {
                requests: settings.security.rate_limit.requests,
                window_secs: settings.security.rate_limit.time_window_secs,
            },
            allowed_origins: settings.allowed_origins.clone(),
        }
    }

    pub async fn for_customer(&self, customer_id: &str) -> AgentConfig {
        if let Some(config) = self.cache.agent_config(customer_id).await {
            return config;
        }
        let config = self.default_config(customer_id);
        debug!(customer_id, "Caching default agent config");
        self.cache.set_agent_config(&config, DEFAULT_CONFIG_TTL).await;
        config
    }

    fn default_config(&self, customer_id: &str) -> AgentConfig {
        AgentConfig {
            customer_id: customer_id.to_string(),
            heartbeat_interval_secs: self.heartbeat_interval_secs,
            request_timeout_secs: self.request_timeout_secs,
            max_request_size: self.max_request_size,
            rate_limit: self.rate_limit.clone(),
            allowed_origins: self.allowed_origins.clone(),
            routes: vec!["/**".to_string()],
            last_updated: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::store::MemoryCache;

    #[tokio::test]
    async fn test_default_is_cached() {
        let cache = TypedCache::new(Arc::new(MemoryCache::new()));
        let source = AgentConfigSource::new(&AgentSettings::default(), cache.clone());

        let first = source.for_customer("c1").await;
        assert_eq!(first.routes, vec!["/**"]);
        assert_eq!(first.heartbeat_interval_secs, 30);
        assert_eq!(cache.agent_config("c1").await, Some(first.clone()));
        assert_eq!(source.for_customer("c1").await, first);
    }

    #[tokio::test]
    async fn test_prefers_cached_config() {
        let cache = TypedCache::new(Arc::new(MemoryCache::new()));
        let source = AgentConfigSource::new(&AgentSettings::default(), cache.clone());
        let mut custom = source.default_config("c2");
        custom.routes = vec!["/orders/**".into()];
        cache
            .set_agent_config(&custom, Duration::from_secs(60))
            .await;
        assert_eq!(source.for_customer("c2").await.routes, vec!["/orders/**"]);
    }
}
