//! Proxy orchestrator: picks the agent serving a customer and forwards one
//! call through it behind that customer's circuit breaker.
//!
//! The customer → agent table is rebuilt wholesale every
//! `proxy.routing_refresh_secs` from the registry's connected agents. An
//! agent that disconnects stays routable until the next rebuild; calls to it
//! fail fast with `AGENT_DISCONNECTED`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};
use uuid::Uuid;

use crate::config::Config;
use crate::error::BrokerError;
use crate::metrics::MetricsService;
use crate::models::{MetricRecord, ProxyConfig, ProxyRequest, ProxyResponse};
use crate::resilience::{CircuitBreaker, CircuitError};
use crate::store::{Directory, TypedCache};
use crate::tunnel::{AgentRegistry, RegistryError};

/// Cache lifetime of a proxy config fetched from the directory.
const PROXY_CONFIG_TTL: Duration = Duration::from_secs(5 * 60);

pub struct ProxyService {
    registry: AgentRegistry,
    directory: Arc<dyn Directory>,
    cache: TypedCache,
    metrics: MetricsService,
    routes: RwLock<HashMap<String, String>>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    failure_threshold: u32,
    open_timeout: Duration,
    default_timeout: Duration,
    max_timeout: Duration,
    refresh_interval: Duration,
    span: Span,
}

impl ProxyService {
    pub fn new(
        config: &Config,
        registry: AgentRegistry,
        directory: Arc<dyn Directory>,
        cache: TypedCache,
        metrics: MetricsService,
        span: Span,
    ) -> Self {
        Self {
            registry,
            directory,
            cache,
            metrics,
            routes: RwLock::new(HashMap::new()),
            breakers: DashMap::new(),
            failure_threshold: config.resilience.failure_threshold,
            open_timeout: Duration::from_secs(config.resilience.open_timeout_secs),
            default_timeout: Duration::from_secs(config.proxy.default_timeout_secs),
            max_timeout: config.agent.max_request_timeout(),
            refresh_interval: Duration::from_secs(config.proxy.routing_refresh_secs.max(1)),
            span,
        }
    }

    /// Start the periodic routing table rebuild. The first rebuild runs
    /// immediately; the task exits when `shutdown` fires.
    pub fn spawn_route_refresh(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let span = self.span.clone();
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(service.refresh_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => service.rebuild_routes().await,
                        () = shutdown.cancelled() => break,
                    }
                }
                debug!("Routing refresh stopped");
            }
            .instrument(span),
        )
    }

    /// Replace the routing table with a snapshot of connected agents. When a
    /// customer has several agents the most recently connected one wins.
    pub async fn rebuild_routes(&self) {
        let mut agents = self.registry.active_agents().await;
        agents.sort_by_key(|conn| conn.connected_at());

        let table: HashMap<String, String> = agents
            .iter()
            .map(|conn| (conn.customer_id().to_string(), conn.agent_id().to_string()))
            .collect();
        debug!(customers = table.len(), "Routing table rebuilt");
        *self.routes.write().await = table;
    }

    pub async fn agent_for(&self, customer_id: &str) -> Option<String> {
        self.routes.read().await.get(customer_id).cloned()
    }

    /// Breaker guarding `customer_id`, created closed on first use.
    pub fn breaker(&self, customer_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(customer_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    customer_id,
                    self.failure_threshold,
                    self.open_timeout,
                ))
            })
            .clone()
    }

    /// Proxy config for a customer: cache, then directory, else defaults.
    /// Lookup failures never fail the call.
    pub async fn proxy_config(&self, customer_id: &str) -> ProxyConfig {
        if let Some(config) = self.cache.proxy_config(customer_id).await {
            return config;
        }
        match self.directory.proxy_config(customer_id).await {
            Ok(Some(config)) => {
                self.cache.set_proxy_config(&config, PROXY_CONFIG_TTL).await;
                config
            }
            Ok(None) => self.default_config(customer_id),
            Err(e) => {
                warn!(customer_id, error = %e, "Proxy config lookup failed, using defaults");
                self.default_config(customer_id)
            }
        }
    }

    fn default_config(&self, customer_id: &str) -> ProxyConfig {
        ProxyConfig {
            customer_id: customer_id.to_string(),
            timeout_secs: self.default_timeout.as_secs(),
            headers: std::collections::BTreeMap::new(),
        }
    }

    /// Forward one caller request for `customer_id` and return the agent's
    /// response. Agent 5xx responses are returned to the caller but count
    /// as breaker failures.
    pub async fn forward(
        &self,
        customer_id: &str,
        mut request: ProxyRequest,
    ) -> Result<ProxyResponse, BrokerError> {
        let started = Instant::now();
        let recorder = self.metrics.recorder();

        let Some(agent_id) = self.agent_for(customer_id).await else {
            recorder.proxy_error(customer_id, "NO_AGENT_AVAILABLE");
            return Err(BrokerError::NoAgentAvailable(customer_id.to_string()));
        };

        let config = self.proxy_config(customer_id).await;
        let timeout = Duration::from_secs(config.timeout_secs).min(self.max_timeout);
        for (name, value) in config.headers {
            request.headers.insert(name.to_ascii_lowercase(), value);
        }

        let breaker = self.breaker(customer_id);
        let outcome = breaker
            .call_with(
                || self.registry.route_request(&agent_id, &request, timeout),
                |result| matches!(result, Ok(resp) if resp.status < 500),
            )
            .await;

        let result = match outcome {
            Ok(response) => Ok(response),
            Err(CircuitError::Open) => {
                recorder.circuit_open(customer_id);
                Err(BrokerError::CircuitOpen(customer_id.to_string()))
            }
            Err(CircuitError::Inner(RegistryError::NotFound(id))) => {
                Err(BrokerError::AgentDisconnected(id))
            }
            Err(CircuitError::Inner(e)) => Err(BrokerError::from(e)),
        };

        let status = match &result {
            Ok(resp) => resp.status,
            Err(e) => {
                recorder.proxy_error(customer_id, e.code());
                e.status().as_u16()
            }
        };
        let latency = started.elapsed();
        self.metrics
            .record_call(MetricRecord {
                id: Uuid::new_v4().to_string(),
                customer_id: customer_id.to_string(),
                path: request.path.clone(),
                method: request.method.clone(),
                status_code: status,
                latency_ms: latency.as_secs_f64() * 1000.0,
                request_size: request.body.len() as u64,
                response_size: result.as_ref().map_or(0, |r| r.body.len() as u64),
                timestamp: Utc::now(),
            })
            .await;

        if let Ok(resp) = &result {
            info!(
                customer_id,
                agent_id = %agent_id,
                method = %request.method,
                path = %request.path,
                status = resp.status,
                latency_ms = latency.as_millis(),
                "Proxied request"
            );
        }
        result
    }
}
