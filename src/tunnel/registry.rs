//! Agent membership.
//!
//! One map from agent id to connection, guarded by a single `RwLock`. Network
//! I/O never happens while that lock is held: probes and close frames go
//! through each connection's own write lock.
//!
//! Two independent mechanisms evict silent agents:
//!
//! - a health monitor per registration probes every heartbeat interval and
//!   evicts once the agent has been silent for `interval * miss_limit`
//! - one reaper per registry scans every `reaper_interval` and evicts
//!   anything silent for longer than the inactivity ceiling
//!
//! Both may target the same connection; eviction is idempotent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument, Span};

use super::connection::AgentConnection;
use super::TunnelError;
use crate::config::AgentSettings;
use crate::metrics::MetricsRecorder;
use crate::models::{ProxyRequest, ProxyResponse};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("agent {0} is not registered")]
    NotFound(String),
    #[error("agent {agent_id} does not belong to customer {customer_id}")]
    Unauthorized {
        agent_id: String,
        customer_id: String,
    },
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

#[derive(Clone)]
pub struct AgentRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    agents: RwLock<HashMap<String, Arc<AgentConnection>>>,
    recorder: Arc<MetricsRecorder>,
    heartbeat_interval: Duration,
    heartbeat_deadline: Duration,
    reaper_interval: Duration,
    inactivity_timeout: Duration,
    span: Span,
    shutdown: CancellationToken,
}

impl AgentRegistry {
    /// Build the registry and start its reaper. Background tasks stop when
    /// `shutdown` is cancelled.
    pub fn new(
        settings: &AgentSettings,
        recorder: Arc<MetricsRecorder>,
        span: Span,
        shutdown: CancellationToken,
    ) -> Self {
        let registry = Self {
            inner: Arc::new(Inner {
                agents: RwLock::new(HashMap::new()),
                recorder,
                heartbeat_interval: settings.heartbeat_interval(),
                heartbeat_deadline: settings.heartbeat_deadline(),
                reaper_interval: Duration::from_secs(settings.reaper_interval_secs.max(1)),
                inactivity_timeout: Duration::from_secs(settings.inactivity_timeout_secs),
                span,
                shutdown,
            }),
        };
        registry.spawn_reaper();
        registry
    }

    /// Insert `conn`, closing any previous connection for the same agent id.
    pub async fn register(&self, conn: Arc<AgentConnection>) {
        conn.mark_connected();
        conn.touch();

        let previous = self
            .inner
            .agents
            .write()
            .await
            .insert(conn.agent_id().to_string(), conn.clone());

        if let Some(old) = previous {
            warn!(
                agent_id = %conn.agent_id(),
                old_connection = %old.connection_id(),
                "Agent re-registered, closing previous connection"
            );
            old.close("replaced by new connection").await;
            self.inner
                .recorder
                .agent_disconnected(old.agent_id(), old.customer_id(), "replaced");
        }

        self.inner
            .recorder
            .agent_connected(conn.agent_id(), conn.customer_id());
        self.spawn_health_monitor(conn.clone());
        info!(
            agent_id = %conn.agent_id(),
            customer_id = %conn.customer_id(),
            connection_id = %conn.connection_id(),
            "Agent registered"
        );
    }

    pub async fn lookup(&self, agent_id: &str) -> Option<Arc<AgentConnection>> {
        self.inner.agents.read().await.get(agent_id).cloned()
    }

    /// Registered agents whose connection is still `connected`.
    pub async fn active_agents(&self) -> Vec<Arc<AgentConnection>> {
        self.inner
            .agents
            .read()
            .await
            .values()
            .filter(|c| c.is_connected())
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove an agent on behalf of its owner.
    pub async fn deregister(&self, agent_id: &str, customer_id: &str) -> Result<(), RegistryError> {
        let conn = {
            let mut agents = self.inner.agents.write().await;
            match agents.get(agent_id) {
                None => return Err(RegistryError::NotFound(agent_id.to_string())),
                Some(c) if c.customer_id() != customer_id => {
                    return Err(RegistryError::Unauthorized {
                        agent_id: agent_id.to_string(),
                        customer_id: customer_id.to_string(),
                    })
                }
                Some(_) => agents.remove(agent_id),
            }
        };
        if let Some(conn) = conn {
            conn.close("deregistered").await;
            self.inner
                .recorder
                .agent_disconnected(agent_id, customer_id, "deregistered");
            info!(agent_id, customer_id, "Agent deregistered");
        }
        Ok(())
    }

    /// Remove `conn` if it is still the registered connection for its agent,
    /// then close it. Safe to call any number of times from any task.
    pub async fn evict(&self, conn: &Arc<AgentConnection>, reason: &str) -> bool {
        let removed = {
            let mut agents = self.inner.agents.write().await;
            match agents.get(conn.agent_id()) {
                Some(current) if Arc::ptr_eq(current, conn) => {
                    agents.remove(conn.agent_id());
                    true
                }
                _ => false,
            }
        };
        conn.close(reason).await;
        if removed {
            self.inner
                .recorder
                .agent_disconnected(conn.agent_id(), conn.customer_id(), reason);
            warn!(
                agent_id = %conn.agent_id(),
                customer_id = %conn.customer_id(),
                reason,
                "Evicted agent"
            );
        }
        removed
    }

    /// Send `request` to `agent_id` and wait for its response. Write failures
    /// and dropped connections evict the agent.
    pub async fn route_request(
        &self,
        agent_id: &str,
        request: &ProxyRequest,
        timeout: Duration,
    ) -> Result<ProxyResponse, RegistryError> {
        let conn = self
            .lookup(agent_id)
            .await
            .ok_or_else(|| RegistryError::NotFound(agent_id.to_string()))?;

        let started = Instant::now();
        match conn.request(request, timeout).await {
            Ok(response) => {
                self.inner
                    .recorder
                    .agent_request(agent_id, started.elapsed().as_secs_f64());
                Ok(response)
            }
            Err(e) => {
                let kind = match &e {
                    TunnelError::Disconnected(_) | TunnelError::Write { .. } => {
                        self.evict(&conn, "connection_error").await;
                        "connection"
                    }
                    TunnelError::Timeout(_) => "timeout",
                    TunnelError::Upstream(_) => "upstream",
                    TunnelError::Encode(_) => "encode",
                };
                self.inner.recorder.agent_error(agent_id, kind);
                Err(e.into())
            }
        }
    }

    /// One reaper pass; returns the ids evicted.
    pub async fn reap(&self) -> Vec<String> {
        let ceiling = self.inner.inactivity_timeout;
        let stale: Vec<Arc<AgentConnection>> = self
            .inner
            .agents
            .read()
            .await
            .values()
            .filter(|c| c.silence() > ceiling)
            .cloned()
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for conn in stale {
            if self.evict(&conn, "inactive").await {
                evicted.push(conn.agent_id().to_string());
            }
        }
        evicted
    }

    /// Stop background tasks and close every connection.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let drained: Vec<Arc<AgentConnection>> = self
            .inner
            .agents
            .write()
            .await
            .drain()
            .map(|(_, c)| c)
            .collect();
        for conn in &drained {
            conn.close("server shutting down").await;
            self.inner
                .recorder
                .agent_disconnected(conn.agent_id(), conn.customer_id(), "shutdown");
        }
        info!(count = drained.len(), "Closed all agent connections");
    }

    /// Span that background tasks of this registry run under.
    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    fn spawn_health_monitor(&self, conn: Arc<AgentConnection>) {
        let registry = self.clone();
        let period = self.inner.heartbeat_interval;
        let deadline = self.inner.heartbeat_deadline;
        let span = info_span!(
            parent: &self.inner.span,
            "health_monitor",
            agent_id = %conn.agent_id(),
            connection_id = %conn.connection_id(),
        );

        tokio::spawn(
            async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                let closed = conn.closed_token();
                loop {
                    tokio::select! {
                        () = registry.inner.shutdown.cancelled() => break,
                        () = closed.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    let silent = conn.silence();
                    if silent > deadline {
                        warn!(silent_secs = silent.as_secs(), "Heartbeat deadline exceeded");
                        registry.evict(&conn, "heartbeat_timeout").await;
                        break;
                    }
                    if let Err(e) = conn.probe().await {
                        warn!(error = %e, "Liveness probe failed");
                        registry.evict(&conn, "probe_failed").await;
                        break;
                    }
                }
            }
            .instrument(span),
        );
    }

    fn spawn_reaper(&self) {
        let registry = self.clone();
        let period = self.inner.reaper_interval;
        let span = info_span!(parent: &self.inner.span, "reaper");

        tokio::spawn(
            async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = registry.inner.shutdown.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let evicted = registry.reap().await;
                    if !evicted.is_empty() {
                        info!(count = evicted.len(), agents = ?evicted, "Reaped inactive agents");
                    }
                }
            }
            .instrument(span),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

    use crate::tunnel::connection::{ConnectionStatus, Frame};

    fn registry(settings: &AgentSettings) -> (AgentRegistry, Arc<MetricsRecorder>) {
        let recorder = Arc::new(MetricsRecorder::new().unwrap());
        let registry = AgentRegistry::new(
            settings,
            recorder.clone(),
            Span::none(),
            CancellationToken::new(),
        );
        (registry, recorder)
    }

    fn agent(id: &str, customer: &str) -> (Arc<AgentConnection>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(64);
        let conn = AgentConnection::new(id, customer, Box::new(tx), Duration::from_secs(5));
        (Arc::new(conn), rx)
    }

    #[tokio::test]
    async fn test_duplicate_registration_replaces_and_closes() {
        let (reg, recorder) = registry(&AgentSettings::default());
        let (first, mut first_rx) = agent("a1", "c1");
        let (second, _second_rx) = agent("a1", "c1");

        reg.register(first.clone()).await;
        reg.register(second.clone()).await;

        assert_eq!(reg.len().await, 1);
        let current = reg.lookup("a1").await.unwrap();
        assert!(Arc::ptr_eq(&current, &second));
        assert_eq!(first.status(), ConnectionStatus::Closing);
        assert_eq!(first_rx.recv().await, Some(Frame::Close));
        assert_eq!(recorder.active_connections(), 1);

        // The stale connection's own eviction must not remove its successor.
        assert!(!reg.evict(&first, "late").await);
        assert!(reg.lookup("a1").await.is_some());
    }

    #[tokio::test]
    async fn test_deregister_checks_owner() {
        let (reg, _) = registry(&AgentSettings::default());
        let (conn, _rx) = agent("a1", "c1");
        reg.register(conn.clone()).await;

        assert!(matches!(
            reg.deregister("a1", "c2").await,
            Err(RegistryError::Unauthorized { .. })
        ));
        assert!(matches!(
            reg.deregister("zz", "c1").await,
            Err(RegistryError::NotFound(_))
        ));
        reg.deregister("a1", "c1").await.unwrap();
        assert!(reg.is_empty().await);
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_evict_is_idempotent() {
        let (reg, recorder) = registry(&AgentSettings::default());
        let (conn, _rx) = agent("a1", "c1");
        reg.register(conn.clone()).await;

        assert!(reg.evict(&conn, "first").await);
        assert!(!reg.evict(&conn, "second").await);
        assert_eq!(recorder.active_connections(), 0);
        assert!(reg.active_agents().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_monitor_evicts_silent_agent() {
        let (reg, _) = registry(&AgentSettings::default());
        let (conn, mut rx) = agent("a1", "c1");
        reg.register(conn.clone()).await;

        // Probes go out while the agent is within 3 x 30s.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(rx.recv().await, Some(Frame::Ping(Vec::new())));
        assert!(reg.lookup("a1").await.is_some());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(reg.lookup("a1").await.is_none());
        assert!(!conn.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_keep_agent_registered() {
        let (reg, _) = registry(&AgentSettings::default());
        let (conn, _rx) = agent("a1", "c1");
        reg.register(conn.clone()).await;

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(25)).await;
            conn.touch();
        }
        assert!(reg.lookup("a1").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_evicts() {
        let (reg, _) = registry(&AgentSettings::default());
        let (conn, rx) = agent("a1", "c1");
        reg.register(conn.clone()).await;
        drop(rx);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(reg.lookup("a1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_uses_inactivity_ceiling() {
        let settings = AgentSettings {
            // Keep the health monitor out of the way.
            heartbeat_interval_secs: 3600,
            ..AgentSettings::default()
        };
        let (reg, _) = registry(&settings);
        let (conn, _rx) = agent("a1", "c1");
        reg.register(conn.clone()).await;

        tokio::time::sleep(Duration::from_secs(290)).await;
        assert!(reg.reap().await.is_empty());

        // Next reaper tick after the 300s ceiling is at 360s.
        tokio::time::sleep(Duration::from_secs(75)).await;
        assert!(reg.lookup("a1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_request_times_out_without_eviction() {
        let (reg, _) = registry(&AgentSettings::default());
        let (conn, _rx) = agent("a1", "c1");
        reg.register(conn).await;

        let req = ProxyRequest {
            method: "GET".into(),
            path: "/".into(),
            query: None,
            headers: BTreeMap::new(),
            body: Vec::new(),
        };
        let err = reg
            .route_request("a1", &req, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Tunnel(TunnelError::Timeout(_))));
        assert!(reg.lookup("a1").await.is_some());
        assert!(matches!(
            reg.route_request("nobody", &req, Duration::from_secs(5)).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (reg, recorder) = registry(&AgentSettings::default());
        for id in ["a1", "a2"] {
            let (conn, _rx) = agent(id, "c1");
            reg.register(conn).await;
        }
        reg.shutdown().await;
        assert!(reg.is_empty().await);
        assert!(reg.shutdown_token().is_cancelled());
        assert_eq!(recorder.active_connections(), 0);
    }
}
