//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span};

use crate::auth::{HandshakeVerifier, TokenService};
use crate::config::Config;
use crate::metrics::{MetricsRecorder, MetricsService};
use crate::proxy::ProxyService;
use crate::resilience::RequestValidator;
use crate::server::ServerError;
use crate::store::{self, Directory, InMemoryDirectory, TypedCache};
use crate::tunnel::{AgentConfigSource, AgentRegistry, RelayState, TunnelServices};

/// Shared application state for the broker.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    pub registry: AgentRegistry,
    pub tokens: Arc<TokenService>,
    pub validator: Arc<RequestValidator>,
    pub proxy: Arc<ProxyService>,
    pub metrics: MetricsService,
    /// State of the agent-facing endpoints.
    pub relay: RelayState,
}

impl AppState {
    /// Open the stores named in `config` and wire every component. Background
    /// tasks (reaper, health monitors, routing refresh) stop when `shutdown`
    /// is cancelled.
    pub fn build(config: Config, shutdown: &CancellationToken) -> Result<Self, ServerError> {
        let directory: Arc<dyn Directory> = Arc::new(InMemoryDirectory::open(
            &config.directory.uri,
            config.directory.seed_path.as_deref(),
        )?);
        let cache = TypedCache::new(store::open_cache(&config.cache.address)?);
        info!(
            directory = %config.directory.uri,
            cache = %config.cache.address,
            "Stores opened"
        );
        Self::with_stores(config, directory, cache, shutdown)
    }

    /// Wire every component over already-open stores.
    pub fn with_stores(
        config: Config,
        directory: Arc<dyn Directory>,
        cache: TypedCache,
        shutdown: &CancellationToken,
    ) -> Result<Self, ServerError> {
        cache.spawn_purge(
            Duration::from_secs(config.cache.purge_interval_secs.max(1)),
            shutdown.child_token(),
        );
        let recorder = Arc::new(MetricsRecorder::new()?);
        let metrics = MetricsService::new(directory.clone(), recorder.clone());

        let registry = AgentRegistry::new(
            &config.agent,
            recorder.clone(),
            info_span!("registry"),
            shutdown.child_token(),
        );
        let tokens = Arc::new(TokenService::new(
            &config.jwt,
            directory.clone(),
            cache.clone(),
            recorder.clone(),
        ));
        let validator = Arc::new(RequestValidator::new(&config.agent)?);
        validator.spawn_sweep(shutdown.child_token());
        let proxy = Arc::new(ProxyService::new(
            &config,
            registry.clone(),
            directory.clone(),
            cache.clone(),
            metrics.clone(),
            info_span!("proxy"),
        ));
        proxy.spawn_route_refresh(shutdown.child_token());

        let verifier = Arc::new(HandshakeVerifier::new(
            &config.agent,
            directory.clone(),
            cache.clone(),
        ));
        let services = Arc::new(TunnelServices {
            directory,
            recorder,
            configs: AgentConfigSource::new(&config.agent, cache),
        });
        let relay = RelayState::new(&config.agent, registry.clone(), verifier, services);

        Ok(Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            registry,
            tokens,
            validator,
            proxy,
            metrics,
            relay,
        })
    }
}
