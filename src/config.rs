//! Configuration loading, defaults and startup validation.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `RELAY_PORT`, `RELAY_JWT_SECRET`,
//!    `RELAY_DIRECTORY_URI`, `RELAY_CACHE_ADDRESS`, `RELAY_EDGE_TUNNEL_TOKEN`
//! 2. **Config file**: path via `--config <path>`, or `relay.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8443
//! tls_cert_file = "/etc/relay/cert.pem"
//! tls_key_file = "/etc/relay/key.pem"
//!
//! [directory]
//! uri = "memory://"
//! database = "relay"
//! seed_path = "/etc/relay/seed.toml"
//!
//! [cache]
//! address = "memory://"
//!
//! [jwt]
//! secret = "change-me"
//! expiration_hours = 24
//!
//! [agent]
//! heartbeat_interval_secs = 30
//! max_request_timeout_secs = 30
//!
//! [agent.security.rate_limit]
//! requests = 100
//! time_window_secs = 60
//!
//! [edge]
//! tunnel_id = "edge-1"
//! tunnel_token = "secret"
//!
//! [logging]
//! level = "info"
//! ```
//!
//! [`Config::validate`] runs once at startup and reports every missing
//! required field at once.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid environment override {name}: {value}")]
    Env { name: &'static str, value: String },
    #[error("missing or invalid required settings: {}", .0.join(", "))]
    Invalid(Vec<String>),
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub jwt: JwtConfig,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub edge: EdgeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener, TLS and connection-level settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host (default `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port. Required, `0` is rejected by validation.
    #[serde(default)]
    pub port: u16,
    /// PEM certificate chain.
    #[serde(default)]
    pub tls_cert_file: String,
    /// PEM PKCS#8 private key.
    #[serde(default)]
    pub tls_key_file: String,
    /// Deadline for the TLS handshake and for reading a request body
    /// (default 30).
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Upper bound for producing a response (default 60).
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    /// Maximum concurrently served HTTP requests (default 1024).
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

/// Directory store (customers, agents, proxy configs, metric records).
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    /// Store URI. Only `memory://` is served in-process.
    #[serde(default)]
    pub uri: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_directory_timeout")]
    pub timeout_secs: u64,
    /// Optional TOML seed file loaded into the in-memory directory.
    pub seed_path: Option<String>,
}

/// Key/value cache in front of the directory.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Cache address. Only `memory://` is served in-process.
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_min_idle_conns")]
    pub min_idle_conns: u32,
    /// How often expired in-process entries are dropped (default 60).
    #[serde(default = "default_cache_purge_interval")]
    pub purge_interval_secs: u64,
}

/// Caller token signing.
#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    /// HMAC signing secret. Required.
    #[serde(default)]
    pub secret: String,
    /// Token lifetime in hours (default 24).
    #[serde(default = "default_expiration_hours")]
    pub expiration_hours: u64,
    #[serde(default = "default_issuer")]
    pub issuer: String,
}

/// Agent connection lifecycle and admission limits.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    /// Liveness probe period (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Agents silent for `interval * miss_limit` are evicted (default 3).
    #[serde(default = "default_heartbeat_miss_limit")]
    pub heartbeat_miss_limit: u32,
    /// Deadline for one probe write (default 10).
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Reaper scan period (default 60).
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
    /// Reaper inactivity ceiling (default 300).
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,
    /// Ceiling for any forwarded call (default 30).
    #[serde(default = "default_max_request_timeout")]
    pub max_request_timeout_secs: u64,
    /// Age limit of a handshake credential timestamp (default 86400).
    #[serde(default = "default_handshake_validity")]
    pub handshake_validity_secs: u64,
    /// How long a verified handshake is remembered (default 900).
    #[serde(default = "default_handshake_cache")]
    pub handshake_cache_secs: u64,
    /// `Origin` values accepted on the agent upgrade. Empty accepts any.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Largest accepted request body in bytes (default 10 MiB).
    #[serde(default = "default_max_request_size")]
    pub max_request_size: u64,
    #[serde(default)]
    pub security: SecuritySettings,
}

/// Request validator settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SecuritySettings {
    /// Allowed client IPs: exact addresses, CIDR ranges or `*` (default `["*"]`).
    #[serde(default = "default_allowed_ips")]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default = "default_required_headers")]
    pub required_headers: Vec<String>,
    #[serde(default = "default_allowed_content_types")]
    pub allowed_content_types: Vec<String>,
}

/// Token bucket sizing: `requests` per `time_window_secs`.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_requests")]
    pub requests: u32,
    #[serde(default = "default_rate_limit_window")]
    pub time_window_secs: u64,
    /// Identities tracked at once; further first-seen identities are refused.
    #[serde(default = "default_rate_limit_max_tracked")]
    pub max_tracked: usize,
}

/// Circuit breaker thresholds, one breaker per customer.
#[derive(Debug, Clone, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_timeout")]
    pub open_timeout_secs: u64,
}

/// Proxy orchestrator settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySettings {
    /// Routing table rebuild period (default 60).
    #[serde(default = "default_routing_refresh")]
    pub routing_refresh_secs: u64,
    /// Per-call timeout when a customer has no proxy config (default 30).
    #[serde(default = "default_max_request_timeout")]
    pub default_timeout_secs: u64,
}

/// Outbound edge tunnel identity. The edge client itself runs out of process.
#[derive(Debug, Clone, Deserialize)]
pub struct EdgeConfig {
    #[serde(default)]
    pub tunnel_id: String,
    #[serde(default)]
    pub tunnel_token: String,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_edge_retry_interval")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_edge_connection_timeout")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_edge_connection_timeout")]
    pub handshake_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of the human format.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_read_timeout() -> u64 {
    30
}
fn default_write_timeout() -> u64 {
    60
}
fn default_max_concurrent_requests() -> usize {
    1024
}
fn default_database() -> String {
    "relay".to_string()
}
fn default_pool_size() -> u32 {
    10
}
fn default_directory_timeout() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_min_idle_conns() -> u32 {
    2
}
fn default_expiration_hours() -> u64 {
    24
}
fn default_issuer() -> String {
    "agent-relay".to_string()
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_heartbeat_miss_limit() -> u32 {
    3
}
fn default_probe_timeout() -> u64 {
    10
}
fn default_reaper_interval() -> u64 {
    60
}
fn default_inactivity_timeout() -> u64 {
    300
}
fn default_max_request_timeout() -> u64 {
    30
}
fn default_handshake_validity() -> u64 {
    24 * 60 * 60
}
fn default_handshake_cache() -> u64 {
    15 * 60
}
fn default_cache_purge_interval() -> u64 {
    60
}
fn default_max_request_size() -> u64 {
    10 * 1024 * 1024 // 10 MiB
}
fn default_allowed_ips() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_required_headers() -> Vec<String> {
    ["X-Agent-ID", "X-Customer-ID", "X-Agent-Token", "Content-Type"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_allowed_content_types() -> Vec<String> {
    [
        "application/json",
        "application/x-www-form-urlencoded",
        "multipart/form-data",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_rate_limit_requests() -> u32 {
    100
}
fn default_rate_limit_window() -> u64 {
    60
}
fn default_rate_limit_max_tracked() -> usize {
    crate::resilience::rate_limiter::DEFAULT_MAX_TRACKED
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_open_timeout() -> u64 {
    30
}
fn default_routing_refresh() -> u64 {
    60
}
fn default_edge_retry_interval() -> u64 {
    5
}
fn default_edge_connection_timeout() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            tls_cert_file: String::new(),
            tls_key_file: String::new(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            database: default_database(),
            pool_size: default_pool_size(),
            timeout_secs: default_directory_timeout(),
            seed_path: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            password: String::new(),
            db: 0,
            max_retries: default_max_retries(),
            pool_size: default_pool_size(),
            min_idle_conns: default_min_idle_conns(),
            purge_interval_secs: default_cache_purge_interval(),
        }
    }
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            expiration_hours: default_expiration_hours(),
            issuer: default_issuer(),
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_miss_limit: default_heartbeat_miss_limit(),
            probe_timeout_secs: default_probe_timeout(),
            reaper_interval_secs: default_reaper_interval(),
            inactivity_timeout_secs: default_inactivity_timeout(),
            max_request_timeout_secs: default_max_request_timeout(),
            handshake_validity_secs: default_handshake_validity(),
            handshake_cache_secs: default_handshake_cache(),
            allowed_origins: Vec::new(),
            max_request_size: default_max_request_size(),
            security: SecuritySettings::default(),
        }
    }
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            allowed_ips: default_allowed_ips(),
            rate_limit: RateLimitConfig::default(),
            required_headers: default_required_headers(),
            allowed_content_types: default_allowed_content_types(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: default_rate_limit_requests(),
            time_window_secs: default_rate_limit_window(),
            max_tracked: default_rate_limit_max_tracked(),
        }
    }
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_secs: default_open_timeout(),
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            routing_refresh_secs: default_routing_refresh(),
            default_timeout_secs: default_max_request_timeout(),
        }
    }
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            tunnel_id: String::new(),
            tunnel_token: String::new(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            retry_interval_secs: default_edge_retry_interval(),
            max_retries: default_max_retries(),
            connection_timeout_secs: default_edge_connection_timeout(),
            handshake_timeout_secs: default_edge_connection_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AgentSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Silence longer than this evicts an agent from its health monitor.
    pub fn heartbeat_deadline(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeat_miss_limit.max(1)
    }

    pub fn max_request_timeout(&self) -> Duration {
        Duration::from_secs(self.max_request_timeout_secs)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for `relay.toml`
    /// in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("relay.toml").exists() => Self::from_file("relay.toml")?,
            None => Config::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply env var overrides. `lookup` is injected so tests don't touch the
    /// process environment.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(port) = lookup("RELAY_PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::Env {
                name: "RELAY_PORT",
                value: port,
            })?;
        }
        if let Some(secret) = lookup("RELAY_JWT_SECRET") {
            self.jwt.secret = secret;
        }
        if let Some(uri) = lookup("RELAY_DIRECTORY_URI") {
            self.directory.uri = uri;
        }
        if let Some(addr) = lookup("RELAY_CACHE_ADDRESS") {
            self.cache.address = addr;
        }
        if let Some(token) = lookup("RELAY_EDGE_TUNNEL_TOKEN") {
            self.edge.tunnel_token = token;
        }
        Ok(())
    }

    /// Fail fast on empty required fields, listing every offender.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        let mut require = |ok: bool, name: &str| {
            if !ok {
                missing.push(name.to_string());
            }
        };

        require(self.server.port != 0, "server.port");
        require(!self.server.tls_cert_file.is_empty(), "server.tls_cert_file");
        require(!self.server.tls_key_file.is_empty(), "server.tls_key_file");
        require(!self.directory.uri.is_empty(), "directory.uri");
        require(!self.directory.database.is_empty(), "directory.database");
        require(!self.cache.address.is_empty(), "cache.address");
        require(!self.jwt.secret.is_empty(), "jwt.secret");
        require(self.jwt.expiration_hours > 0, "jwt.expiration_hours");
        require(!self.edge.tunnel_id.is_empty(), "edge.tunnel_id");
        require(!self.edge.tunnel_token.is_empty(), "edge.tunnel_token");
        require(
            self.agent.heartbeat_interval_secs > 0,
            "agent.heartbeat_interval_secs",
        );
        require(
            self.agent.security.rate_limit.time_window_secs > 0,
            "agent.security.rate_limit.time_window_secs",
        );

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(missing))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPLETE: &str = r#"
        [server]
        port = 8443
        tls_cert_file = "cert.pem"
        tls_key_file = "key.pem"

        [directory]
        uri = "memory://"

        [cache]
        address = "memory://"

        [jwt]
        secret = "s3cret"

        [edge]
        tunnel_id = "edge-1"
        tunnel_token = "tok"
    "#;

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_toml(COMPLETE).unwrap();
        assert_eq!(config.agent.heartbeat_interval_secs, 30);
        assert_eq!(config.agent.heartbeat_miss_limit, 3);
        assert_eq!(config.agent.inactivity_timeout_secs, 300);
        assert_eq!(config.resilience.failure_threshold, 5);
        assert_eq!(config.agent.security.allowed_ips, vec!["*"]);
        assert_eq!(config.agent.security.required_headers.len(), 4);
        assert_eq!(config.agent.heartbeat_deadline(), Duration::from_secs(90));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_lists_every_missing_field() {
        let err = Config::default().validate().unwrap_err();
        let ConfigError::Invalid(missing) = err else {
            panic!("expected Invalid");
        };
        for field in [
            "server.port",
            "server.tls_cert_file",
            "server.tls_key_file",
            "directory.uri",
            "cache.address",
            "jwt.secret",
            "edge.tunnel_id",
            "edge.tunnel_token",
        ] {
            assert!(missing.iter().any(|m| m == field), "{field} not reported");
        }
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::from_toml(COMPLETE).unwrap();
        config
            .apply_env(|name| match name {
                "RELAY_PORT" => Some("9000".to_string()),
                "RELAY_JWT_SECRET" => Some("from-env".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.jwt.secret, "from-env");
        assert_eq!(config.edge.tunnel_token, "tok");
    }

    #[test]
    fn test_env_bad_port() {
        let mut config = Config::default();
        let err = config
            .apply_env(|name| (name == "RELAY_PORT").then(|| "nope".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { name: "RELAY_PORT", .. }));
    }

    #[test]
    fn test_nested_security_section() {
        let toml = format!(
            "{COMPLETE}\n[agent.security]\nallowed_ips = [\"10.0.0.0/8\"]\n[agent.security.rate_limit]\nrequests = 5\ntime_window_secs = 10\n"
        );
        let config = Config::from_toml(&toml).unwrap();
        assert_eq!(config.agent.security.allowed_ips, vec!["10.0.0.0/8"]);
        assert_eq!(config.agent.security.rate_limit.requests, 5);
        assert_eq!(config.agent.security.rate_limit.time_window_secs, 10);
    }
}
