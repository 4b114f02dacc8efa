//! Request admission: one decision composed from several checks.
//!
//! Checks run in a fixed order and stop at the first failure:
//!
//! 1. client IP against the allow-list
//! 2. declared `Content-Length` against the size ceiling
//! 3. token bucket keyed by the caller-declared `X-Agent-ID` (bounded table,
//!    swept by [`RequestValidator::spawn_sweep`])
//! 4. required headers present, `Content-Type` in the allowed set

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderMap, StatusCode};
use ipnet::IpNet;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use super::rate_limiter::RateLimiter;
use crate::config::AgentSettings;

pub const AGENT_ID_HEADER: &str = "x-agent-id";

/// Why a request was refused admission. Every variant has its own reason code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("IP {0} is not in the allow-list")]
    IpNotAllowed(String),
    #[error("request size {size} exceeds maximum allowed size {limit}")]
    PayloadTooLarge { size: u64, limit: u64 },
    #[error("rate limit exceeded for agent {0}")]
    RateLimited(String),
    #[error("missing required header: {0}")]
    MissingHeader(String),
    #[error("unsupported Content-Type: {0}")]
    UnsupportedContentType(String),
}

impl ValidationError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::IpNotAllowed(_) => "IP_NOT_ALLOWED",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::RateLimited(_) => "RATE_LIMIT_EXCEEDED",
            Self::MissingHeader(_) => "MISSING_HEADER",
            Self::UnsupportedContentType(_) => "UNSUPPORTED_CONTENT_TYPE",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::IpNotAllowed(_) => StatusCode::FORBIDDEN,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::MissingHeader(_) => StatusCode::BAD_REQUEST,
            Self::UnsupportedContentType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        }
    }
}

#[derive(Debug, Error)]
#[error("invalid IP allow-list entry {0:?}")]
pub struct InvalidAllowListEntry(pub String);

/// Source-IP allow-list: exact addresses, CIDR ranges, or `*`.
/// An empty list admits everyone.
#[derive(Debug, Clone, Default)]
pub struct IpAllowList {
    allow_all: bool,
    exact: HashSet<IpAddr>,
    ranges: Vec<IpNet>,
}

impl IpAllowList {
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, InvalidAllowListEntry> {
        let mut list = Self {
            allow_all: entries.is_empty(),
            ..Self::default()
        };
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry == "*" {
                list.allow_all = true;
            } else if entry.contains('/') {
                let net = entry
                    .parse::<IpNet>()
                    .map_err(|_| InvalidAllowListEntry(entry.to_string()))?;
                list.ranges.push(net);
            } else {
                let ip = entry
                    .parse::<IpAddr>()
                    .map_err(|_| InvalidAllowListEntry(entry.to_string()))?;
                list.exact.insert(ip);
            }
        }
        Ok(list)
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        self.allow_all || self.exact.contains(&ip) || self.ranges.iter().any(|n| n.contains(&ip))
    }
}

/// Client address as seen through proxies: `X-Real-IP`, then the first
/// `X-Forwarded-For` hop, then the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> Option<IpAddr> {
    let header_ip = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    };
    header_ip("x-real-ip")
        .or_else(|| header_ip("x-forwarded-for"))
        .or(peer)
}

/// Admission gate for proxied traffic.
pub struct RequestValidator {
    allow_list: IpAllowList,
    max_request_size: u64,
    limiter: RateLimiter,
    required_headers: Vec<String>,
    allowed_content_types: Vec<String>,
}

impl RequestValidator {
    pub fn new(settings: &AgentSettings) -> Result<Self, InvalidAllowListEntry> {
        let security = &settings.security;
        Ok(Self {
            allow_list: IpAllowList::parse(&security.allowed_ips)?,
            max_request_size: settings.max_request_size,
            limiter: RateLimiter::with_max_tracked(
                security.rate_limit.requests,
                Duration::from_secs(security.rate_limit.time_window_secs),
                security.rate_limit.max_tracked,
            ),
            required_headers: security.required_headers.clone(),
            allowed_content_types: security
                .allowed_content_types
                .iter()
                .map(|ct| ct.to_ascii_lowercase())
                .collect(),
        })
    }

    /// Sweep refilled rate-limit buckets once per rate window until
    /// `shutdown` fires.
    pub fn spawn_sweep(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let validator = Arc::clone(self);
        let period = self.limiter.window().max(Duration::from_secs(1));
        tokio::spawn(
            async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let swept = validator.limiter.sweep_idle();
                    if swept > 0 {
                        debug!(swept, tracked = validator.limiter.tracked(), "Swept idle rate limit buckets");
                    }
                }
            }
            .instrument(info_span!("rate_limit_sweep")),
        )
    }

    /// Run every check in order, returning the first failure.
    pub fn validate(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> Result<(), ValidationError> {
        self.check_ip(headers, peer)?;
        self.check_size(headers)?;
        self.check_rate(headers)?;
        self.check_headers(headers)
    }

    fn check_ip(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> Result<(), ValidationError> {
        match client_ip(headers, peer) {
            Some(ip) if self.allow_list.allows(ip) => Ok(()),
            Some(ip) => Err(ValidationError::IpNotAllowed(ip.to_string())),
            None if self.allow_list.allow_all => Ok(()),
            None => Err(ValidationError::IpNotAllowed("unknown".to_string())),
        }
    }

    fn check_size(&self, headers: &HeaderMap) -> Result<(), ValidationError> {
        let size = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0);
        if size > self.max_request_size {
            return Err(ValidationError::PayloadTooLarge {
                size,
                limit: self.max_request_size,
            });
        }
        Ok(())
    }

    fn check_rate(&self, headers: &HeaderMap) -> Result<(), ValidationError> {
        let agent_id = header_value(headers, AGENT_ID_HEADER)
            .ok_or_else(|| ValidationError::MissingHeader("X-Agent-ID".to_string()))?;
        if self.limiter.allow(agent_id) {
            Ok(())
        } else {
            Err(ValidationError::RateLimited(agent_id.to_string()))
        }
    }

    fn check_headers(&self, headers: &HeaderMap) -> Result<(), ValidationError> {
        if let Some(missing) = self
            .required_headers
            .iter()
            .find(|name| header_value(headers, name).is_none())
        {
            return Err(ValidationError::MissingHeader(missing.clone()));
        }

        let Some(content_type) = header_value(headers, header::CONTENT_TYPE.as_str()) else {
            return Ok(());
        };
        // Compare the media type only; parameters such as charset are ignored.
        let media_type = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if self.allowed_content_types.iter().any(|ct| *ct == media_type) {
            Ok(())
        } else {
            Err(ValidationError::UnsupportedContentType(content_type.to_string()))
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
