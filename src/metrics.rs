//! Metrics signals and the per-call metrics service.
//!
//! [`MetricsRecorder`] owns a Prometheus [`Registry`] with one labelled vector
//! per signal. Each recorder has its own registry so several brokers (or
//! tests) can live in one process. [`MetricsRecorder::encode`] renders the
//! text exposition served at `GET /metrics`.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use prometheus::core::Collector;
use prometheus::proto::{Metric, MetricFamily};
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use tracing::{debug, warn};

use crate::models::{AgentMetrics, CurrentMetrics, MetricRecord, MetricsResponse, TimeRange};
use crate::store::{Directory, StoreError, METRIC_WINDOW_SECS};

pub const PROXY_REQUESTS_TOTAL: &str = "proxy_requests_total";
pub const PROXY_REQUEST_DURATION_SECONDS: &str = "proxy_request_duration_seconds";
pub const PROXY_ERRORS_TOTAL: &str = "proxy_errors_total";
pub const PROXY_VALIDATION_FAILURES_TOTAL: &str = "proxy_validation_failures_total";
pub const PROXY_CIRCUIT_OPEN_TOTAL: &str = "proxy_circuit_open_total";
pub const AUTH_FAILURES_TOTAL: &str = "proxy_auth_failures_total";
pub const AUTH_SUCCESSES_TOTAL: &str = "proxy_auth_successes_total";
pub const AUTH_DURATION_SECONDS: &str = "proxy_auth_duration_seconds";
pub const AGENT_CONNECTIONS: &str = "agent_connections";
pub const AGENT_CONNECTIONS_TOTAL: &str = "agent_connections_total";
pub const AGENT_DISCONNECTIONS_TOTAL: &str = "agent_disconnections_total";
pub const AGENT_REQUESTS_TOTAL: &str = "agent_requests_total";
pub const AGENT_ERRORS_TOTAL: &str = "agent_errors_total";
pub const AGENT_LATENCY_SECONDS: &str = "agent_latency_seconds";
pub const AGENT_HEARTBEATS_TOTAL: &str = "agent_heartbeats_total";
pub const AGENT_UPTIME_SECONDS: &str = "agent_uptime_seconds";
pub const AGENT_MEMORY_USAGE: &str = "agent_memory_usage";
pub const AGENT_CPU_USAGE: &str = "agent_cpu_usage";

fn register<C: Collector + Clone + 'static>(registry: &Registry, c: C) -> prometheus::Result<C> {
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn counter_vec(r: &Registry, name: &str, help: &str, labels: &[&str]) -> prometheus::Result<IntCounterVec> {
    register(r, IntCounterVec::new(Opts::new(name, help), labels)?)
}

fn gauge_vec(r: &Registry, name: &str, help: &str, labels: &[&str]) -> prometheus::Result<GaugeVec> {
    register(r, GaugeVec::new(Opts::new(name, help), labels)?)
}

fn histogram_vec(r: &Registry, name: &str, help: &str, labels: &[&str]) -> prometheus::Result<HistogramVec> {
    register(r, HistogramVec::new(HistogramOpts::new(name, help), labels)?)
}

fn label<'a>(m: &'a Metric, name: &str) -> Option<&'a str> {
    m.get_label()
        .iter()
        .find(|l| l.get_name() == name)
        .map(|l| l.get_value())
}

fn has_labels(m: &Metric, labels: &[(&str, &str)]) -> bool {
    labels.iter().all(|(k, v)| label(m, k) == Some(*v))
}

fn series<'a>(families: &'a [MetricFamily], name: &'a str) -> impl Iterator<Item = &'a Metric> {
    families
        .iter()
        .filter(move |f| f.get_name() == name)
        .flat_map(|f| f.get_metric().iter())
}

/// Prometheus-backed signal sink.
pub struct MetricsRecorder {
    registry: Registry,
    proxy_requests: IntCounterVec,
    proxy_duration: HistogramVec,
    proxy_errors: IntCounterVec,
    validation_failures: IntCounterVec,
    circuit_open: IntCounterVec,
    auth_failures: IntCounterVec,
    auth_successes: IntCounterVec,
    auth_duration: Histogram,
    agent_connections: IntGauge,
    agent_connections_total: IntCounterVec,
    agent_disconnections: IntCounterVec,
    agent_requests: IntCounterVec,
    agent_errors: IntCounterVec,
    agent_latency: HistogramVec,
    agent_heartbeats: IntCounterVec,
    agent_uptime: GaugeVec,
    agent_memory: GaugeVec,
    agent_cpu: GaugeVec,
}

impl MetricsRecorder {
    pub fn new() -> prometheus::Result<Self> {
        let r = Registry::new();
        Ok(Self {
            proxy_requests: counter_vec(
                &r,
                PROXY_REQUESTS_TOTAL,
                "Total number of HTTP requests processed",
                &["customer_id", "path", "method", "status"],
            )?,
            proxy_duration: histogram_vec(
                &r,
                PROXY_REQUEST_DURATION_SECONDS,
                "HTTP request duration in seconds",
                &["customer_id", "path", "method"],
            )?,
            proxy_errors: counter_vec(
                &r,
                PROXY_ERRORS_TOTAL,
                "Total number of errors encountered",
                &["customer_id", "error_type"],
            )?,
            validation_failures: counter_vec(
                &r,
                PROXY_VALIDATION_FAILURES_TOTAL,
                "Requests rejected before reaching an agent",
                &["reason"],
            )?,
            circuit_open: counter_vec(
                &r,
                PROXY_CIRCUIT_OPEN_TOTAL,
                "Calls short-circuited by an open breaker",
                &["customer_id"],
            )?,
            auth_failures: counter_vec(
                &r,
                AUTH_FAILURES_TOTAL,
                "Total number of authentication failures",
                &["reason"],
            )?,
            auth_successes: counter_vec(
                &r,
                AUTH_SUCCESSES_TOTAL,
                "Total number of successful authentications",
                &["customer_id"],
            )?,
            auth_duration: register(
                &r,
                Histogram::with_opts(HistogramOpts::new(
                    AUTH_DURATION_SECONDS,
                    "Time spent on authentication",
                ))?,
            )?,
            agent_connections: register(
                &r,
                IntGauge::new(AGENT_CONNECTIONS, "Number of active agent connections")?,
            )?,
            agent_connections_total: counter_vec(
                &r,
                AGENT_CONNECTIONS_TOTAL,
                "Total number of agent registrations",
                &["agent_id", "customer_id"],
            )?,
            agent_disconnections: counter_vec(
                &r,
                AGENT_DISCONNECTIONS_TOTAL,
                "Total number of agent disconnections",
                &["agent_id", "customer_id", "reason"],
            )?,
            agent_requests: counter_vec(
                &r,
                AGENT_REQUESTS_TOTAL,
                "Total number of requests processed by agents",
                &["agent_id"],
            )?,
            agent_errors: counter_vec(
                &r,
                AGENT_ERRORS_TOTAL,
                "Total number of agent errors",
                &["agent_id", "error_type"],
            )?,
            agent_latency: histogram_vec(
                &r,
                AGENT_LATENCY_SECONDS,
                "Agent request latency in seconds",
                &["agent_id"],
            )?,
            agent_heartbeats: counter_vec(
                &r,
                AGENT_HEARTBEATS_TOTAL,
                "Heartbeats received from agents",
                &["agent_id"],
            )?,
            agent_uptime: gauge_vec(&r, AGENT_UPTIME_SECONDS, "Agent uptime in seconds", &["agent_id"])?,
            agent_memory: gauge_vec(&r, AGENT_MEMORY_USAGE, "Agent memory usage", &["agent_id"])?,
            agent_cpu: gauge_vec(&r, AGENT_CPU_USAGE, "Agent CPU usage", &["agent_id"])?,
            registry: r,
        })
    }

    /// Text exposition of every registered signal.
    pub fn encode(&self) -> prometheus::Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        Ok((encoder.format_type().to_string(), buf))
    }

    /// Sum of every counter series of `name` carrying `labels`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        series(&self.registry.gather(), name)
            .filter(|m| has_labels(m, labels))
            .map(|m| m.get_counter().get_value() as u64)
            .sum()
    }

    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        series(&self.registry.gather(), name)
            .find(|m| has_labels(m, labels))
            .map(|m| m.get_gauge().get_value())
    }

    // ─── Agent signals ──────────────────────────────────────────────────

    pub fn agent_connected(&self, agent_id: &str, customer_id: &str) {
        self.agent_connections_total
            .with_label_values(&[agent_id, customer_id])
            .inc();
        self.agent_connections.inc();
        debug!(target: "relay::metrics", agent_id, customer_id, "agent connected");
    }

    pub fn agent_disconnected(&self, agent_id: &str, customer_id: &str, reason: &str) {
        self.agent_disconnections
            .with_label_values(&[agent_id, customer_id, reason])
            .inc();
        if self.agent_connections.get() > 0 {
            self.agent_connections.dec();
        }
        debug!(target: "relay::metrics", agent_id, customer_id, reason, "agent disconnected");
    }

    pub fn agent_heartbeat(&self, agent_id: &str) {
        self.agent_heartbeats.with_label_values(&[agent_id]).inc();
    }

    pub fn agent_request(&self, agent_id: &str, latency_secs: f64) {
        self.agent_requests.with_label_values(&[agent_id]).inc();
        self.agent_latency
            .with_label_values(&[agent_id])
            .observe(latency_secs);
    }

    pub fn agent_error(&self, agent_id: &str, kind: &str) {
        self.agent_errors.with_label_values(&[agent_id, kind]).inc();
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn agent_gauges(&self, agent_id: &str, m: &AgentMetrics) {
        self.agent_uptime
            .with_label_values(&[agent_id])
            .set(m.uptime_secs as f64);
        self.agent_memory
            .with_label_values(&[agent_id])
            .set(m.memory_usage);
        self.agent_cpu.with_label_values(&[agent_id]).set(m.cpu_usage);
    }

    #[allow(clippy::cast_sign_loss)]
    pub fn active_connections(&self) -> u64 {
        self.agent_connections.get().max(0) as u64
    }

    // ─── Proxy / auth signals ───────────────────────────────────────────

    pub fn proxy_request(
        &self,
        customer_id: &str,
        path: &str,
        method: &str,
        status: u16,
        latency_secs: f64,
    ) {
        let status = status.to_string();
        self.proxy_requests
            .with_label_values(&[customer_id, path, method, &status])
            .inc();
        self.proxy_duration
            .with_label_values(&[customer_id, path, method])
            .observe(latency_secs);
    }

    pub fn proxy_error(&self, customer_id: &str, code: &str) {
        self.proxy_errors
            .with_label_values(&[customer_id, code])
            .inc();
    }

    pub fn validation_failure(&self, reason_code: &str) {
        self.validation_failures
            .with_label_values(&[reason_code])
            .inc();
    }

    pub fn circuit_open(&self, customer_id: &str) {
        self.circuit_open.with_label_values(&[customer_id]).inc();
    }

    pub fn auth_success(&self, customer_id: &str, duration_secs: f64) {
        self.auth_successes.with_label_values(&[customer_id]).inc();
        self.auth_duration.observe(duration_secs);
    }

    pub fn auth_failure(&self, reason: &str, duration_secs: f64) {
        self.auth_failures.with_label_values(&[reason]).inc();
        self.auth_duration.observe(duration_secs);
    }

    /// Live per-customer totals folded from the request counter and
    /// duration histogram.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn current(&self, customer_id: &str) -> CurrentMetrics {
        let families = self.registry.gather();
        let customer = [("customer_id", customer_id)];

        let mut requests = 0u64;
        let mut errors = 0u64;
        for m in series(&families, PROXY_REQUESTS_TOTAL).filter(|m| has_labels(m, &customer)) {
            let n = m.get_counter().get_value() as u64;
            requests += n;
            if label(m, "status")
                .and_then(|s| s.parse::<u16>().ok())
                .is_some_and(|s| s >= 400)
            {
                errors += n;
            }
        }

        let (mut observed, mut latency_sum) = (0u64, 0.0);
        for m in series(&families, PROXY_REQUEST_DURATION_SECONDS).filter(|m| has_labels(m, &customer)) {
            observed += m.get_histogram().get_sample_count();
            latency_sum += m.get_histogram().get_sample_sum();
        }

        let mut current = CurrentMetrics {
            active_connections: self.active_connections(),
            request_count: requests,
            ..CurrentMetrics::default()
        };
        if requests > 0 {
            current.error_rate = errors as f64 / requests as f64;
        }
        if observed > 0 {
            current.average_latency = latency_sum * 1000.0 / observed as f64;
        }
        current
    }
}

/// Appends per-call records to the directory and answers metrics queries.
#[derive(Clone)]
pub struct MetricsService {
    directory: Arc<dyn Directory>,
    recorder: Arc<MetricsRecorder>,
}

impl MetricsService {
    pub fn new(directory: Arc<dyn Directory>, recorder: Arc<MetricsRecorder>) -> Self {
        Self {
            directory,
            recorder,
        }
    }

    pub fn recorder(&self) -> &Arc<MetricsRecorder> {
        &self.recorder
    }

    /// Record one completed call. A store failure is logged, not propagated.
    pub async fn record_call(&self, record: MetricRecord) {
        self.recorder.proxy_request(
            &record.customer_id,
            &record.path,
            &record.method,
            record.status_code,
            record.latency_ms / 1000.0,
        );
        if let Err(e) = self.directory.record_metric(record).await {
            warn!(error = %e, "Failed to persist metric record");
        }
    }

    /// Last hour's aggregation plus current gauges.
    pub async fn get_metrics(&self, customer_id: &str) -> Result<MetricsResponse, StoreError> {
        let end = Utc::now();
        let start = end - ChronoDuration::seconds(METRIC_WINDOW_SECS);
        let aggregated = self.directory.aggregate_metrics(customer_id, start).await?;
        Ok(MetricsResponse {
            customer_id: customer_id.to_string(),
            time_range: TimeRange { start, end },
            aggregated,
            current: self.recorder.current(customer_id),
        })
    }
}
