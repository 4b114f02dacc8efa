//! One registered agent and its persistent connection.
//!
//! Writes go through the connection's own lock, one frame at a time. Reads
//! belong to the reader task alone (see `reader`), which resolves replies by
//! correlation id so heartbeat and metrics frames can arrive at any point
//! between a request and its response.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::pending::{PendingRequests, PendingResult};
use super::protocol::Envelope;
use super::TunnelError;
use crate::models::{AgentMetrics, ProxyRequest, ProxyResponse};

pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Transport-level frame, independent of the WebSocket library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Write half of an agent connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), SinkError>;
}

#[async_trait]
impl FrameSink for SplitSink<WebSocket, Message> {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), SinkError> {
        let msg = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data.into()),
            Frame::Ping(data) => Message::Ping(data.into()),
            Frame::Pong(data) => Message::Pong(data.into()),
            Frame::Close => Message::Close(None),
        };
        self.send(msg).await.map_err(Into::into)
    }
}

/// Channel-backed sink, used for in-process agents and tests.
#[async_trait]
impl FrameSink for mpsc::Sender<Frame> {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), SinkError> {
        self.send(frame).await.map_err(Into::into)
    }
}

/// Adapt the read half of an axum WebSocket into a frame stream.
pub fn socket_frames(
    stream: SplitStream<WebSocket>,
) -> impl Stream<Item = Result<Frame, SinkError>> + Send + Unpin {
    stream.map(|msg| {
        msg.map(|m| match m {
            Message::Text(text) => Frame::Text(text.as_str().to_owned()),
            Message::Binary(data) => Frame::Binary(data.to_vec()),
            Message::Ping(data) => Frame::Ping(data.to_vec()),
            Message::Pong(data) => Frame::Pong(data.to_vec()),
            Message::Close(_) => Frame::Close,
        })
        .map_err(Into::into)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Closing,
    Error,
}

pub struct AgentConnection {
    agent_id: String,
    customer_id: String,
    connection_id: String,
    sink: Mutex<Box<dyn FrameSink>>,
    status: StdMutex<ConnectionStatus>,
    pending: PendingRequests,
    connected_since: Instant,
    connected_at: DateTime<Utc>,
    /// Last liveness signal, in ms since `connected_since`.
    last_seen_ms: AtomicU64,
    latest_metrics: StdRwLock<Option<AgentMetrics>>,
    write_timeout: Duration,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConnection")
            .field("agent_id", &self.agent_id)
            .field("customer_id", &self.customer_id)
            .field("connection_id", &self.connection_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl AgentConnection {
    pub fn new(
        agent_id: impl Into<String>,
        customer_id: impl Into<String>,
        sink: Box<dyn FrameSink>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            customer_id: customer_id.into(),
            connection_id: uuid::Uuid::new_v4().to_string(),
            sink: Mutex::new(sink),
            status: StdMutex::new(ConnectionStatus::Connecting),
            pending: PendingRequests::new(),
            connected_since: Instant::now(),
            connected_at: Utc::now(),
            last_seen_ms: AtomicU64::new(0),
            latest_metrics: StdRwLock::new(None),
            write_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn customer_id(&self) -> &str {
        &self.customer_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn uptime(&self) -> Duration {
        self.connected_since.elapsed()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected && !self.shutdown.is_cancelled()
    }

    pub(crate) fn mark_connected(&self) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if *status == ConnectionStatus::Connecting {
            *status = ConnectionStatus::Connected;
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Cancelled once the connection is closed.
    pub fn closed_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Record a liveness signal.
    pub fn touch(&self) {
        let ms = u64::try_from(self.connected_since.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_seen_ms.store(ms, Ordering::Relaxed);
    }

    /// Time since the last liveness signal (or since connecting).
    pub fn silence(&self) -> Duration {
        let last = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.connected_since.elapsed().saturating_sub(last)
    }

    pub fn set_metrics(&self, metrics: AgentMetrics) {
        *self
            .latest_metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(metrics);
    }

    pub fn metrics(&self) -> Option<AgentMetrics> {
        self.latest_metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Write one frame. Lock acquisition and the write share one deadline.
    pub async fn send(&self, frame: Frame) -> Result<(), TunnelError> {
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::Disconnected(self.agent_id.clone()));
        }
        let write = async {
            let mut sink = self.sink.lock().await;
            sink.send_frame(frame).await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.write_failed(e.to_string())),
            Err(_) => Err(self.write_failed("write timed out".to_string())),
        }
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), TunnelError> {
        self.send(Frame::Text(envelope.encode()?)).await
    }

    /// Liveness probe: a WebSocket ping bounded by the write deadline.
    pub async fn probe(&self) -> Result<(), TunnelError> {
        self.send(Frame::Ping(Vec::new())).await
    }

    /// Forward one request and wait for the correlated response.
    ///
    /// A timeout releases the pending slot and leaves the connection open.
    pub async fn request(
        &self,
        request: &ProxyRequest,
        timeout: Duration,
    ) -> Result<ProxyResponse, TunnelError> {
        if !self.is_connected() {
            return Err(TunnelError::Disconnected(self.agent_id.clone()));
        }

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let frame = Envelope::proxy_request(&correlation_id, request)?.encode()?;
        let (rx, _slot) = self.pending.register(&correlation_id);

        let exchange = async {
            self.send(Frame::Text(frame)).await?;
            tokio::select! {
                result = rx => result.unwrap_or_else(|_| {
                    Err(TunnelError::Disconnected(self.agent_id.clone()))
                }),
                () = self.shutdown.cancelled() => {
                    Err(TunnelError::Disconnected(self.agent_id.clone()))
                }
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                debug!(
                    agent_id = %self.agent_id,
                    correlation_id = %correlation_id,
                    "Agent did not respond in time"
                );
                Err(TunnelError::Timeout(timeout))
            }
        }
    }

    pub(crate) fn resolve(&self, correlation_id: &str, result: PendingResult) -> bool {
        self.pending.resolve(correlation_id, result)
    }

    /// Close the connection and fail its pending calls. Returns `false` if it
    /// was already closed.
    pub async fn close(&self, reason: &str) -> bool {
        {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            if self.shutdown.is_cancelled() {
                return false;
            }
            if *status != ConnectionStatus::Error {
                *status = ConnectionStatus::Closing;
            }
            self.shutdown.cancel();
        }

        let agent_id = self.agent_id.clone();
        let failed = self
            .pending
            .fail_all(|| TunnelError::Disconnected(agent_id.clone()));

        let goodbye = async {
            let mut sink = self.sink.lock().await;
            let _ = sink.send_frame(Frame::Close).await;
        };
        let _ = tokio::time::timeout(self.write_timeout, goodbye).await;

        info!(
            agent_id = %self.agent_id,
            connection_id = %self.connection_id,
            reason,
            failed_pending = failed,
            "Closed agent connection"
        );
        true
    }

    fn write_failed(&self, reason: String) -> TunnelError {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if *status == ConnectionStatus::Connected || *status == ConnectionStatus::Connecting {
            *status = ConnectionStatus::Error;
        }
        TunnelError::Write {
            agent_id: self.agent_id.clone(),
            reason,
        }
    }
}
