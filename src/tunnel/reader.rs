//! The single reader task owned by each agent connection.

use std::sync::Arc;

use chrono::Utc;
use futures::{Stream, StreamExt};
use tracing::{debug, info_span, warn, Instrument};

use super::connection::{AgentConnection, Frame, SinkError};
use super::protocol::{Envelope, ErrorPayload, MessageType};
use super::registry::AgentRegistry;
use super::{AgentConfigSource, TunnelError};
use crate::metrics::MetricsRecorder;
use crate::models::{AgentMetrics, ProxyResponse};
use crate::store::Directory;

/// Collaborators the reader needs to act on inbound frames.
pub struct TunnelServices {
    pub directory: Arc<dyn Directory>,
    pub recorder: Arc<MetricsRecorder>,
    pub configs: AgentConfigSource,
}

/// Spawn the reader for `conn` under the registry's span.
pub fn spawn_reader<S>(
    conn: Arc<AgentConnection>,
    frames: S,
    registry: AgentRegistry,
    services: Arc<TunnelServices>,
) -> tokio::task::JoinHandle<()>
where
    S: Stream<Item = Result<Frame, SinkError>> + Send + Unpin + 'static,
{
    let span = info_span!(
        parent: registry.span(),
        "agent",
        agent_id = %conn.agent_id(),
        customer_id = %conn.customer_id(),
        connection_id = %conn.connection_id(),
    );
    tokio::spawn(run_reader(conn, frames, registry, services).instrument(span))
}

/// Consume every inbound frame until the stream ends, errors, or the
/// connection is closed elsewhere. Always finishes by evicting `conn`.
pub async fn run_reader<S>(
    conn: Arc<AgentConnection>,
    mut frames: S,
    registry: AgentRegistry,
    services: Arc<TunnelServices>,
) where
    S: Stream<Item = Result<Frame, SinkError>> + Send + Unpin,
{
    let closed = conn.closed_token();
    let reason = loop {
        let next = tokio::select! {
            frame = frames.next() => frame,
            () = closed.cancelled() => break "closed",
        };
        match next {
            Some(Ok(Frame::Text(text))) => {
                if let Err(e) = dispatch(&conn, &services, &text).await {
                    warn!(error = %e, "Write to agent failed");
                    break "write_error";
                }
            }
            Some(Ok(Frame::Binary(data))) => {
                debug!(len = data.len(), "Ignoring binary frame from agent");
            }
            Some(Ok(Frame::Ping(_) | Frame::Pong(_))) => {}
            Some(Ok(Frame::Close)) | None => break "disconnected",
            Some(Err(e)) => {
                warn!(error = %e, "Agent read error");
                break "read_error";
            }
        }
    };

    registry.evict(&conn, reason).await;
}

async fn dispatch(
    conn: &AgentConnection,
    services: &TunnelServices,
    text: &str,
) -> Result<(), TunnelError> {
    let envelope = match Envelope::decode(text) {
        Ok(env) => env,
        Err(e) => {
            warn!(error = %e, "Malformed frame from agent");
            return Ok(());
        }
    };

    match envelope.kind {
        MessageType::ProxyResponse => {
            let result = serde_json::from_value::<ProxyResponse>(envelope.payload)
                .map_err(|e| TunnelError::Upstream(format!("malformed proxy_response: {e}")));
            conn.resolve(&envelope.correlation_id, result);
        }
        MessageType::Error => {
            let payload: ErrorPayload =
                serde_json::from_value(envelope.payload).unwrap_or_default();
            services.recorder.agent_error(conn.agent_id(), "agent_error");
            let id = Some(envelope.correlation_id)
                .filter(|id| !id.is_empty())
                .or(payload.request_id);
            match id {
                Some(id) => {
                    conn.resolve(&id, Err(TunnelError::Upstream(payload.error)));
                }
                None => warn!(error = %payload.error, "Agent reported an error"),
            }
        }
        MessageType::Heartbeat => {
            conn.touch();
            services.recorder.agent_heartbeat(conn.agent_id());
            if let Err(e) = services
                .directory
                .touch_agent(conn.agent_id(), Utc::now())
                .await
            {
                warn!(error = %e, "Failed to record agent last_seen");
            }
            let config = services.configs.for_customer(conn.customer_id()).await;
            conn.send_envelope(&Envelope::config_update(&config)?).await?;
        }
        MessageType::MetricsUpdate => {
            match serde_json::from_value::<AgentMetrics>(envelope.payload) {
                Ok(metrics) => {
                    services.recorder.agent_gauges(conn.agent_id(), &metrics);
                    conn.set_metrics(metrics);
                }
                Err(e) => warn!(error = %e, "Malformed metrics_update from agent"),
            }
        }
        MessageType::ProxyRequest | MessageType::ConfigUpdate | MessageType::Unknown => {
            warn!(msg_type = ?envelope.kind, "Unexpected message type from agent");
        }
    }
    Ok(())
}
