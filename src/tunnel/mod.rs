//! Agent tunnels: persistent WebSocket connections dialled in by agents.
//!
//! - `protocol`: JSON envelope carried in every text frame
//! - `pending`: correlation table for in-flight proxied calls
//! - `connection`: one agent's connection, write lock and liveness
//! - `reader`: the single reader task per connection
//! - `registry`: membership, health monitors and the reaper
//! - `config_push`: `config_update` contents sent after heartbeats
//! - `relay`: agent-facing HTTP endpoints, including the upgrade

pub mod config_push;
pub mod connection;
pub mod pending;
pub mod protocol;
pub mod reader;
pub mod registry;
pub mod relay;

use std::time::Duration;

use thiserror::Error;

pub use config_push::AgentConfigSource;
pub use connection::{AgentConnection, ConnectionStatus, Frame, FrameSink};
pub use protocol::{Envelope, MessageType};
pub use reader::TunnelServices;
pub use registry::{AgentRegistry, RegistryError};
pub use relay::{relay_router, RelayState};

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("agent {0} disconnected")]
    Disconnected(String),
    #[error("write to agent {agent_id} failed: {reason}")]
    Write { agent_id: String, reason: String },
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("agent error: {0}")]
    Upstream(String),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}
