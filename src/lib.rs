#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! agent-relay library: the broker's building blocks.
//!
//! - `tunnel`: agent WebSocket tunnels, their registry and reader tasks
//! - `proxy`: customer → agent routing and forwarding behind circuit breakers
//! - `resilience`: token bucket, circuit breaker, request validator
//! - `auth`: caller tokens, route patterns, agent handshake credentials
//! - `store`: directory and cache boundaries with in-memory implementations
//! - `metrics`: signal names, in-memory recorder, per-call metric records
//! - `routes`: caller-facing REST handlers
//! - `config`: configuration loading and validation
//! - `server`: TLS listener and shutdown signalling

pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod proxy;
pub mod resilience;
pub mod routes;
pub mod server;
pub mod state;
pub mod store;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::BrokerError;
pub use proxy::ProxyService;
pub use state::AppState;
pub use tunnel::{AgentRegistry, RelayState};
