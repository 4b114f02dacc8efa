#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # agent-relay
//!
//! Reverse-tunnel broker. Agents dial in over a persistent WebSocket and
//! stay connected; callers authenticate with a signed token and have their
//! HTTP requests forwarded through the agent owned by their account.
//!
//! ## Subcommands
//!
//! - `agent-relay serve` (default): run the broker
//! - `agent-relay check`: load and validate configuration, then exit
//!
//! ## API surface
//!
//! | Method | Path                        | Auth              | Description                     |
//! |--------|-----------------------------|-------------------|---------------------------------|
//! | GET    | `/api/health`               | No                | Liveness probe                  |
//! | POST   | `/api/v1/auth/token`        | API key           | Issue caller token              |
//! | POST   | `/api/v1/auth/verify`       | No                | Inspect caller token            |
//! | GET    | `/api/v1/metrics`           | Bearer            | Customer metrics                |
//! | ANY    | `/api/v1/proxy/{*path}`     | Bearer            | Forward through customer agent  |
//! | GET    | `/api/v1/agent/connect`     | Agent credential  | Agent WebSocket upgrade         |
//! | GET    | `/api/v1/agent/health`      | No                | Agent connection status         |
//! | GET    | `/api/v1/agent/metrics`     | No                | Latest agent metrics            |
//! | POST   | `/api/v1/agent/deregister`  | Agent credential  | Drop an agent                   |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          - entry point, clap subcommands, tracing, graceful shutdown
//! config.rs        - TOML + env-var configuration, startup validation
//! server.rs        - TLS listener, signal handling
//! state.rs         - AppState: wires every component
//! routes/          - caller-facing handlers and admission middleware
//! proxy.rs         - routing table, per-customer breakers, forward
//! tunnel/
//!   protocol.rs    - JSON envelope
//!   pending.rs     - correlation table
//!   connection.rs  - one agent connection, serialized writes
//!   reader.rs      - per-connection reader task
//!   registry.rs    - membership, health monitors, reaper
//!   config_push.rs - config_update contents
//!   relay.rs       - agent-facing endpoints
//! resilience/      - token bucket, circuit breaker, validator
//! auth/            - caller tokens, route patterns, agent handshake
//! store/           - directory + cache boundaries
//! metrics.rs       - signals and per-call records
//! ```

use std::process::ExitCode;

use agent_relay::{config::LoggingConfig, routes, server, AppState, Config};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Reverse-tunnel broker.
#[derive(Parser)]
#[command(name = "agent-relay", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Validate configuration and exit.
    Check {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let (config_path, serve) = match cli.command {
        Some(Commands::Serve { config }) => (config, true),
        Some(Commands::Check { config }) => (config, false),
        None => (None, true),
    };

    let config = match Config::load(config_path.as_deref()).and_then(|c| {
        c.validate()?;
        Ok(c)
    }) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("agent-relay: {e}");
            return ExitCode::FAILURE;
        }
    };

    if !serve {
        println!("configuration OK");
        return ExitCode::SUCCESS;
    }

    init_tracing(&config.logging);
    match run_server(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Broker stopped with an error");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_server(config: Config) -> Result<(), server::ServerError> {
    info!("agent-relay v{} starting", env!("CARGO_PKG_VERSION"));
    if config.jwt.secret == "change-me" {
        warn!("Using default token secret; set RELAY_JWT_SECRET or update config");
    }

    let shutdown = CancellationToken::new();
    let state = AppState::build(config, &shutdown)?;
    let app = routes::router(state.clone());

    // Close agent tunnels as soon as shutdown starts so the listener can
    // finish draining.
    let registry = state.registry.clone();
    let signal_token = shutdown.clone();
    let drain_task = tokio::spawn(async move {
        tokio::select! {
            () = server::shutdown_signal() => signal_token.cancel(),
            () = signal_token.cancelled() => {}
        }
        info!("Shutting down...");
        registry.shutdown().await;
    });

    let result = server::serve(app, &state.config.server, shutdown.clone()).await;
    shutdown.cancel();
    if let Err(e) = drain_task.await {
        warn!(error = %e, "Shutdown task failed");
    }
    info!("Goodbye");
    result
}
