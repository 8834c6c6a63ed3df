//! WebSocket Reverse Proxy
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌──────────────────────────────────────────────┐
//!                     │              WEBSOCKET PROXY                  │
//!                     │                                               │
//!   Client upgrade    │  ┌────────┐   ┌──────────┐   ┌───────────┐   │
//!   ──────────────────┼─▶│  http  │──▶│ upgrader │──▶│ connector │───┼──▶ Backend
//!                     │  │ server │   │ + adapt  │   │  (dial)   │   │
//!                     │  └────────┘   └──────────┘   └───────────┘   │
//!                     │                     │                        │
//!                     │                     ▼                        │
//!   Client frames     │  ┌────────────────────────────────────────┐ │
//!   ◀────────────────▶┼──│ session: relay C→B (+ping), relay B→C  │─┼──▶ Backend frames
//!                     │  └────────────────────────────────────────┘ │
//!                     │                                               │
//!                     │  config · observability · lifecycle          │
//!                     └──────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use websocket_proxy::config::validation::validate_config;
use websocket_proxy::config::{load_config, Config, ConfigError};
use websocket_proxy::lifecycle::{spawn_signal_handler, Shutdown};
use websocket_proxy::observability::{logging, metrics};
use websocket_proxy::HttpServer;

/// How long live sessions get to close after shutdown starts.
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "websocket-proxy")]
#[command(about = "Transparent WebSocket reverse proxy", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,

    /// Backend WebSocket URL, overrides `backend.url`.
    #[arg(long)]
    backend: Option<String>,

    /// Answer client pings at the proxy instead of forwarding them.
    #[arg(long)]
    ping_pong: bool,
}

impl Cli {
    fn into_config(self) -> Result<Config, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => Config::default(),
        };
        if let Some(bind) = self.bind {
            config.listener.bind_address = bind;
        }
        if let Some(backend) = self.backend {
            config.backend.url = backend;
        }
        if self.ping_pong {
            config.proxy.support_client_ping_pong = true;
        }
        // Overrides bypass the loader's checks.
        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Cli::parse().into_config()?;
    logging::init_logging(&config.observability);

    tracing::info!("websocket-proxy v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        path = %config.listener.path,
        backend = %config.backend.url,
        max_sessions = config.listener.max_sessions,
        support_client_ping_pong = config.proxy.support_client_ping_pong,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    let tls = config.listener.tls.is_some();
    let bind_address = config.listener.bind_address.clone();
    let server = HttpServer::new(config, shutdown.clone())?;
    let proxy = server.proxy();

    if tls {
        let addr: SocketAddr = bind_address.parse()?;
        server.run_tls(addr).await?;
    } else {
        let listener = TcpListener::bind(&bind_address).await?;
        tracing::info!(address = %listener.local_addr()?, "Listening for connections");
        server.run(listener).await?;
    }

    let remaining = proxy.tracker().active_count();
    if remaining > 0 {
        tracing::info!(sessions = remaining, "Waiting for sessions to close");
    }
    if !proxy.tracker().wait_idle(DRAIN_DEADLINE).await {
        tracing::warn!(
            sessions = proxy.tracker().active_count(),
            "Sessions still open at drain deadline"
        );
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
