//! Kocket demo server entry point.
//!
//! Runs a small relay: every client names itself by sending a JSON object
//! with a `name` field, and every JSON message a client sends is broadcast
//! to all connected clients.
//!
//! # Usage
//!
//! ```text
//! kocket [OPTIONS]
//!
//! Options:
//!   --bind <IP>                  Address to listen on [default: 0.0.0.0]
//!   --port <PORT>                Port to listen on [default: 7007]
//!   --max-payload-size <BYTES>   Largest accepted frame / message
//!   --config <FILE>              TOML file with a ServerConfig
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable                  | Description                    |
//! |---------------------------|--------------------------------|
//! | `KOCKET_BIND`             | Listen address                 |
//! | `KOCKET_PORT`             | Listen port                    |
//! | `KOCKET_MAX_PAYLOAD_SIZE` | Largest accepted frame/message |
//! | `KOCKET_CONFIG`           | Path to a TOML config file     |
//!
//! Values given on the command line or in the environment override the
//! config file, which overrides the built-in defaults.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use kocket::{Context, Next, Server, ServerConfig, ServerEvent};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Kocket WebSocket server.
#[derive(Debug, Parser)]
#[command(name = "kocket", about = "Minimal WebSocket server with a handler pipeline", version)]
struct Cli {
    /// IP address to bind to.
    ///
    /// `0.0.0.0` accepts connections on every interface, `127.0.0.1` only
    /// local ones.
    #[arg(long, env = "KOCKET_BIND")]
    bind: Option<String>,

    /// TCP port to listen on.  `0` picks a free port.
    #[arg(long, env = "KOCKET_PORT")]
    port: Option<u16>,

    /// Largest accepted frame payload and reassembled message, in bytes.
    #[arg(long, env = "KOCKET_MAX_PAYLOAD_SIZE")]
    max_payload_size: Option<usize>,

    /// TOML configuration file.
    #[arg(long, env = "KOCKET_CONFIG")]
    config: Option<PathBuf>,
}

impl Cli {
    /// Builds the effective [`ServerConfig`].
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be loaded, `--bind` is not
    /// an IP address, or the result fails validation.
    fn into_server_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => ServerConfig::default(),
        };

        let ip = match &self.bind {
            Some(bind) => bind
                .parse::<IpAddr>()
                .with_context(|| format!("invalid bind address: '{bind}'"))?,
            None => config.bind_addr.ip(),
        };
        let port = self.port.unwrap_or(config.bind_addr.port());
        config.bind_addr = SocketAddr::new(ip, port);

        if let Some(max) = self.max_payload_size {
            config.max_payload_size = max;
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

// ── Demo handlers ─────────────────────────────────────────────────────────────

/// Names the connection after the message's `name` field and relays the
/// JSON to everyone.  Messages that are not JSON are passed on untouched.
async fn relay(server: Server, ctx: Arc<Context>, next: Next) -> anyhow::Result<()> {
    if let Some(json) = ctx.json() {
        if let Some(name) = json.get("name").and_then(|name| name.as_str()) {
            ctx.set_name(name);
        }
        let delivered = server.broadcast(json).await;
        debug!("connection {}: relayed to {delivered} connection(s)", ctx.id());
    }
    next.run().await
}

/// Last step of the chain: logs what arrived.
async fn log_message(ctx: Arc<Context>, next: Next) -> anyhow::Result<()> {
    if let Some(message) = ctx.message() {
        info!(
            "connection {} ({}): {:?} message, {} bytes",
            ctx.id(),
            ctx.name().unwrap_or_else(|| "anonymous".to_string()),
            message.kind,
            message.data.len()
        );
    }
    next.run().await
}

/// Mirrors server events into the log.
fn spawn_event_logger(server: &Server) {
    let mut events = server.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ServerEvent::Connect { id, peer_addr, path }) => {
                    debug!("event connect: {id} from {peer_addr:?} on {path}");
                }
                Ok(ServerEvent::Close { id }) => debug!("event close: {id}"),
                Ok(ServerEvent::Error { id, error }) => debug!("event error on {id:?}: {error}"),
                Ok(ServerEvent::AsyncError(fault)) => warn!("{fault}"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("event logger lagged; {n} event(s) skipped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging setup ─────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_server_config()?;
    info!("kocket starting on {}", config.bind_addr);

    let server = Server::new(config);
    spawn_event_logger(&server);

    let relay_server = server.clone();
    server
        .use_handler(move |ctx: Arc<Context>, next: Next| relay(relay_server.clone(), ctx, next))
        .use_handler(log_message);

    let listening = server
        .listen()
        .await
        .context("failed to start the server")?;
    info!("Server listening on {}", listening.local_addr());

    // ── Graceful shutdown ─────────────────────────────────────────────────────
    let shutdown_handle = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, shutting down");
                shutdown_handle.shutdown();
            }
            Err(e) => tracing::error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    listening.wait().await;
    info!("kocket stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
