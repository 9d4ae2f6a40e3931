//! muxsocks - SOCKS5 over one multiplexed WebSocket connection
//!
//! Runs either side of the proxy:
//! - `--mode server` accepts WebSocket connections and dials destinations
//! - `--mode client` exposes a local SOCKS5 port and tunnels every session
//!   to the server

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use muxsocks::carrier::WsConnector;
use muxsocks::proxy::{ClientProxy, Server, TlsIdentity};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Server,
    Client,
}

/// SOCKS5 proxy multiplexed over a single WebSocket connection
#[derive(Parser, Debug)]
#[command(name = "muxsocks")]
#[command(version, about)]
struct Args {
    /// Run as the WebSocket server or the local SOCKS5 client
    #[arg(long, value_enum)]
    mode: Mode,

    /// Shared secret; sent by the client in a header, checked by the
    /// server at upgrade time. Empty disables the check.
    #[arg(long, default_value = "")]
    secret: String,

    /// Number of WebSocket connections a client maintains
    #[arg(long, default_value_t = 1)]
    client_count: usize,

    /// Server URL, e.g. ws://example.com:8080/proxy or wss://...
    #[arg(long)]
    server_url: String,

    /// Local SOCKS5 listen port (client mode)
    #[arg(long, default_value_t = 1080)]
    listen_port: u16,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    /// PEM certificate chain for wss:// (server mode)
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// PEM private key for wss:// (server mode)
    #[arg(long)]
    tls_key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!("muxsocks v{}", muxsocks::VERSION);

    let secret = (!args.secret.is_empty()).then(|| args.secret.clone());

    match args.mode {
        Mode::Server => {
            let tls = match (args.tls_cert, args.tls_key) {
                (Some(cert), Some(key)) => Some(TlsIdentity { cert, key }),
                (None, None) => None,
                _ => anyhow::bail!("--tls-cert and --tls-key must be given together"),
            };
            Server::new(args.server_url, secret, tls)
                .run()
                .await
                .context("server failed")?;
        }
        Mode::Client => {
            let connector = Arc::new(WsConnector::new(args.server_url, secret));
            ClientProxy::new(args.listen_port, args.client_count, connector)
                .run()
                .await
                .context("client failed")?;
        }
    }

    Ok(())
}
