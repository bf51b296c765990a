//! Relay Tunnel Client
//!
//! Establishes a tunnel to one relay server and holds it open:
//! - Negotiates the tunnel protocol from the server's capabilities, among
//!   the protocols it has layers for (plain SSH only: no obfuscator or meek
//!   dialer ships with the client)
//! - Authenticates the server by its pinned host key
//! - Optionally probes a port forward through the tunnel
//! - Closes cleanly on Ctrl+C, or exits when the tunnel fails

use anyhow::{Context, Result};
use clap::Parser;
use relay_tunnel::transport::PendingConns;
use relay_tunnel::{establish_tunnel, Config, Layers, ServerEntry, Tunneler, TunnelProtocol};
use std::sync::Arc;
use tracing::{error, info};

/// Relay Tunnel Client
#[derive(Parser, Debug)]
#[command(name = "relay-client")]
#[command(about = "Relay Tunnel Client - obfuscated SSH tunnel to a relay server")]
#[command(version)]
struct Args {
    /// Configuration file path (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<String>,

    /// Server entry file path
    #[arg(short, long, default_value = "server.toml")]
    server_entry: String,

    /// Tunnel protocol (overrides config). Only SSH is carried by this client;
    /// OSSH, UNFRONTED-MEEK-OSSH and FRONTED-MEEK-OSSH are rejected before dialing
    #[arg(short, long)]
    protocol: Option<TunnelProtocol>,

    /// Remote address to open a port forward to once established (host:port)
    #[arg(long)]
    probe: Option<String>,

    /// Write a default configuration to this path and exit
    #[arg(long)]
    generate_config: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides config
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.generate_config {
        Config::default()
            .save(path)
            .with_context(|| format!("Failed to write configuration to {}", path))?;
        println!("Wrote default configuration to {}", path);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };
    if let Some(protocol) = args.protocol {
        config.tunnel_protocol = Some(protocol);
    }

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, &config.logging.format);

    let server_entry = ServerEntry::load(&args.server_entry)
        .with_context(|| format!("Failed to load server entry {}", args.server_entry))?;
    info!("Relay Tunnel Client v{}", relay_tunnel::VERSION);

    let pending = PendingConns::new();
    let layers = Layers::default();

    let tunnel = tokio::select! {
        result = establish_tunnel(&config, &layers, Some(pending.clone()), Arc::new(server_entry)) => {
            result.context("Failed to establish tunnel")?
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, abandoning connection attempt");
            pending.close_all();
            return Ok(());
        }
    };
    info!(
        "Tunnel established to {} using {} (session {})",
        tunnel.server_id(),
        tunnel.protocol(),
        tunnel.session_id()
    );

    if let Some(remote_addr) = &args.probe {
        match Tunneler::dial(&tunnel, remote_addr).await {
            Ok(_forward) => info!("Port forward to {} opened", remote_addr),
            Err(e) => {
                error!("Port forward to {} failed: {}", remote_addr, e);
                tunnel.signal_failure();
            }
        }
    }
    tunnel.set_session_started();

    tokio::select! {
        _ = tunnel.closed() => {
            error!("Tunnel to {} failed", tunnel.server_id());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    tunnel.shutdown().await;
    Ok(())
}

fn init_logging(level: &str, format: &str) {
    let builder = tracing_subscriber::fmt().with_env_filter(level);
    match format {
        "json" => builder.json().init(),
        "compact" => builder.compact().init(),
        _ => builder.init(),
    }
}
