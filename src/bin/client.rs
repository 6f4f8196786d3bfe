//! RSK Client Binary
//!
//! Connects to an RSK server, claims a port, and serves as the egress
//! dialer ("exit node") for SOCKS5 connections arriving on that port.
//!
//! ```text
//! rsk-client --server host:7000 --token <TOKEN> --port 20001
//! ```

use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use rsk::client::{config, Client, ClientConfig};

#[derive(Parser)]
#[command(name = "rsk-client", version, about = "RSK client: exit node for the reverse SOCKS5 proxy")]
struct Args {
    /// Server control-channel address (host:port)
    #[arg(long)]
    server: String,

    /// Authentication token (at least 16 bytes)
    #[arg(long)]
    token: String,

    /// Port to claim on the server
    #[arg(long)]
    port: u16,

    /// Client name for identification (defaults to the host name)
    #[arg(long)]
    name: Option<String>,

    /// Timeout for dialing egress targets
    #[arg(long = "dial-timeout", default_value = "15s", value_parser = humantime::parse_duration)]
    dial_timeout: Duration,

    /// Allow egress to private network ranges
    #[arg(long = "allow-private-networks")]
    allow_private_networks: bool,

    /// Additional CIDR blocks to refuse (comma-separated)
    #[arg(long = "blocked-networks", default_value = "")]
    blocked_networks: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    let name = args.name.unwrap_or_else(default_client_name);

    let client_config = ClientConfig {
        server_addr: args.server,
        token: args.token.into_bytes(),
        port: args.port,
        name,
        dial_timeout: args.dial_timeout,
        allow_private_networks: args.allow_private_networks,
        blocked_networks: config::parse_comma_separated(&args.blocked_networks),
    };
    client_config.validate()?;

    tracing::info!(
        "RSK client starting, server={}, port={}, name={:?}, allow_private={}",
        client_config.server_addr,
        client_config.port,
        client_config.name,
        client_config.allow_private_networks
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    let client = Client::new(client_config);
    client.run(shutdown).await?;

    tracing::info!("RSK client stopped");
    Ok(())
}

/// The machine hostname, or "unknown" if it cannot be resolved.
fn default_client_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn spawn_signal_handler(shutdown: CancellationToken) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
            tracing::info!("received shutdown signal");
            shutdown.cancel();
        });
    }

    #[cfg(not(unix))]
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received shutdown signal");
        shutdown.cancel();
    });

    Ok(())
}
