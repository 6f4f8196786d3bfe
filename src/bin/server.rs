//! RSK Server Binary
//!
//! Accepts exit-node control connections and exposes one SOCKS5 listener
//! per claimed port.
//!
//! ```text
//! rsk-server --token <TOKEN> [--listen :7000] [--port-range 20000-40000]
//! ```

use std::net::IpAddr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use rsk::auth;
use rsk::server::{config, Server, ServerConfig};

#[derive(Parser)]
#[command(name = "rsk-server", version, about = "RSK server: reverse SOCKS5 proxy entry point")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Address to listen on for client control connections
    #[arg(long, default_value = ":7000")]
    listen: String,

    /// Authentication token (at least 16 bytes; generated when omitted)
    #[arg(long)]
    token: Option<String>,

    /// IP address to bind SOCKS5 listeners on
    #[arg(long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Allowed port range for SOCKS5 listeners (min-max)
    #[arg(long = "port-range", default_value = "20000-40000")]
    port_range: String,

    /// Maximum concurrent client connections
    #[arg(long = "max-clients", default_value_t = 100)]
    max_clients: usize,

    /// Authentication failures before a source IP is blocked
    #[arg(long = "max-auth-failures", default_value_t = 5)]
    max_auth_failures: u32,

    /// How long to block an IP after too many auth failures
    #[arg(long = "auth-block-duration", default_value = "5m", value_parser = humantime::parse_duration)]
    auth_block_duration: Duration,

    /// Maximum SOCKS5 connections per client
    #[arg(long = "max-connections-per-client", default_value_t = 100)]
    max_connections_per_client: u32,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information
    Version,
    /// Run the server (the default)
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respects RUST_LOG (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    if let Some(Command::Version) = args.command {
        println!("rsk-server {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let token = match &args.token {
        Some(token) => token.clone().into_bytes(),
        None => {
            let token = auth::generate_token(auth::MIN_TOKEN_LEN);
            println!("No token provided. Generated one:");
            println!("    {token}");
            println!("Save it and pass it to clients with --token.");
            token.into_bytes()
        }
    };

    let (port_min, port_max) = config::parse_port_range(&args.port_range)?;

    let config = ServerConfig {
        listen_addr: config::normalize_listen_addr(&args.listen),
        token,
        bind_ip: args.bind,
        port_min,
        port_max,
        max_clients: args.max_clients,
        max_auth_failures: args.max_auth_failures,
        auth_block_duration: args.auth_block_duration,
        max_conns_per_client: args.max_connections_per_client,
    };
    config.validate()?;

    tracing::info!(
        "RSK server starting, listen={}, bind={}, port_range={}-{}, max_clients={}",
        config.listen_addr,
        config.bind_ip,
        config.port_min,
        config.port_max,
        config.max_clients
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    let server = Server::new(config);
    server.run(shutdown).await?;

    tracing::info!("RSK server stopped");
    Ok(())
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
