//! Server Infrastructure Module.
//!
//! The server accepts control connections from exit-node clients, validates
//! their HELLO handshake, reserves and binds the claimed ports, and then
//! serves SOCKS5 on each port by dialing through the client's multiplexed
//! session.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          RSK Server                              │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────┐  │
//! │  │ Control listener │  │ Admission gate   │  │ IP rate      │  │
//! │  │ (:7000)          │  │ (max clients)    │  │ limiter      │  │
//! │  └────────┬─────────┘  └────────┬─────────┘  └──────┬───────┘  │
//! │           │                     │                    │          │
//! │           ▼                     ▼                    ▼          │
//! │  ┌──────────────────────────────────────────────────────────┐  │
//! │  │                  Handshake handler                        │  │
//! │  │  HELLO → token → port range → reserve → bind → session   │  │
//! │  └──────────────────────────┬───────────────────────────────┘  │
//! │                             │                                   │
//! │  ┌──────────────────────────▼───────────────────────────────┐  │
//! │  │  Port registry ⇄ SOCKS5 acceptors (one per bound port)   │  │
//! │  └──────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod limiter;
pub mod rate_limit;
pub mod registry;
pub mod socks;

pub use config::ServerConfig;
pub use limiter::ConnectionLimiter;
pub use rate_limit::IpRateLimiter;
pub use registry::{ClientMeta, PortReservation, Registry};
pub use socks::{SocksHandle, SocksManager};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::mux::{self, MuxConfig, MuxMode, MuxSession};
use crate::proto::{self, HelloResp, Status};
use crate::{auth, HANDSHAKE_TIMEOUT};

/// State shared by every control-connection handler.
struct Shared {
    config: ServerConfig,
    registry: Arc<Registry>,
    socks: SocksManager,
    rate_limiter: Arc<IpRateLimiter>,
    mux_config: MuxConfig,
}

/// Main server instance.
pub struct Server {
    config: ServerConfig,
    registry: Arc<Registry>,
}

impl Server {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: Arc::new(Registry::new()),
        }
    }

    /// The port registry, shared with the SOCKS acceptors.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Bind the control listener and serve until `shutdown` is canceled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve control connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("server listening on {}", listener.local_addr()?);

        let limiter = ConnectionLimiter::new(self.config.max_clients);
        tracing::info!("connection limiter initialized, max_clients={}", self.config.max_clients);

        let rate_limiter = Arc::new(IpRateLimiter::new(
            self.config.max_auth_failures,
            self.config.auth_block_duration,
        ));
        {
            let rate_limiter = Arc::clone(&rate_limiter);
            tokio::spawn(async move { rate_limiter.run_sweeper().await });
        }
        tracing::info!(
            "rate limiter initialized, max_auth_failures={}, auth_block_duration={:?}",
            self.config.max_auth_failures,
            self.config.auth_block_duration
        );

        let shared = Arc::new(Shared {
            config: self.config.clone(),
            registry: Arc::clone(&self.registry),
            socks: SocksManager::new(Arc::clone(&self.registry)),
            rate_limiter: Arc::clone(&rate_limiter),
            mux_config: MuxConfig::default(),
        });

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (conn, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("accept error: {}", e);
                            continue;
                        }
                    };
                    tracing::debug!("accepted control connection from {}", peer);

                    let Some(permit) = limiter.acquire() else {
                        tracing::warn!(
                            "connection limit reached, rejecting {} (max_clients={})",
                            peer,
                            limiter.max_clients()
                        );
                        drop(conn);
                        continue;
                    };

                    let shared = Arc::clone(&shared);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_control_connection(shared, conn, peer, permit, shutdown).await;
                    });
                }
            }
        }

        tracing::info!("server shutting down");
        rate_limiter.close();
        Ok(())
    }
}

/// Drive one control connection from accept to teardown.
///
/// Any failure falls through to the same cleanup: the port reservation guard
/// releases the slots (shutting down their SOCKS acceptors), and dropping
/// the connection/session tears down the transport. The admission permit is
/// held until this function returns.
async fn handle_control_connection(
    shared: Arc<Shared>,
    mut conn: TcpStream,
    peer: SocketAddr,
    _permit: OwnedSemaphorePermit,
    shutdown: CancellationToken,
) {
    let remote_ip = peer.ip();

    // Blocked sources get silence, not a status
    if shared.rate_limiter.is_blocked(remote_ip) {
        tracing::warn!("closing connection from rate-limited {}", remote_ip);
        return;
    }

    let _ = conn.set_nodelay(true);

    let hello = match timeout(HANDSHAKE_TIMEOUT, proto::read_hello(&mut conn)).await {
        Ok(Ok(hello)) => hello,
        Ok(Err(e)) => {
            tracing::warn!("invalid HELLO from {}: {}", peer, e);
            send_error(&mut conn, Status::BadRequest, "invalid HELLO message").await;
            return;
        }
        Err(_) => {
            tracing::warn!("HELLO read from {} timed out", peer);
            send_error(&mut conn, Status::BadRequest, "handshake timed out").await;
            return;
        }
    };

    tracing::info!(
        "received HELLO from {}, name={:?}, ports={:?}",
        peer,
        hello.name,
        hello.ports
    );

    if !auth::token_eq(&hello.token, &shared.config.token) {
        if shared.rate_limiter.record_failure(remote_ip) {
            tracing::warn!("{} blocked after repeated authentication failures", remote_ip);
        }
        // Same response whether or not blocking just began
        send_error(&mut conn, Status::AuthFail, "authentication failed").await;
        return;
    }

    // The source proved knowledge of the token; clear its failure record
    // even if the port claims below end up refused.
    shared.rate_limiter.reset(remote_ip);

    for &port in &hello.ports {
        if port < shared.config.port_min || port > shared.config.port_max {
            tracing::warn!(
                "port {} outside allowed range {}-{}",
                port,
                shared.config.port_min,
                shared.config.port_max
            );
            send_error(
                &mut conn,
                Status::PortForbidden,
                &format!(
                    "port {} outside allowed range {}-{}",
                    port, shared.config.port_min, shared.config.port_max
                ),
            )
            .await;
            return;
        }
    }

    let reservation = match shared.registry.reserve_ports(&hello.ports) {
        Ok(reservation) => reservation,
        Err(e) => {
            tracing::warn!("port reservation failed for {}: {}", peer, e);
            send_error(&mut conn, Status::PortInUse, "one or more ports are already in use").await;
            return;
        }
    };

    // Probe-bind every claimed port before acknowledging the handshake
    let mut placeholders = Vec::with_capacity(reservation.ports().len());
    for &port in reservation.ports() {
        match TcpListener::bind((shared.config.bind_ip, port)).await {
            Ok(listener) => placeholders.push(listener),
            Err(e) => {
                tracing::warn!("failed to bind port {}: {}", port, e);
                send_error(&mut conn, Status::PortInUse, &format!("failed to bind port {}", port))
                    .await;
                return;
            }
        }
    }

    let resp = HelloResp {
        status: Status::Ok,
        accepted_ports: hello.ports.clone(),
        message: "connection accepted".to_string(),
    };
    match timeout(HANDSHAKE_TIMEOUT, proto::write_hello_resp(&mut conn, &resp)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!("failed to write HELLO_RESP to {}: {}", peer, e);
            return;
        }
        Err(_) => {
            tracing::warn!("HELLO_RESP write to {} timed out", peer);
            return;
        }
    }

    if let Err(e) = mux::configure_control_socket(&conn, &shared.mux_config) {
        tracing::warn!("failed to set control socket options for {}: {}", peer, e);
    }
    let session = Arc::new(MuxSession::new(conn, &shared.mux_config, MuxMode::Server));

    let client_id = Uuid::new_v4().to_string();
    let meta = ClientMeta {
        name: hello.name.clone(),
        id: client_id.clone(),
    };

    for (&port, placeholder) in reservation.ports().iter().zip(placeholders) {
        // The SOCKS acceptor takes over this bind
        drop(placeholder);

        let handle = match shared
            .socks
            .start_listener(port, shared.config.bind_ip, Arc::clone(&session))
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("failed to start SOCKS5 listener on port {}: {}", port, e);
                session.close();
                return;
            }
        };

        if let Err(e) = shared.registry.bind_session(
            port,
            Arc::clone(&session),
            handle,
            meta.clone(),
            shared.config.max_conns_per_client,
        ) {
            tracing::error!("failed to bind session to port {}: {}", port, e);
            session.close();
            return;
        }
    }

    tracing::info!(
        "client session established, id={}, name={:?}, ports={:?}",
        client_id,
        hello.name,
        hello.ports
    );

    tokio::select! {
        _ = session.closed() => {
            tracing::info!("client {} session closed", client_id);
        }
        _ = shutdown.cancelled() => {
            tracing::info!("shutting down client {} session", client_id);
            session.close();
            session.closed().await;
        }
    }

    reservation.release();
}

/// Best-effort error reply; the connection is closed by the caller either
/// way.
async fn send_error(conn: &mut TcpStream, status: Status, message: &str) {
    let resp = HelloResp {
        status,
        accepted_ports: Vec::new(),
        message: message.to_string(),
    };

    match timeout(HANDSHAKE_TIMEOUT, proto::write_hello_resp(conn, &resp)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("failed to write {} response: {}", status, e),
        Err(_) => tracing::debug!("{} response write timed out", status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Hello;
    use std::time::Duration;

    const TOKEN: &[u8] = b"0123456789abcdef0";

    fn test_config() -> ServerConfig {
        let mut config = ServerConfig::new(TOKEN.to_vec());
        // Ephemeral test ports land anywhere
        config.port_min = 1024;
        config.port_max = 65535;
        config.auth_block_duration = Duration::from_millis(100);
        config
    }

    async fn start_server(config: ServerConfig) -> (SocketAddr, CancellationToken, Arc<Registry>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();

        let server = Server::new(config);
        let registry = server.registry();
        let token = shutdown.clone();
        tokio::spawn(async move {
            server.serve(listener, token).await.unwrap();
        });

        (addr, shutdown, registry)
    }

    async fn handshake(
        addr: SocketAddr,
        token: &[u8],
        ports: Vec<u16>,
    ) -> crate::Result<(TcpStream, HelloResp)> {
        let mut conn = TcpStream::connect(addr).await?;
        let hello = Hello {
            token: token.to_vec(),
            ports,
            name: "itest".to_string(),
        };
        proto::write_hello(&mut conn, &hello).await?;
        let resp = proto::read_hello_resp(&mut conn).await?;
        Ok((conn, resp))
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    async fn wait_for_slots(registry: &Registry, expected: usize) {
        for _ in 0..100 {
            if registry.slot_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "slot count never reached {expected}, is {}",
            registry.slot_count()
        );
    }

    #[tokio::test]
    async fn test_handshake_ok() {
        let (addr, _shutdown, registry) = start_server(test_config()).await;
        let port = free_port().await;

        let (conn, resp) = handshake(addr, TOKEN, vec![port]).await.unwrap();
        assert_eq!(resp.status, Status::Ok);
        assert_eq!(resp.accepted_ports, vec![port]);
        assert_eq!(registry.slot_count(), 1);

        // Dropping the control connection tears the slot down
        drop(conn);
        wait_for_slots(&registry, 0).await;
    }

    #[tokio::test]
    async fn test_socks_listener_comes_up() {
        let (addr, _shutdown, _registry) = start_server(test_config()).await;
        let port = free_port().await;

        let (_conn, resp) = handshake(addr, TOKEN, vec![port]).await.unwrap();
        assert_eq!(resp.status, Status::Ok);

        // The bound port now answers the SOCKS5 greeting
        let mut socks = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        socks.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut greeting = [0u8; 2];
        socks.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_auth_failure() {
        let (addr, _shutdown, registry) = start_server(test_config()).await;

        let (_conn, resp) = handshake(addr, b"wrong-token-wrong", vec![20001])
            .await
            .unwrap();
        assert_eq!(resp.status, Status::AuthFail);
        assert_eq!(registry.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_port_forbidden_names_port_and_range() {
        let mut config = test_config();
        config.port_min = 20000;
        config.port_max = 20010;
        let (addr, _shutdown, _registry) = start_server(config).await;

        let (_conn, resp) = handshake(addr, TOKEN, vec![19999]).await.unwrap();
        assert_eq!(resp.status, Status::PortForbidden);
        assert!(resp.message.contains("19999"));
        assert!(resp.message.contains("20000-20010"));
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let (addr, _shutdown, registry) = start_server(test_config()).await;
        let port = free_port().await;

        let (_conn_a, resp_a) = handshake(addr, TOKEN, vec![port]).await.unwrap();
        assert_eq!(resp_a.status, Status::Ok);

        let (_conn_b, resp_b) = handshake(addr, TOKEN, vec![port]).await.unwrap();
        assert_eq!(resp_b.status, Status::PortInUse);

        // Client A is unaffected
        assert_eq!(registry.slot_count(), 1);
        assert!(registry.get_session(port).is_some());
    }

    #[tokio::test]
    async fn test_rate_limiting_flow() {
        let mut config = test_config();
        config.max_auth_failures = 2;
        let (addr, _shutdown, _registry) = start_server(config).await;
        let port = free_port().await;

        // Two failures each get a full AUTH_FAIL reply
        for _ in 0..2 {
            let (_conn, resp) = handshake(addr, b"wrong-token-wrong", vec![port])
                .await
                .unwrap();
            assert_eq!(resp.status, Status::AuthFail);
        }

        // Third attempt from a now-blocked source is closed without a reply
        match handshake(addr, TOKEN, vec![port]).await {
            Err(crate::Error::Network(_)) => {}
            other => panic!("expected closed connection, got {other:?}"),
        }

        // After the block expires, a correct token succeeds and resets
        tokio::time::sleep(Duration::from_millis(150)).await;
        let (conn, resp) = handshake(addr, TOKEN, vec![port]).await.unwrap();
        assert_eq!(resp.status, Status::Ok);
        drop(conn);

        // The failure record was cleared: a wrong token gets a reply again
        let other_port = free_port().await;
        let (_conn, resp) = handshake(addr, b"wrong-token-wrong", vec![other_port])
            .await
            .unwrap();
        assert_eq!(resp.status, Status::AuthFail);
    }

    #[tokio::test]
    async fn test_bad_hello_gets_bad_request() {
        let (addr, _shutdown, _registry) = start_server(test_config()).await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        use tokio::io::AsyncWriteExt;
        conn.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let resp = proto::read_hello_resp(&mut conn).await.unwrap();
        assert_eq!(resp.status, Status::BadRequest);
    }

    #[tokio::test]
    async fn test_multi_port_claim() {
        let (addr, _shutdown, registry) = start_server(test_config()).await;
        let (p1, p2) = (free_port().await, free_port().await);

        let (conn, resp) = handshake(addr, TOKEN, vec![p1, p2]).await.unwrap();
        assert_eq!(resp.status, Status::Ok);
        assert_eq!(resp.accepted_ports, vec![p1, p2]);
        assert_eq!(registry.slot_count(), 2);

        drop(conn);
        wait_for_slots(&registry, 0).await;
    }

    #[tokio::test]
    async fn test_graceful_shutdown_releases_slots() {
        let (addr, shutdown, registry) = start_server(test_config()).await;
        let port = free_port().await;

        let (_conn, resp) = handshake(addr, TOKEN, vec![port]).await.unwrap();
        assert_eq!(resp.status, Status::Ok);
        assert_eq!(registry.slot_count(), 1);

        shutdown.cancel();
        wait_for_slots(&registry, 0).await;

        // The SOCKS listener went with the slot
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }
}
