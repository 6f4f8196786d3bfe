//! RSK client (exit node).
//!
//! Connects outbound to the server, claims its port via the HELLO
//! handshake, and then serves sub-streams: each one carries a CONNECT_REQ
//! naming an egress target, which is checked against the address filter and
//! dialed. Transient failures reconnect with jittered exponential backoff;
//! `AUTH_FAIL` and `PORT_IN_USE` are terminal.

pub mod config;
pub mod filter;
pub mod manager;

pub use config::ClientConfig;
pub use filter::AddressFilter;
pub use manager::{Manager, ManagerOptions, ManagerStatus};

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::mux::{self, MuxConfig, MuxMode, MuxSession, MuxStream};
use crate::proto::{self, Hello, Status};
use crate::{DEFAULT_RECONNECT_DELAY, HANDSHAKE_TIMEOUT};

/// Jittered exponential backoff for reconnection.
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration) -> Self {
        Self {
            initial,
            max: Duration::from_secs(30),
            current: initial,
        }
    }

    /// Next delay: the current interval with ±10% jitter, doubling the
    /// interval up to the cap.
    fn next(&mut self) -> Duration {
        let jitter = 1.0 + (rand::thread_rng().gen::<f64>() - 0.5) * 0.2;
        let delay = self.current.mul_f64(jitter);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// RSK client: one control connection, one claimed port.
pub struct Client {
    /// Client configuration
    pub config: ClientConfig,
    /// Initial reconnection delay (grows exponentially up to 30 s)
    pub reconnect_delay: Duration,
}

impl Client {
    /// Create a client with the default reconnection delay.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    /// Dial the server and perform the HELLO handshake, upgrading to a
    /// multiplexed session on success.
    async fn connect(&self, mux_config: &MuxConfig) -> Result<MuxSession> {
        let mut conn = TcpStream::connect(&self.config.server_addr).await?;
        let _ = conn.set_nodelay(true);

        let hello = Hello {
            token: self.config.token.clone(),
            ports: vec![self.config.port],
            name: self.config.name.clone(),
        };

        match timeout(HANDSHAKE_TIMEOUT, proto::write_hello(&mut conn, &hello)).await {
            Ok(res) => res?,
            Err(_) => return Err(Error::Timeout(HANDSHAKE_TIMEOUT.as_millis() as u64)),
        }

        let resp = match timeout(HANDSHAKE_TIMEOUT, proto::read_hello_resp(&mut conn)).await {
            Ok(res) => res?,
            Err(_) => return Err(Error::Timeout(HANDSHAKE_TIMEOUT.as_millis() as u64)),
        };

        if resp.status != Status::Ok {
            return Err(Error::Rejected {
                status: resp.status,
                message: resp.message,
            });
        }

        tracing::info!(
            "connected to {}, accepted_ports={:?}",
            self.config.server_addr,
            resp.accepted_ports
        );

        if let Err(e) = mux::configure_control_socket(&conn, mux_config) {
            tracing::warn!("failed to set control socket options: {}", e);
        }
        Ok(MuxSession::new(conn, mux_config, MuxMode::Client))
    }

    /// Serve sub-streams until the session or `shutdown` ends.
    async fn serve_session(
        &self,
        session: &Arc<MuxSession>,
        filter: &Arc<AddressFilter>,
        shutdown: &CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    session.close();
                    session.closed().await;
                    return;
                }
                accepted = session.accept_stream() => {
                    let Some(stream) = accepted else { return };
                    let filter = Arc::clone(filter);
                    let dial_timeout = self.config.dial_timeout;
                    tokio::spawn(async move {
                        handle_stream(stream, dial_timeout, filter).await;
                    });
                }
            }
        }
    }

    /// Run the client until `shutdown` is canceled or a terminal handshake
    /// error occurs.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let filter = Arc::new(AddressFilter::new(
            self.config.allow_private_networks,
            &self.config.blocked_networks,
        )?);
        tracing::info!(
            "address filter initialized, allow_private={}, blocked_networks={}",
            self.config.allow_private_networks,
            self.config.blocked_networks.len()
        );

        let mux_config = MuxConfig::default();
        let mut backoff = Backoff::new(self.reconnect_delay);

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            tracing::info!("connecting to server {}", self.config.server_addr);
            let connect = tokio::select! {
                res = self.connect(&mux_config) => res,
                _ = shutdown.cancelled() => return Ok(()),
            };

            match connect {
                Ok(session) => {
                    backoff.reset();
                    let session = Arc::new(session);
                    tracing::info!("session established, serving streams");

                    self.serve_session(&session, &filter, &shutdown).await;
                    if shutdown.is_cancelled() {
                        return Ok(());
                    }
                    tracing::warn!("session closed, will reconnect");
                }
                Err(e) if e.is_terminal() => {
                    tracing::error!("handshake rejected, exiting: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!("connection failed, will retry: {}", e);
                }
            }

            let delay = backoff.next();
            tracing::info!("waiting {:?} before reconnecting", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return Ok(()),
            }
        }
    }
}

/// Serve one sub-stream: read the CONNECT_REQ, apply the filter, dial the
/// target, and bridge bytes until either direction finishes. Dropping both
/// halves closes both ends.
async fn handle_stream(stream: MuxStream, dial_timeout: Duration, filter: Arc<AddressFilter>) {
    let mut stream = stream;

    let addr = match timeout(HANDSHAKE_TIMEOUT, proto::read_connect_req(&mut stream)).await {
        Ok(Ok(addr)) => addr,
        Ok(Err(e)) => {
            tracing::warn!("failed to read CONNECT_REQ: {}", e);
            return;
        }
        Err(_) => {
            tracing::warn!("CONNECT_REQ read timed out");
            return;
        }
    };
    tracing::debug!("received CONNECT_REQ for {}", addr);

    if let Err(e) = filter.is_allowed(&addr).await {
        tracing::warn!("egress target {} refused: {}", addr, e);
        return;
    }

    let target = match timeout(dial_timeout, TcpStream::connect(addr.as_str())).await {
        Ok(Ok(target)) => target,
        Ok(Err(e)) => {
            tracing::warn!("failed to dial {}: {}", addr, e);
            return;
        }
        Err(_) => {
            tracing::warn!("dial to {} timed out", addr);
            return;
        }
    };
    tracing::debug!("connected to {}", addr);

    let (mut stream_rd, mut stream_wr) = tokio::io::split(stream);
    let (mut target_rd, mut target_wr) = target.into_split();

    tokio::select! {
        res = tokio::io::copy(&mut stream_rd, &mut target_wr) => {
            if let Err(e) = res {
                tracing::debug!("stream→target copy for {} ended: {}", addr, e);
            }
        }
        res = tokio::io::copy(&mut target_rd, &mut stream_wr) => {
            if let Err(e) = res {
                tracing::debug!("target→stream copy for {} ended: {}", addr, e);
            }
        }
    }

    tracing::debug!("connection to {} closed", addr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::HelloResp;
    use crate::server::{Server, ServerConfig};
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const TOKEN: &[u8] = b"0123456789abcdef0";

    fn client_config(server_addr: String, port: u16) -> ClientConfig {
        let mut config = ClientConfig::new(server_addr, TOKEN.to_vec(), port);
        config.name = "itest-exit".to_string();
        config
    }

    fn fast_client(config: ClientConfig) -> Client {
        let mut client = Client::new(config);
        client.reconnect_delay = Duration::from_millis(20);
        client
    }

    /// One-shot fake server answering every handshake with `status`.
    async fn fake_server(status: Status) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    if proto::read_hello(&mut conn).await.is_ok() {
                        let resp = HelloResp {
                            status,
                            accepted_ports: Vec::new(),
                            message: "test".to_string(),
                        };
                        let _ = proto::write_hello_resp(&mut conn, &resp).await;
                    }
                });
            }
        });
        addr
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn test_auth_fail_is_terminal() {
        let addr = fake_server(Status::AuthFail).await;
        let client = fast_client(client_config(addr.to_string(), 20001));

        let result = timeout(Duration::from_secs(5), client.run(CancellationToken::new()))
            .await
            .expect("client should exit promptly");

        match result {
            Err(Error::Rejected {
                status: Status::AuthFail,
                ..
            }) => {}
            other => panic!("expected terminal AUTH_FAIL, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_port_in_use_is_terminal() {
        let addr = fake_server(Status::PortInUse).await;
        let client = fast_client(client_config(addr.to_string(), 20001));

        let result = timeout(Duration::from_secs(5), client.run(CancellationToken::new()))
            .await
            .expect("client should exit promptly");

        match result {
            Err(Error::Rejected {
                status: Status::PortInUse,
                ..
            }) => {}
            other => panic!("expected terminal PORT_IN_USE, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transient_rejection_keeps_retrying() {
        let addr = fake_server(Status::ServerInternal).await;
        let client = fast_client(client_config(addr.to_string(), 20001));

        let shutdown = CancellationToken::new();
        let run = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { client.run(shutdown).await })
        };

        // Still retrying after several rejection cycles
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!run.is_finished());

        shutdown.cancel();
        let result = timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_blocklist_fails_fast() {
        let mut config = client_config("127.0.0.1:1".to_string(), 20001);
        config.blocked_networks = vec!["bogus".to_string()];
        let client = fast_client(config);

        match client.run(CancellationToken::new()).await {
            Err(Error::Config(_)) => {}
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_backoff_growth_and_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(100));

        let first = backoff.next();
        assert!(first >= Duration::from_millis(90) && first <= Duration::from_millis(110));

        let second = backoff.next();
        assert!(second >= Duration::from_millis(180) && second <= Duration::from_millis(220));

        backoff.reset();
        let after_reset = backoff.next();
        assert!(after_reset <= Duration::from_millis(110));
    }

    #[tokio::test]
    async fn test_backoff_caps_at_max() {
        let mut backoff = Backoff::new(Duration::from_secs(10));
        for _ in 0..10 {
            backoff.next();
        }
        assert!(backoff.next() <= Duration::from_secs(34));
    }

    /// Full stack: real server, real client, SOCKS5 CONNECT to a loopback
    /// target. The filter on the exit node refuses the dial, so the bridged
    /// connection closes right after the SOCKS reply.
    #[tokio::test]
    async fn test_end_to_end_filter_refuses_loopback() {
        let mut server_config = ServerConfig::new(TOKEN.to_vec());
        server_config.port_min = 1024;
        server_config.port_max = 65535;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let server_shutdown = CancellationToken::new();
        let server = Server::new(server_config);
        {
            let shutdown = server_shutdown.clone();
            tokio::spawn(async move { server.serve(listener, shutdown).await.unwrap() });
        }

        let port = free_port().await;
        let client = fast_client(client_config(server_addr.to_string(), port));
        let client_shutdown = CancellationToken::new();
        {
            let shutdown = client_shutdown.clone();
            tokio::spawn(async move { client.run(shutdown).await });
        }

        // Wait for the SOCKS listener to come up
        let mut socks = None;
        for _ in 0..100 {
            if let Ok(conn) = TcpStream::connect(("127.0.0.1", port)).await {
                socks = Some(conn);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let mut socks = socks.expect("SOCKS listener never came up");

        // SOCKS5 no-auth CONNECT to 127.0.0.1:9
        socks.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut greeting = [0u8; 2];
        socks.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0x00]);

        socks
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0, 9])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        socks.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);

        // The exit node refused the loopback target: the sub-stream closed,
        // so the bridged connection yields EOF (or reset)
        let mut buf = [0u8; 1];
        match timeout(Duration::from_secs(5), socks.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => {}
            other => panic!("expected closed bridge, got {other:?}"),
        }

        client_shutdown.cancel();
        server_shutdown.cancel();
    }
}
