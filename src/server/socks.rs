//! Per-port SOCKS5 acceptors.
//!
//! Every bound port runs a SOCKS5 server on `bind_ip:port` whose "dialer" is
//! the client's multiplexed session: a CONNECT request opens a sub-stream,
//! writes a CONNECT_REQ naming the target, and bridges bytes between the
//! local application and the sub-stream. Only CONNECT is served; BIND and
//! UDP ASSOCIATE are answered with `CommandNotSupported`.

use std::net::IpAddr;
use std::sync::Arc;

use socks5_proto::{Address, Reply};
use socks5_server::{auth::NoAuth, Connection, IncomingConnection, Server};
use tokio_util::sync::CancellationToken;

use super::registry::Registry;
use crate::mux::MuxSession;
use crate::{proto, HANDSHAKE_TIMEOUT};

/// Handle to a running SOCKS5 acceptor. Held by the port's registry slot;
/// shutting it down stops the accept loop and closes the listener.
pub struct SocksHandle {
    port: u16,
    cancel: CancellationToken,
}

impl SocksHandle {
    pub(crate) fn new(port: u16, cancel: CancellationToken) -> Self {
        Self { port, cancel }
    }

    /// Stop the acceptor. Idempotent; in-flight bridged connections keep
    /// running until their streams end.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        tracing::info!("SOCKS5 listener stopped on port {}", self.port);
    }
}

impl Drop for SocksHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Starts and supervises the SOCKS5 acceptors for bound ports.
pub struct SocksManager {
    registry: Arc<Registry>,
}

impl SocksManager {
    /// Create a manager backed by the shared port registry.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Bind a SOCKS5 listener on `bind_ip:port` serving CONNECT requests
    /// through `session`.
    pub async fn start_listener(
        &self,
        port: u16,
        bind_ip: IpAddr,
        session: Arc<MuxSession>,
    ) -> crate::Result<SocksHandle> {
        let server = Server::bind((bind_ip, port), Arc::new(NoAuth)).await?;

        let cancel = CancellationToken::new();
        let accept_cancel = cancel.clone();
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            tracing::info!("SOCKS5 listener started on {}:{}", bind_ip, port);
            loop {
                tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = server.accept() => match accepted {
                        Ok((conn, peer)) => {
                            tracing::debug!("SOCKS5 connection from {} on port {}", peer, port);
                            let registry = Arc::clone(&registry);
                            let session = Arc::clone(&session);
                            tokio::spawn(async move {
                                if let Err(e) = handle_socks_connection(conn, port, registry, session).await {
                                    tracing::debug!("SOCKS5 connection on port {} ended: {}", port, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!("SOCKS5 accept error on port {}: {}", port, e);
                        }
                    }
                }
            }
        });

        Ok(SocksHandle::new(port, cancel))
    }
}

/// Decrements the port's connection counter when dropped. Created only
/// after a successful increment, so each admission is returned exactly once
/// no matter which path closes the bridged connection.
struct ConnGuard {
    registry: Arc<Registry>,
    port: u16,
}

impl ConnGuard {
    fn new(registry: Arc<Registry>, port: u16) -> Self {
        Self { registry, port }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.registry.decrement_connections(self.port);
        tracing::debug!(
            "connection closed on port {}, {} remaining",
            self.port,
            self.registry.connection_count(self.port)
        );
    }
}

/// Render a SOCKS5 target as the `host:port` form CONNECT_REQ carries.
/// IPv6 socket addresses come out bracketed.
fn format_target(addr: &Address) -> String {
    match addr {
        Address::SocketAddress(sa) => sa.to_string(),
        Address::DomainAddress(domain, port) => format!("{}:{}", domain, port),
    }
}

async fn handle_socks_connection(
    conn: IncomingConnection,
    port: u16,
    registry: Arc<Registry>,
    session: Arc<MuxSession>,
) -> std::io::Result<()> {
    match conn.handshake().await? {
        Connection::Associate(associate, _) => {
            associate
                .reply(Reply::CommandNotSupported, Address::unspecified())
                .await?;
        }
        Connection::Bind(bind, _) => {
            bind.reply(Reply::CommandNotSupported, Address::unspecified())
                .await?;
        }
        Connection::Connect(connect, addr) => {
            let target = format_target(&addr);

            if !registry.increment_connections(port) {
                tracing::warn!(
                    "connection limit reached on port {} ({} active)",
                    port,
                    registry.connection_count(port)
                );
                let mut conn = connect
                    .reply(Reply::ConnectionRefused, Address::unspecified())
                    .await?;
                let _ = conn.shutdown().await;
                return Ok(());
            }
            let _guard = ConnGuard::new(Arc::clone(&registry), port);

            let mut stream = match session.open_stream().await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("failed to open sub-stream for {}: {}", target, e);
                    let mut conn = connect
                        .reply(Reply::GeneralFailure, Address::unspecified())
                        .await?;
                    let _ = conn.shutdown().await;
                    return Ok(());
                }
            };

            let write = tokio::time::timeout(
                HANDSHAKE_TIMEOUT,
                proto::write_connect_req(&mut stream, &target),
            )
            .await;
            match write {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!("failed to write CONNECT_REQ for {}: {}", target, e);
                    let mut conn = connect
                        .reply(Reply::GeneralFailure, Address::unspecified())
                        .await?;
                    let _ = conn.shutdown().await;
                    return Ok(());
                }
                Err(_) => {
                    tracing::warn!("CONNECT_REQ write timed out for {}", target);
                    let mut conn = connect
                        .reply(Reply::TtlExpired, Address::unspecified())
                        .await?;
                    let _ = conn.shutdown().await;
                    return Ok(());
                }
            }

            let mut conn = connect
                .reply(Reply::Succeeded, Address::unspecified())
                .await?;

            let _ = tokio::io::copy_bidirectional(&mut conn, &mut stream).await;
        }
    }

    Ok(())
}
