//! Stream multiplexing over the control connection.
//!
//! Wraps a [`yamux`] connection behind a task-friendly handle. yamux 0.13
//! exposes a poll-based [`yamux::Connection`] that must be driven from a
//! single place, so [`MuxSession`] spawns one driver task per session and
//! talks to it over channels: outbound opens are submitted as requests,
//! inbound sub-streams are delivered on a bounded queue, and session
//! termination is observable as a cancellation token.
//!
//! Sub-streams are exposed with tokio I/O traits via `tokio_util::compat`,
//! so they plug directly into `copy_bidirectional` and the codec in
//! [`crate::proto`].

use std::collections::VecDeque;
use std::future::{poll_fn, Future};
use std::task::Poll;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use yamux::{Connection, Mode};

use crate::error::{Error, Result};

/// A sub-stream of a multiplexed session, tokio-flavored.
pub type MuxStream = Compat<yamux::Stream>;

type OpenRequest = oneshot::Sender<Result<MuxStream>>;

/// Inbound sub-streams queued between the driver and `accept_stream`.
const INBOUND_BACKLOG: usize = 64;

/// Session role. Stream ids are partitioned by role, so both endpoints must
/// agree on who is the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxMode {
    /// Initiated the control connection (the exit node)
    Client,
    /// Accepted the control connection
    Server,
}

impl From<MuxMode> for Mode {
    fn from(mode: MuxMode) -> Self {
        match mode {
            MuxMode::Client => Mode::Client,
            MuxMode::Server => Mode::Server,
        }
    }
}

/// Multiplexer tuning knobs.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Maximum concurrent sub-streams per session
    pub max_streams: usize,
    /// TCP keepalive probe interval on the control connection
    pub keepalive_interval: Duration,
    /// Upper bound on unacknowledged control-connection writes
    /// (TCP_USER_TIMEOUT where the platform supports it)
    pub write_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_streams: 256,
            keepalive_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Apply keepalive and write-timeout options to a control connection.
///
/// yamux itself answers peer pings but never initiates them, so dead-peer
/// detection rides on the TCP socket.
pub fn configure_control_socket(stream: &TcpStream, config: &MuxConfig) -> Result<()> {
    let sock = socket2::SockRef::from(stream);

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(config.keepalive_interval)
        .with_interval(config.keepalive_interval);
    sock.set_tcp_keepalive(&keepalive)?;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    sock.set_tcp_user_timeout(Some(config.write_timeout))?;

    Ok(())
}

/// Handle to a multiplexed session.
///
/// Cloning is not needed: the handle is cheap to share behind an `Arc`, and
/// every method takes `&self`. Dropping the handle asks the driver to close
/// the session.
pub struct MuxSession {
    open_tx: mpsc::UnboundedSender<OpenRequest>,
    inbound: Mutex<mpsc::Receiver<MuxStream>>,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

impl MuxSession {
    /// Upgrade a transport into a multiplexed session.
    ///
    /// Spawns the driver task; must be called within a tokio runtime.
    pub fn new<T>(io: T, config: &MuxConfig, mode: MuxMode) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut cfg = yamux::Config::default();
        cfg.set_max_num_streams(config.max_streams);

        let connection = Connection::new(io.compat(), cfg, mode.into());

        let (open_tx, open_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BACKLOG);
        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();

        tokio::spawn(drive(
            connection,
            open_rx,
            inbound_tx,
            shutdown.clone(),
            closed.clone(),
        ));

        Self {
            open_tx,
            inbound: Mutex::new(inbound_rx),
            shutdown,
            closed,
        }
    }

    /// Open a new outbound sub-stream.
    pub async fn open_stream(&self) -> Result<MuxStream> {
        let (tx, rx) = oneshot::channel();
        self.open_tx.send(tx).map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    /// Accept the next inbound sub-stream, or `None` once the session is
    /// closed.
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        self.inbound.lock().await.recv().await
    }

    /// Request a graceful close. Idempotent; completion is observable via
    /// [`MuxSession::closed`].
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Wait until the session has terminated, whether by local close, peer
    /// close, or transport failure.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// True once the session has terminated.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Drive the yamux connection until it terminates.
///
/// Single owner of the `Connection`: satisfies open requests, forwards
/// inbound streams, and services the connection's internal I/O. A close
/// request switches the loop into `poll_close` until the peer acknowledges
/// or the transport dies.
async fn drive<T>(
    mut connection: Connection<Compat<T>>,
    mut open_rx: mpsc::UnboundedReceiver<OpenRequest>,
    inbound_tx: mpsc::Sender<MuxStream>,
    shutdown: CancellationToken,
    closed: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut pending_opens: VecDeque<OpenRequest> = VecDeque::new();
    let mut shutdown_fut = Box::pin(shutdown.cancelled_owned());
    let mut closing = false;

    let result = poll_fn(|cx| {
        if !closing && shutdown_fut.as_mut().poll(cx).is_ready() {
            closing = true;
        }
        if closing {
            return connection.poll_close(cx);
        }

        loop {
            // Queue newly submitted open requests
            loop {
                match open_rx.poll_recv(cx) {
                    Poll::Ready(Some(req)) => pending_opens.push_back(req),
                    Poll::Ready(None) | Poll::Pending => break,
                }
            }

            // Satisfy opens while the connection has credit
            while !pending_opens.is_empty() {
                match connection.poll_new_outbound(cx) {
                    Poll::Ready(Ok(stream)) => {
                        if let Some(req) = pending_opens.pop_front() {
                            let _ = req.send(Ok(stream.compat()));
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => break,
                }
            }

            // Drive the connection; this also flushes outbound frames
            match connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    if inbound_tx.try_send(stream.compat()).is_err() {
                        tracing::debug!("inbound backlog full, dropping sub-stream");
                    }
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;

    match result {
        Ok(()) => tracing::debug!("mux session closed"),
        Err(e) => tracing::debug!("mux session terminated: {}", e),
    }

    closed.cancel();

    // Fail opens that never made it onto the wire
    open_rx.close();
    while let Ok(req) = open_rx.try_recv() {
        pending_opens.push_back(req);
    }
    for req in pending_opens {
        let _ = req.send(Err(Error::SessionClosed));
    }
}
