//! Supervising wrapper around [`Client`].
//!
//! Embeds the client behind a start/stop/status API with optional
//! auto-restart. Terminal handshake rejections (wrong token, port already
//! claimed) and configuration errors stop the supervisor; anything else
//! restarts the client after a delay, up to an optional retry bound.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{Client, ClientConfig};
use crate::error::{Error, Result};

const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Options for starting a managed client.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Client configuration
    pub config: ClientConfig,
    /// Restart the client after non-terminal failures
    pub auto_restart: bool,
    /// Delay between restart attempts (zero means the 5 s default)
    pub restart_delay: Duration,
    /// Maximum restart attempts, 0 = unlimited
    pub max_restart_retries: u32,
}

impl ManagerOptions {
    /// Options with auto-restart disabled.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            auto_restart: false,
            restart_delay: DEFAULT_RESTART_DELAY,
            max_restart_retries: 0,
        }
    }
}

/// Point-in-time view of the managed client.
#[derive(Debug, Clone)]
pub struct ManagerStatus {
    /// Whether the client task is alive
    pub running: bool,
    /// The claimed port
    pub port: u16,
    /// Human-readable state description
    pub message: String,
    /// Time since the client was started (zero when stopped)
    pub uptime: Duration,
    /// Completed restarts
    pub restart_count: u32,
    /// Last error observed, if any
    pub last_error: Option<String>,
    /// Whether auto-restart is enabled
    pub auto_restart: bool,
    /// Whether a stop is in progress
    pub shutting_down: bool,
}

#[derive(Default)]
struct State {
    running: bool,
    shutting_down: bool,
    auto_restart: bool,
    port: u16,
    message: String,
    started_at: Option<Instant>,
    restart_count: u32,
    last_error: Option<String>,
    cancel: Option<CancellationToken>,
}

/// Manages a single client instance.
pub struct Manager {
    state: Arc<Mutex<State>>,
}

impl Manager {
    /// Create an idle manager.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Start the client. Returns the claimed port; if the client is already
    /// running, returns the current port without restarting.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(&self, opts: ManagerOptions) -> Result<u16> {
        opts.config.validate()?;

        let cancel = {
            let mut state = self.state.lock();
            if state.running {
                return Ok(state.port);
            }

            let cancel = CancellationToken::new();
            state.running = true;
            state.shutting_down = false;
            state.auto_restart = opts.auto_restart;
            state.port = opts.config.port;
            state.message = format!("started on port {}", opts.config.port);
            state.started_at = Some(Instant::now());
            state.restart_count = 0;
            state.last_error = None;
            state.cancel = Some(cancel.clone());
            cancel
        };

        tracing::info!(
            "starting managed client, server={}, port={}, auto_restart={}",
            opts.config.server_addr,
            opts.config.port,
            opts.auto_restart
        );

        let port = opts.config.port;
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            supervise(state, opts, cancel).await;
        });

        Ok(port)
    }

    /// Request a stop. Returns immediately; the client task winds down in
    /// the background.
    pub fn stop(&self) {
        let cancel = {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.shutting_down = true;
            state.message = "stopping".to_string();
            state.cancel.take()
        };

        if let Some(cancel) = cancel {
            tracing::info!("stopping managed client");
            cancel.cancel();
        }
    }

    /// Stop and wait until the client task has exited.
    pub async fn stop_and_wait(&self, timeout: Duration) -> Result<()> {
        self.stop();

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.is_running() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        Err(Error::Timeout(timeout.as_millis() as u64))
    }

    /// Snapshot the current status.
    pub fn status(&self) -> ManagerStatus {
        let state = self.state.lock();
        ManagerStatus {
            running: state.running,
            port: state.port,
            message: state.message.clone(),
            uptime: match (state.running, state.started_at) {
                (true, Some(started_at)) => started_at.elapsed(),
                _ => Duration::ZERO,
            },
            restart_count: state.restart_count,
            last_error: state.last_error.clone(),
            auto_restart: state.auto_restart,
            shutting_down: state.shutting_down,
        }
    }

    /// True while the client task is alive.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

fn finish(state: &Mutex<State>, message: String) {
    let mut state = state.lock();
    state.running = false;
    state.shutting_down = false;
    state.message = message;
    state.cancel = None;
}

async fn supervise(state: Arc<Mutex<State>>, opts: ManagerOptions, cancel: CancellationToken) {
    let restart_delay = if opts.restart_delay.is_zero() {
        DEFAULT_RESTART_DELAY
    } else {
        opts.restart_delay
    };
    let mut attempt: u32 = 0;

    loop {
        let client = Client::new(opts.config.clone());
        let result = client.run(cancel.clone()).await;

        if cancel.is_cancelled() {
            tracing::info!("managed client stopped");
            finish(&state, "stopped".to_string());
            return;
        }

        let err = match result {
            Ok(()) => {
                finish(&state, "stopped".to_string());
                return;
            }
            Err(err) => err,
        };

        tracing::error!("managed client stopped with error: {}", err);
        state.lock().last_error = Some(err.to_string());

        let restartable =
            opts.auto_restart && !err.is_terminal() && !matches!(err, Error::Config(_));
        if !restartable {
            finish(&state, format!("error: {}", err));
            return;
        }

        attempt += 1;
        if opts.max_restart_retries > 0 && attempt >= opts.max_restart_retries {
            tracing::warn!("max restart retries ({}) reached", opts.max_restart_retries);
            finish(
                &state,
                format!("max restart retries ({}) reached", opts.max_restart_retries),
            );
            return;
        }

        {
            let mut state = state.lock();
            state.restart_count += 1;
            state.message = format!("restarting after error: {}", err);
        }
        tracing::info!("restarting managed client in {:?}", restart_delay);

        tokio::select! {
            _ = tokio::time::sleep(restart_delay) => {}
            _ = cancel.cancelled() => {
                finish(&state, "stopped".to_string());
                return;
            }
        }
    }
}
