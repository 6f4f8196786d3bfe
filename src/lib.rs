//! # RSK: Reverse SOCKS5 Proxy
//!
//! A central server exposes SOCKS5 listeners on local ports; remote clients
//! ("exit nodes") connect outbound to the server over a single TCP control
//! channel and act as egress dialers on its behalf.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐   SOCKS5    ┌─────────────────────────────┐
//! │ Application  │────────────▶│ Server                      │
//! └──────────────┘  :20001     │  ┌────────┐  ┌───────────┐  │
//!                              │  │ SOCKS  │  │ Port      │  │
//!                              │  │ manager│──│ registry  │  │
//!                              │  └───┬────┘  └───────────┘  │
//!                              └──────┼──────────────────────┘
//!                                     │ sub-stream (CONNECT_REQ + bytes)
//!                                     │ over one multiplexed TCP channel
//!                              ┌──────┼──────────────────────┐
//!                              │ Client (exit node)          │
//!                              │  address filter → dial      │──▶ target
//!                              └─────────────────────────────┘
//! ```
//!
//! The control channel is established by the client: it dials the server,
//! performs the HELLO handshake (token authentication plus port claims), and
//! then serves sub-streams opened by the server for each inbound SOCKS5
//! CONNECT. Encryption of the control channel is out of scope; run it inside
//! an outer tunnel if the path is untrusted.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

use std::time::Duration;

pub mod auth;
pub mod client;
pub mod error;
pub mod mux;
pub mod proto;
pub mod server;

pub use error::{Error, Result};

/// Timeout applied to every handshake read and write (HELLO, HELLO_RESP,
/// CONNECT_REQ). Data-plane traffic carries no timeout.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for dialing egress targets on the client.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Initial delay between client reconnection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);
