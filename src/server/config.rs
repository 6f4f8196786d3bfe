//! Server configuration.

use std::net::IpAddr;
use std::time::Duration;

use crate::auth;
use crate::error::{Error, Result};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the control-channel listener binds (`host:port`)
    pub listen_addr: String,
    /// Shared authentication token
    pub token: Vec<u8>,
    /// IP the per-port SOCKS5 listeners bind
    pub bind_ip: IpAddr,
    /// Lowest claimable port
    pub port_min: u16,
    /// Highest claimable port
    pub port_max: u16,
    /// Maximum concurrent control connections
    pub max_clients: usize,
    /// Auth failures before a source IP is blocked
    pub max_auth_failures: u32,
    /// How long a blocked IP stays blocked
    pub auth_block_duration: Duration,
    /// SOCKS5 connection cap per client
    pub max_conns_per_client: u32,
}

impl ServerConfig {
    /// Create a configuration with the documented defaults for everything
    /// but the token.
    pub fn new(token: impl Into<Vec<u8>>) -> Self {
        Self {
            listen_addr: "0.0.0.0:7000".to_string(),
            token: token.into(),
            bind_ip: IpAddr::from([127, 0, 0, 1]),
            port_min: 20000,
            port_max: 40000,
            max_clients: 100,
            max_auth_failures: 5,
            auth_block_duration: Duration::from_secs(5 * 60),
            max_conns_per_client: 100,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(Error::config("listen address cannot be empty"));
        }
        auth::validate_token(&self.token)?;
        if self.port_min == 0 {
            return Err(Error::config("port range minimum must be at least 1"));
        }
        if self.port_min > self.port_max {
            return Err(Error::config(format!(
                "invalid port range {}-{}: minimum exceeds maximum",
                self.port_min, self.port_max
            )));
        }
        if self.max_clients == 0 {
            return Err(Error::config("max clients must be at least 1"));
        }
        if self.max_auth_failures == 0 {
            return Err(Error::config("max auth failures must be at least 1"));
        }
        if self.auth_block_duration.is_zero() {
            return Err(Error::config("auth block duration must be non-zero"));
        }
        if self.max_conns_per_client == 0 {
            return Err(Error::config("max connections per client must be at least 1"));
        }
        Ok(())
    }
}

/// Parse a `min-max` port range.
pub fn parse_port_range(range: &str) -> Result<(u16, u16)> {
    let (min, max) = range
        .split_once('-')
        .ok_or_else(|| Error::config("invalid port-range format, expected min-max"))?;

    let port_min: u16 = min
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("invalid port-range minimum {:?}", min.trim())))?;
    let port_max: u16 = max
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("invalid port-range maximum {:?}", max.trim())))?;

    Ok((port_min, port_max))
}

/// Expand a Go-style `:port` listen address to `0.0.0.0:port`.
pub fn normalize_listen_addr(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => addr.to_string(),
    }
}
