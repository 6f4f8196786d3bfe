//! Client configuration.

use std::time::Duration;

use ipnet::IpNet;

use crate::auth;
use crate::error::{Error, Result};
use crate::DEFAULT_DIAL_TIMEOUT;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server control-channel address (`host:port`)
    pub server_addr: String,
    /// Shared authentication token
    pub token: Vec<u8>,
    /// Port to claim on the server
    pub port: u16,
    /// Client name reported in the HELLO message
    pub name: String,
    /// Timeout for dialing egress targets
    pub dial_timeout: Duration,
    /// Allow egress to RFC 1918 / ULA ranges
    pub allow_private_networks: bool,
    /// Additional CIDR blocks to refuse
    pub blocked_networks: Vec<String>,
}

impl ClientConfig {
    /// Create a configuration with default timeouts and filtering.
    pub fn new(server_addr: impl Into<String>, token: impl Into<Vec<u8>>, port: u16) -> Self {
        Self {
            server_addr: server_addr.into(),
            token: token.into(),
            port,
            name: String::new(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            allow_private_networks: false,
            blocked_networks: Vec::new(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.server_addr.is_empty() {
            return Err(Error::config("server address cannot be empty"));
        }
        auth::validate_token(&self.token)?;
        if self.port == 0 {
            return Err(Error::config("port must be 1-65535"));
        }
        if self.dial_timeout.is_zero() {
            return Err(Error::config("dial timeout must be non-zero"));
        }
        validate_cidrs(&self.blocked_networks)?;
        Ok(())
    }
}

/// Check that every entry parses as a CIDR block.
pub fn validate_cidrs(cidrs: &[String]) -> Result<()> {
    for cidr in cidrs {
        cidr.parse::<IpNet>()
            .map_err(|e| Error::Config(format!("invalid CIDR block {:?}: {}", cidr, e)))?;
    }
    Ok(())
}

/// Split a comma-separated list into trimmed, non-empty entries.
pub fn parse_comma_separated(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}
