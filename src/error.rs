//! Error types for the RSK protocol.

use thiserror::Error;

use crate::proto::Status;

/// Result type alias for RSK operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during RSK operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Handshake message carried wrong magic bytes
    #[error("invalid magic bytes")]
    InvalidMagic,

    /// Protocol version mismatch
    #[error("protocol version mismatch: expected {expected:#04x}, got {actual:#04x}")]
    VersionMismatch { expected: u8, actual: u8 },

    /// Token length outside 1-255 bytes
    #[error("token length must be 1-255 bytes, got {0}")]
    InvalidTokenLen(usize),

    /// Port count outside 1-16
    #[error("port count must be 1-16, got {0}")]
    InvalidPortCount(usize),

    /// Port value zero is not a valid claimable port
    #[error("port value must be 1-65535")]
    InvalidPortValue,

    /// Client name longer than 64 bytes
    #[error("name length must be 0-64 bytes, got {0}")]
    InvalidNameLen(usize),

    /// Accepted port count above 16
    #[error("accepted port count must be 0-16, got {0}")]
    InvalidAcceptedPortCount(usize),

    /// Response message longer than 255 bytes
    #[error("message length must be 0-255 bytes, got {0}")]
    InvalidMessageLen(usize),

    /// Target address length outside 1-1024 bytes
    #[error("address length must be 1-1024 bytes, got {0}")]
    InvalidAddrLen(usize),

    /// Unknown HELLO_RESP status byte
    #[error("unknown status code {0:#04x}")]
    InvalidStatus(u8),

    /// Serialized message exceeds the protocol size cap
    #[error("message size {size} exceeds maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// A length-prefixed string field was not valid UTF-8
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    /// Server rejected the handshake. `AUTH_FAIL` and `PORT_IN_USE` are
    /// terminal for the client: reconnecting cannot succeed.
    #[error("server rejected handshake: {status}: {message}")]
    Rejected { status: Status, message: String },

    /// Port already present in the registry
    #[error("port {0} already in use")]
    PortInUse(u16),

    /// Bind attempted against a port that was never reserved
    #[error("port {0} not reserved")]
    PortNotReserved(u16),

    /// The multiplexed session is gone
    #[error("session closed")]
    SessionClosed,

    /// Egress target refused by the client-side address filter
    #[error("address blocked: {0}")]
    AddressBlocked(String),

    /// Connection timeout
    #[error("connection timeout after {0}ms")]
    Timeout(u64),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Stream multiplexer error
    #[error("multiplexer error: {0}")]
    Mux(#[from] yamux::ConnectionError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// True for handshake rejections that must not be retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Rejected {
                status: Status::AuthFail | Status::PortInUse,
                ..
            }
        )
    }
}
