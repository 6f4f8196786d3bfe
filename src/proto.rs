//! Wire codec for the RSK control protocol.
//!
//! Three messages, all integers big-endian, all variable fields
//! length-prefixed with strict bounds:
//!
//! ```text
//! HELLO        "RSK1" | ver(1) | tlen(1) | token(tlen) | pcnt(1) |
//!              ports(pcnt*2) | nlen(1) | name(nlen)
//! HELLO_RESP   ver(1) | status(1) | acnt(1) | ports(acnt*2) | mlen(1) | msg(mlen)
//! CONNECT_REQ  alen(2) | addr(alen)
//! ```
//!
//! Writers validate every bound before emitting a single byte, so a peer
//! never observes a partial message. Readers reject out-of-bounds lengths,
//! wrong magic, and wrong version with distinct typed errors. For every
//! accepted value, read-after-write is the identity.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Magic bytes opening every HELLO message.
pub const MAGIC: [u8; 4] = *b"RSK1";

/// Protocol version identifier.
pub const VERSION: u8 = 0x01;

/// Token length bounds (bytes).
pub const MIN_TOKEN_LEN: usize = 1;
pub const MAX_TOKEN_LEN: usize = 255;

/// Port claim count bounds per HELLO.
pub const MIN_PORT_COUNT: usize = 1;
pub const MAX_PORT_COUNT: usize = 16;

/// Maximum client name length (bytes).
pub const MAX_NAME_LEN: usize = 64;

/// Maximum serialized HELLO size (bytes).
pub const MAX_HELLO_SIZE: usize = 2048;

/// Maximum HELLO_RESP message text length (bytes).
pub const MAX_MESSAGE_LEN: usize = 255;

/// Target address length bounds for CONNECT_REQ (bytes).
pub const MIN_ADDR_LEN: usize = 1;
pub const MAX_ADDR_LEN: usize = 1024;

/// HELLO_RESP status codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Handshake accepted, ports bound
    Ok = 0x00,
    /// Token mismatch
    AuthFail = 0x01,
    /// Malformed HELLO
    BadRequest = 0x02,
    /// Requested port outside the allowed range
    PortForbidden = 0x03,
    /// Requested port already claimed or unbindable
    PortInUse = 0x04,
    /// Internal server failure
    ServerInternal = 0x05,
}

impl Status {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x00 => Ok(Self::Ok),
            0x01 => Ok(Self::AuthFail),
            0x02 => Ok(Self::BadRequest),
            0x03 => Ok(Self::PortForbidden),
            0x04 => Ok(Self::PortInUse),
            0x05 => Ok(Self::ServerInternal),
            other => Err(Error::InvalidStatus(other)),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::AuthFail => "AUTH_FAIL",
            Status::BadRequest => "BAD_REQUEST",
            Status::PortForbidden => "PORT_FORBIDDEN",
            Status::PortInUse => "PORT_IN_USE",
            Status::ServerInternal => "SERVER_INTERNAL",
        };
        f.write_str(name)
    }
}

/// The HELLO handshake request.
///
/// Magic and version are implicit: writers emit the crate constants and
/// readers verify them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Authentication token (1-255 bytes)
    pub token: Vec<u8>,
    /// Ports to claim (1-16 entries, each non-zero)
    pub ports: Vec<u16>,
    /// Client name (0-64 bytes of UTF-8)
    pub name: String,
}

/// The HELLO_RESP handshake reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloResp {
    /// Outcome of the handshake
    pub status: Status,
    /// Ports the server bound for this client (0-16 entries)
    pub accepted_ports: Vec<u16>,
    /// Human-readable status detail (0-255 bytes of UTF-8)
    pub message: String,
}

fn check_hello(hello: &Hello) -> Result<()> {
    if hello.token.len() < MIN_TOKEN_LEN || hello.token.len() > MAX_TOKEN_LEN {
        return Err(Error::InvalidTokenLen(hello.token.len()));
    }
    if hello.ports.len() < MIN_PORT_COUNT || hello.ports.len() > MAX_PORT_COUNT {
        return Err(Error::InvalidPortCount(hello.ports.len()));
    }
    if hello.ports.contains(&0) {
        return Err(Error::InvalidPortValue);
    }
    if hello.name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidNameLen(hello.name.len()));
    }

    let total = 4 + 1 + 1 + hello.token.len() + 1 + hello.ports.len() * 2 + 1 + hello.name.len();
    if total > MAX_HELLO_SIZE {
        return Err(Error::MessageTooLarge {
            size: total,
            max: MAX_HELLO_SIZE,
        });
    }
    Ok(())
}

/// Encode and write a HELLO message.
pub async fn write_hello<W>(w: &mut W, hello: &Hello) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    check_hello(hello)?;

    let mut buf = Vec::with_capacity(
        4 + 1 + 1 + hello.token.len() + 1 + hello.ports.len() * 2 + 1 + hello.name.len(),
    );
    buf.extend_from_slice(&MAGIC);
    buf.push(VERSION);
    buf.push(hello.token.len() as u8);
    buf.extend_from_slice(&hello.token);
    buf.push(hello.ports.len() as u8);
    for port in &hello.ports {
        buf.extend_from_slice(&port.to_be_bytes());
    }
    buf.push(hello.name.len() as u8);
    buf.extend_from_slice(hello.name.as_bytes());

    w.write_all(&buf).await?;
    Ok(())
}

/// Read and decode a HELLO message.
pub async fn read_hello<R>(r: &mut R) -> Result<Hello>
where
    R: AsyncRead + Unpin,
{
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).await?;
    if magic != MAGIC {
        return Err(Error::InvalidMagic);
    }

    let version = r.read_u8().await?;
    if version != VERSION {
        return Err(Error::VersionMismatch {
            expected: VERSION,
            actual: version,
        });
    }

    let token_len = r.read_u8().await? as usize;
    if !(MIN_TOKEN_LEN..=MAX_TOKEN_LEN).contains(&token_len) {
        return Err(Error::InvalidTokenLen(token_len));
    }
    let mut token = vec![0u8; token_len];
    r.read_exact(&mut token).await?;

    let port_count = r.read_u8().await? as usize;
    if !(MIN_PORT_COUNT..=MAX_PORT_COUNT).contains(&port_count) {
        return Err(Error::InvalidPortCount(port_count));
    }
    let mut ports = Vec::with_capacity(port_count);
    for _ in 0..port_count {
        let port = r.read_u16().await?;
        if port == 0 {
            return Err(Error::InvalidPortValue);
        }
        ports.push(port);
    }

    let name_len = r.read_u8().await? as usize;
    if name_len > MAX_NAME_LEN {
        return Err(Error::InvalidNameLen(name_len));
    }
    let mut name_bytes = vec![0u8; name_len];
    r.read_exact(&mut name_bytes).await?;
    let name = String::from_utf8(name_bytes).map_err(|_| Error::InvalidUtf8("name"))?;

    Ok(Hello { token, ports, name })
}

fn check_hello_resp(resp: &HelloResp) -> Result<()> {
    if resp.accepted_ports.len() > MAX_PORT_COUNT {
        return Err(Error::InvalidAcceptedPortCount(resp.accepted_ports.len()));
    }
    if resp.accepted_ports.contains(&0) {
        return Err(Error::InvalidPortValue);
    }
    if resp.message.len() > MAX_MESSAGE_LEN {
        return Err(Error::InvalidMessageLen(resp.message.len()));
    }
    Ok(())
}

/// Encode and write a HELLO_RESP message.
pub async fn write_hello_resp<W>(w: &mut W, resp: &HelloResp) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    check_hello_resp(resp)?;

    let mut buf =
        Vec::with_capacity(1 + 1 + 1 + resp.accepted_ports.len() * 2 + 1 + resp.message.len());
    buf.push(VERSION);
    buf.push(resp.status as u8);
    buf.push(resp.accepted_ports.len() as u8);
    for port in &resp.accepted_ports {
        buf.extend_from_slice(&port.to_be_bytes());
    }
    buf.push(resp.message.len() as u8);
    buf.extend_from_slice(resp.message.as_bytes());

    w.write_all(&buf).await?;
    Ok(())
}

/// Read and decode a HELLO_RESP message.
pub async fn read_hello_resp<R>(r: &mut R) -> Result<HelloResp>
where
    R: AsyncRead + Unpin,
{
    let version = r.read_u8().await?;
    if version != VERSION {
        return Err(Error::VersionMismatch {
            expected: VERSION,
            actual: version,
        });
    }

    let status = Status::from_u8(r.read_u8().await?)?;

    let count = r.read_u8().await? as usize;
    if count > MAX_PORT_COUNT {
        return Err(Error::InvalidAcceptedPortCount(count));
    }
    let mut accepted_ports = Vec::with_capacity(count);
    for _ in 0..count {
        let port = r.read_u16().await?;
        if port == 0 {
            return Err(Error::InvalidPortValue);
        }
        accepted_ports.push(port);
    }

    let msg_len = r.read_u8().await? as usize;
    if msg_len > MAX_MESSAGE_LEN {
        return Err(Error::InvalidMessageLen(msg_len));
    }
    let mut msg_bytes = vec![0u8; msg_len];
    r.read_exact(&mut msg_bytes).await?;
    let message = String::from_utf8(msg_bytes).map_err(|_| Error::InvalidUtf8("message"))?;

    Ok(HelloResp {
        status,
        accepted_ports,
        message,
    })
}

/// Encode and write a CONNECT_REQ message.
///
/// `addr` is the target in `host:port` form, IPv6 hosts bracketed.
pub async fn write_connect_req<W>(w: &mut W, addr: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if addr.len() < MIN_ADDR_LEN || addr.len() > MAX_ADDR_LEN {
        return Err(Error::InvalidAddrLen(addr.len()));
    }

    let mut buf = Vec::with_capacity(2 + addr.len());
    buf.extend_from_slice(&(addr.len() as u16).to_be_bytes());
    buf.extend_from_slice(addr.as_bytes());

    w.write_all(&buf).await?;
    Ok(())
}

/// Read and decode a CONNECT_REQ message, returning the target address.
pub async fn read_connect_req<R>(r: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let addr_len = r.read_u16().await? as usize;
    if !(MIN_ADDR_LEN..=MAX_ADDR_LEN).contains(&addr_len) {
        return Err(Error::InvalidAddrLen(addr_len));
    }

    let mut addr_bytes = vec![0u8; addr_len];
    r.read_exact(&mut addr_bytes).await?;

    String::from_utf8(addr_bytes).map_err(|_| Error::InvalidUtf8("address"))
}
