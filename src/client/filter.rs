//! Egress address filtering.
//!
//! The exit node refuses to dial targets the operator has not opened up:
//! loopback and link-local are always blocked, private ranges are blocked
//! unless explicitly allowed, and custom CIDR blocks are blocked
//! unconditionally. Hostnames are resolved first and judged by their first
//! resolved address.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::{Error, Result};

const LOOPBACK_NETS: [&str; 2] = ["127.0.0.0/8", "::1/128"];
const LINK_LOCAL_NETS: [&str; 2] = ["169.254.0.0/16", "fe80::/10"];
const PRIVATE_NETS: [&str; 4] = [
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "fc00::/7",
];

fn parse_nets(cidrs: &[&str]) -> Vec<IpNet> {
    // The built-in lists are well-formed by construction
    cidrs.iter().filter_map(|c| c.parse().ok()).collect()
}

/// Immutable egress policy for one client.
pub struct AddressFilter {
    allow_private: bool,
    loopback: Vec<IpNet>,
    link_local: Vec<IpNet>,
    private: Vec<IpNet>,
    blocked: Vec<IpNet>,
}

impl AddressFilter {
    /// Build a filter. `blocked_cidrs` are operator-supplied networks
    /// blocked in addition to the defaults; any malformed entry fails
    /// construction.
    pub fn new(allow_private: bool, blocked_cidrs: &[String]) -> Result<Self> {
        let mut blocked = Vec::with_capacity(blocked_cidrs.len());
        for cidr in blocked_cidrs {
            let net = cidr
                .parse::<IpNet>()
                .map_err(|e| Error::Config(format!("invalid CIDR block {:?}: {}", cidr, e)))?;
            blocked.push(net);
        }

        Ok(Self {
            allow_private,
            loopback: parse_nets(&LOOPBACK_NETS),
            link_local: parse_nets(&LINK_LOCAL_NETS),
            private: parse_nets(&PRIVATE_NETS),
            blocked,
        })
    }

    /// Check whether `addr` (`host:port`) may be dialed.
    ///
    /// Returns an error naming the blocking category; `Ok(())` means the
    /// dial may proceed.
    pub async fn is_allowed(&self, addr: &str) -> Result<()> {
        let (host, port) = split_host_port(addr)?;

        let ip = match host.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => resolve_first(&host, port).await?,
        };
        let ip = unmap(ip);

        if contains(&self.loopback, ip) {
            return Err(Error::AddressBlocked(
                "loopback addresses are not allowed".to_string(),
            ));
        }
        if contains(&self.link_local, ip) {
            return Err(Error::AddressBlocked(
                "link-local addresses are not allowed".to_string(),
            ));
        }
        if !self.allow_private && contains(&self.private, ip) {
            return Err(Error::AddressBlocked(
                "private network addresses are not allowed".to_string(),
            ));
        }
        if contains(&self.blocked, ip) {
            return Err(Error::AddressBlocked(format!(
                "address {} is in a blocked network",
                ip
            )));
        }

        Ok(())
    }
}

fn contains(nets: &[IpNet], ip: IpAddr) -> bool {
    nets.iter().any(|net| net.contains(&ip))
}

/// Strip an IPv4-mapped IPv6 address down to its IPv4 form so it matches
/// the v4 network lists.
fn unmap(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        IpAddr::V4(_) => ip,
    }
}

/// Split `host:port`, accepting RFC 3986 bracketed IPv6 hosts.
fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port_str) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::AddressBlocked(format!("invalid address format {:?}", addr)))?;

    let port: u16 = port_str
        .parse()
        .map_err(|_| Error::AddressBlocked(format!("invalid port in {:?}", addr)))?;

    let host = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        Some(inner) => inner,
        None => host,
    };
    if host.is_empty() {
        return Err(Error::AddressBlocked(format!(
            "invalid address format {:?}",
            addr
        )));
    }

    Ok((host.to_string(), port))
}

async fn resolve_first(host: &str, port: u16) -> Result<IpAddr> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::AddressBlocked(format!("failed to resolve {:?}: {}", host, e)))?;

    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| Error::AddressBlocked(format!("{:?} resolved to no addresses", host)))
}
