//! Host and address helpers for the proxy hub.
//!
//! This library provides helpers for:
//! - Classifying a host string as IPv4, IPv6, or domain name
//! - Collapsing long domains into wildcard patterns for certificate/policy matching
//! - Parsing `host:port` authorities
//! - Listing the local interface addresses a proxy is reachable on
//!
//! Classification is intentionally loose: it decides how a host should be
//! treated by the pipeline, it does not validate the address.

use std::fmt;
use std::net::IpAddr;

use thiserror::Error;
use tracing::warn;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Port suffix is not a valid port number.
    #[error("invalid port in address {address:?}: {port:?}")]
    InvalidPort { address: String, port: String },

    /// Bracketed IPv6 authority without a closing bracket.
    #[error("unterminated IPv6 literal in address {0:?}")]
    UnterminatedIpv6(String),
}

// ============================================================================
// Host classification
// ============================================================================

/// Kind of host a string names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostType {
    /// IPv6 literal (contains `:` and no `.`).
    Ipv6,
    /// Dotted quad of 1-3 digit runs.
    Ipv4,
    /// Anything else.
    Domain,
}

/// Classify a host string.
///
/// `999.999.999.999` is classified as IPv4: octet ranges are not checked.
pub fn host_type(host: &str) -> HostType {
    if host.contains(':') && !host.contains('.') {
        return HostType::Ipv6;
    }
    if is_dotted_quad(host) {
        return HostType::Ipv4;
    }
    HostType::Domain
}

fn is_dotted_quad(host: &str) -> bool {
    let mut segments = 0;
    for segment in host.split('.') {
        segments += 1;
        if segments > 4
            || segment.is_empty()
            || segment.len() > 3
            || !segment.bytes().all(|b| b.is_ascii_digit())
        {
            return false;
        }
    }
    segments == 4
}

/// Generate a wildcard host for long domains.
///
/// Domains with more than three labels collapse to `*.` followed by their
/// last three labels. IP literals and short domains are returned unchanged.
pub fn wildcard_host(host: &str) -> String {
    if host_type(host) != HostType::Domain {
        return host.to_string();
    }

    let mut labels: Vec<&str> = host.split('.').collect();
    // Trailing empty labels ("a.b.c.d.") do not count.
    while labels.last() == Some(&"") {
        labels.pop();
    }

    if labels.len() <= 3 {
        return host.to_string();
    }

    format!("*.{}", labels[labels.len() - 3..].join("."))
}

// ============================================================================
// Addresses
// ============================================================================

/// A `host[:port]` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetAddress {
    /// Host part, without IPv6 brackets.
    pub host: String,

    /// Port, `None` when the address did not specify one.
    pub port: Option<u16>,
}

impl NetAddress {
    /// Create a new address.
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Port, or `default` when unspecified.
    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }

    /// Classification of the host part.
    pub fn host_type(&self) -> HostType {
        host_type(&self.host)
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = if self.host_type() == HostType::Ipv6 {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.port {
            Some(port) => write!(f, "{}:{}", host, port),
            None => f.write_str(&host),
        }
    }
}

/// Split an address into host and port.
///
/// Splits at the first `:`. A string without `:` (or starting with one) is
/// all host. Bracketed IPv6 literals (`[::1]:443`) are also accepted.
pub fn parse_address(address: &str) -> Result<NetAddress, NetworkError> {
    if let Some(rest) = address.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            return Err(NetworkError::UnterminatedIpv6(address.to_string()));
        };
        let port = match tail.strip_prefix(':') {
            Some(port) => Some(parse_port(address, port)?),
            None if tail.is_empty() => None,
            None => return Err(NetworkError::InvalidPort {
                address: address.to_string(),
                port: tail.to_string(),
            }),
        };
        return Ok(NetAddress::new(host, port));
    }

    match address.find(':') {
        Some(idx) if idx > 0 => {
            let port = parse_port(address, &address[idx + 1..])?;
            Ok(NetAddress::new(&address[..idx], Some(port)))
        }
        _ => Ok(NetAddress::new(address, None)),
    }
}

fn parse_port(address: &str, port: &str) -> Result<u16, NetworkError> {
    port.parse::<u16>().map_err(|_| NetworkError::InvalidPort {
        address: address.to_string(),
        port: port.to_string(),
    })
}

// ============================================================================
// Local interfaces
// ============================================================================

/// One address of a local network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Interface name (e.g. `eth0`).
    pub interface_name: String,

    /// Address assigned to the interface.
    pub ip: IpAddr,
}

/// Interface entry as reported by the OS, before filtering.
#[derive(Debug, Clone)]
struct InterfaceEntry {
    name: String,
    up: bool,
    loopback: bool,
    point_to_point: bool,
    ip: Option<IpAddr>,
}

/// List the addresses of local interfaces that are up.
///
/// Loopback and point-to-point interfaces are skipped. Enumeration failure
/// is logged and yields an empty list.
pub fn network_info_list() -> Vec<NetworkInfo> {
    match interface_entries() {
        Ok(entries) => filter_entries(entries),
        Err(e) => {
            warn!(error = %e, "cannot list local network interface addresses");
            Vec::new()
        }
    }
}

fn filter_entries(entries: impl IntoIterator<Item = InterfaceEntry>) -> Vec<NetworkInfo> {
    entries
        .into_iter()
        .filter(|entry| entry.up && !entry.loopback && !entry.point_to_point)
        .filter_map(|entry| {
            entry.ip.map(|ip| NetworkInfo {
                interface_name: entry.name,
                ip,
            })
        })
        .collect()
}

#[cfg(unix)]
fn interface_entries() -> Result<Vec<InterfaceEntry>, nix::Error> {
    use std::net::{SocketAddrV4, SocketAddrV6};

    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::InterfaceFlags;

    let entries = getifaddrs()?
        .map(|ifaddr| {
            let ip = ifaddr.address.as_ref().and_then(|addr| {
                if let Some(sin) = addr.as_sockaddr_in() {
                    Some(IpAddr::V4(*SocketAddrV4::from(*sin).ip()))
                } else {
                    addr.as_sockaddr_in6()
                        .map(|sin6| IpAddr::V6(*SocketAddrV6::from(*sin6).ip()))
                }
            });

            InterfaceEntry {
                up: ifaddr.flags.contains(InterfaceFlags::IFF_UP),
                loopback: ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK),
                point_to_point: ifaddr.flags.contains(InterfaceFlags::IFF_POINTOPOINT),
                name: ifaddr.interface_name,
                ip,
            }
        })
        .collect();

    Ok(entries)
}

#[cfg(not(unix))]
fn interface_entries() -> Result<Vec<InterfaceEntry>, std::io::Error> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "interface enumeration requires getifaddrs",
    ))
}
