//! Core types for `WireGuard` peers.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WireGuardError};
use crate::keys::PublicKey;

/// IP address family of an address pool or allowed address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// IPv4.
    Ipv4,
    /// IPv6.
    Ipv6,
}

impl AddressFamily {
    /// Returns the family of an IP address.
    #[must_use]
    pub const fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }

    /// Returns the prefix length that denotes a single host in this family.
    #[must_use]
    pub const fn host_prefix_len(self) -> u8 {
        match self {
            Self::Ipv4 => 32,
            Self::Ipv6 => 128,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4 => write!(f, "ipv4"),
            Self::Ipv6 => write!(f, "ipv6"),
        }
    }
}

impl FromStr for AddressFamily {
    type Err = WireGuardError;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ipv4" | "v4" | "4" => Ok(Self::Ipv4),
            "ipv6" | "v6" | "6" => Ok(Self::Ipv6),
            other => Err(WireGuardError::InvalidFamily(other.to_string())),
        }
    }
}

/// An allowed IP address or network in CIDR notation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllowedIp {
    network: IpNet,
}

impl AllowedIp {
    /// Creates a new allowed IP from an `IpNet`.
    #[must_use]
    pub fn new(network: IpNet) -> Self {
        Self { network }
    }

    /// Creates a single-host allowed IP (`/32` or `/128`).
    #[must_use]
    pub fn host(ip: IpAddr) -> Self {
        Self { network: IpNet::from(ip) }
    }

    /// Creates an allowed IP from CIDR notation.
    ///
    /// A bare address without a prefix is accepted as a single host.
    ///
    /// # Errors
    ///
    /// Returns an error if the CIDR notation is invalid.
    pub fn from_cidr(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(network) = s.parse::<IpNet>() {
            return Ok(Self { network });
        }
        s.parse::<IpAddr>()
            .map(Self::host)
            .map_err(|_| WireGuardError::InvalidCidr(s.to_string()))
    }

    /// Returns the network.
    #[must_use]
    pub fn network(&self) -> &IpNet {
        &self.network
    }

    /// Returns the address part of the CIDR.
    #[must_use]
    pub fn addr(&self) -> IpAddr {
        self.network.addr()
    }

    /// Returns the address family.
    #[must_use]
    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.network.addr())
    }

    /// Returns true if this entry denotes exactly one host.
    #[must_use]
    pub fn is_host(&self) -> bool {
        self.network.prefix_len() == self.family().host_prefix_len()
    }

    /// Returns true if the two entries share at least one address.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        if self.family() != other.family() {
            return false;
        }
        let a = self.network.trunc();
        let b = other.network.trunc();
        a.contains(&b.network()) || b.contains(&a.network())
    }

    /// Returns the CIDR string representation.
    #[must_use]
    pub fn to_cidr(&self) -> String {
        self.network.to_string()
    }
}

impl FromStr for AllowedIp {
    type Err = WireGuardError;
    fn from_str(s: &str) -> Result<Self> {
        Self::from_cidr(s)
    }
}

impl fmt::Display for AllowedIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.network)
    }
}

/// A `WireGuard` endpoint (`host:port`).
///
/// The host may be a DNS name, an IPv4 address, or a bracketed IPv6 address,
/// as accepted by `wg` and `wg-quick`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Creates an endpoint from a host and port.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Returns the host part (without brackets).
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for Endpoint {
    type Err = WireGuardError;
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || WireGuardError::InvalidEndpoint(s.to_string());

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
            host.parse::<std::net::Ipv6Addr>().map_err(|_| invalid())?;
            (host, port)
        } else {
            let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
            if host.contains(':') {
                return Err(invalid());
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = WireGuardError;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Live status of a peer as reported by the daemon.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    /// The peer's public key.
    pub public_key: PublicKey,
    /// Current endpoint (if known).
    pub endpoint: Option<String>,
    /// Configured allowed IPs.
    pub allowed_ips: Vec<AllowedIp>,
    /// Unix timestamp of last successful handshake.
    pub last_handshake: Option<u64>,
    /// Bytes received from this peer.
    pub rx_bytes: u64,
    /// Bytes transmitted to this peer.
    pub tx_bytes: u64,
}

impl PeerStatus {
    /// Creates a status entry with no traffic and no handshake.
    #[must_use]
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            endpoint: None,
            allowed_ips: Vec::new(),
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("ipv4", AddressFamily::Ipv4 ; "long v4")]
    #[test_case("IPv6", AddressFamily::Ipv6 ; "mixed case v6")]
    #[test_case("4", AddressFamily::Ipv4 ; "numeric v4")]
    #[test_case("v6", AddressFamily::Ipv6 ; "short v6")]
    fn family_from_str(input: &str, expected: AddressFamily) {
        assert_eq!(input.parse::<AddressFamily>().expect("valid family"), expected);
    }

    #[test]
    fn family_from_str_rejects_unknown() {
        assert!("ipx".parse::<AddressFamily>().is_err());
    }

    #[test]
    fn allowed_ip_bare_address_is_host() {
        let ip = AllowedIp::from_cidr("10.25.0.2").expect("valid address");
        assert_eq!(ip.to_cidr(), "10.25.0.2/32");
        assert!(ip.is_host());

        let ip6 = AllowedIp::from_cidr("fd42:42:42::2").expect("valid address");
        assert_eq!(ip6.to_cidr(), "fd42:42:42::2/128");
        assert_eq!(ip6.family(), AddressFamily::Ipv6);
    }

    #[test]
    fn allowed_ip_invalid() {
        assert!(matches!(
            AllowedIp::from_cidr("10.25.0.300/32"),
            Err(WireGuardError::InvalidCidr(_))
        ));
    }

    #[test_case("10.0.0.2/32", "10.0.0.2/32", true ; "same host")]
    #[test_case("10.0.0.2/32", "10.0.0.3/32", false ; "different hosts")]
    #[test_case("10.0.0.0/24", "10.0.0.77/32", true ; "subnet contains host")]
    #[test_case("10.0.0.77/32", "10.0.0.0/24", true ; "host inside subnet")]
    #[test_case("10.0.0.0/24", "10.0.1.0/24", false ; "adjacent subnets")]
    #[test_case("10.0.0.2/32", "::2/128", false ; "different families")]
    fn allowed_ip_overlaps(a: &str, b: &str, expected: bool) {
        let a = AllowedIp::from_cidr(a).expect("valid cidr");
        let b = AllowedIp::from_cidr(b).expect("valid cidr");
        assert_eq!(a.overlaps(&b), expected);
    }

    #[test_case("vpn.example.com:51820", "vpn.example.com", 51820 ; "hostname")]
    #[test_case("203.0.113.7:51820", "203.0.113.7", 51820 ; "ipv4")]
    #[test_case("[2001:db8::1]:443", "2001:db8::1", 443 ; "bracketed ipv6")]
    fn endpoint_parse(input: &str, host: &str, port: u16) {
        let endpoint: Endpoint = input.parse().expect("valid endpoint");
        assert_eq!(endpoint.host(), host);
        assert_eq!(endpoint.port(), port);
        assert_eq!(endpoint.to_string(), input);
    }

    #[test_case("vpn.example.com" ; "missing port")]
    #[test_case("2001:db8::1:443" ; "unbracketed ipv6")]
    #[test_case(":51820" ; "missing host")]
    #[test_case("host:0" ; "zero port")]
    fn endpoint_parse_rejects(input: &str) {
        assert!(input.parse::<Endpoint>().is_err());
    }
}
