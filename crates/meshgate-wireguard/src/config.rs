//! Peer instructions and client configuration rendering.
//!
//! `PeerConfig` is what the daemon is told about a peer. `ClientConfig` is
//! the wg-quick style file handed to the operator of the new peer.

use std::fmt::Write as FmtWrite;
use std::net::IpAddr;

use crate::keys::{PrivateKey, PresharedKey, PublicKey};
use crate::types::{AllowedIp, Endpoint};

/// Configuration for a `WireGuard` peer as pushed to the daemon.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerConfig {
    /// The peer's public key.
    pub public_key: PublicKey,
    /// Optional preshared key.
    pub preshared_key: Option<PresharedKey>,
    /// Allowed IPs for this peer.
    pub allowed_ips: Vec<AllowedIp>,
    /// Optional endpoint.
    pub endpoint: Option<Endpoint>,
    /// Optional persistent keepalive interval.
    pub persistent_keepalive: Option<u16>,
}

impl PeerConfig {
    /// Creates a new peer config with the given public key.
    #[must_use]
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            preshared_key: None,
            allowed_ips: Vec::new(),
            endpoint: None,
            persistent_keepalive: None,
        }
    }

    /// Sets the preshared key.
    #[must_use]
    pub fn with_preshared_key(mut self, key: PresharedKey) -> Self {
        self.preshared_key = Some(key);
        self
    }

    /// Adds an allowed IP.
    #[must_use]
    pub fn with_allowed_ip(mut self, ip: AllowedIp) -> Self {
        self.allowed_ips.push(ip);
        self
    }

    /// Sets the endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Sets the persistent keepalive interval.
    #[must_use]
    pub fn with_persistent_keepalive(mut self, seconds: u16) -> Self {
        self.persistent_keepalive = Some(seconds);
        self
    }

    /// Returns the allowed IPs joined the way `wg` expects them.
    #[must_use]
    pub fn allowed_ips_csv(&self) -> String {
        self.allowed_ips
            .iter()
            .map(AllowedIp::to_cidr)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// A complete client-side configuration for a newly provisioned peer.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// The client's private key.
    pub private_key: PrivateKey,
    /// Addresses assigned to the client interface.
    pub addresses: Vec<AllowedIp>,
    /// DNS servers for the client.
    pub dns: Vec<IpAddr>,
    /// Optional MTU.
    pub mtu: Option<u16>,
    /// The server, seen as the client's single peer.
    pub server: PeerConfig,
}

impl ClientConfig {
    /// Creates a client configuration for the given key and server peer.
    #[must_use]
    pub fn new(private_key: PrivateKey, server: PeerConfig) -> Self {
        Self {
            private_key,
            addresses: Vec::new(),
            dns: Vec::new(),
            mtu: None,
            server,
        }
    }

    /// Adds an interface address.
    #[must_use]
    pub fn with_address(mut self, address: AllowedIp) -> Self {
        self.addresses.push(address);
        self
    }

    /// Adds a DNS server.
    #[must_use]
    pub fn with_dns(mut self, dns: IpAddr) -> Self {
        self.dns.push(dns);
        self
    }

    /// Sets the MTU.
    #[must_use]
    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Renders the configuration in wg-quick format.
    #[must_use]
    pub fn render(&self) -> String {
        let mut output = String::new();

        output.push_str("[Interface]\n");
        let _ = writeln!(output, "PrivateKey = {}", self.private_key.to_base64());

        if !self.addresses.is_empty() {
            let addrs: Vec<String> = self.addresses.iter().map(AllowedIp::to_cidr).collect();
            let _ = writeln!(output, "Address = {}", addrs.join(", "));
        }

        if !self.dns.is_empty() {
            let dns: Vec<String> = self.dns.iter().map(ToString::to_string).collect();
            let _ = writeln!(output, "DNS = {}", dns.join(", "));
        }

        if let Some(mtu) = self.mtu {
            let _ = writeln!(output, "MTU = {mtu}");
        }

        let peer = &self.server;
        output.push('\n');
        output.push_str("[Peer]\n");
        let _ = writeln!(output, "PublicKey = {}", peer.public_key.to_base64());

        if let Some(ref psk) = peer.preshared_key {
            let _ = writeln!(output, "PresharedKey = {}", psk.to_base64());
        }

        if !peer.allowed_ips.is_empty() {
            let ips: Vec<String> = peer.allowed_ips.iter().map(AllowedIp::to_cidr).collect();
            let _ = writeln!(output, "AllowedIPs = {}", ips.join(", "));
        }

        if let Some(ref endpoint) = peer.endpoint {
            let _ = writeln!(output, "Endpoint = {endpoint}");
        }

        if let Some(keepalive) = peer.persistent_keepalive {
            let _ = writeln!(output, "PersistentKeepalive = {keepalive}");
        }

        output
    }
}
