//! Kernel `WireGuard` control over netlink.
//!
//! Wraps `defguard_wireguard_rs` with the `Kernel` backend. The interface
//! itself is owned by the host (wg-quick, systemd-networkd); this daemon only
//! touches its peer table.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::UNIX_EPOCH;

use defguard_wireguard_rs::host::Peer as DgPeer;
use defguard_wireguard_rs::key::Key as DgKey;
use defguard_wireguard_rs::net::IpAddrMask;
use defguard_wireguard_rs::{Kernel, WGApi, WireguardInterfaceApi};
use tracing::{debug, info};

use crate::config::PeerConfig;
use crate::daemon::PeerDaemon;
use crate::error::{Result, WireGuardError};
use crate::keys::PublicKey;
use crate::types::{AllowedIp, PeerStatus};

/// Peer control for a kernel `WireGuard` interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetlinkDaemon;

impl NetlinkDaemon {
    /// Creates a netlink daemon controller.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn api(interface: &str) -> Result<WGApi<Kernel>> {
    WGApi::<Kernel>::new(interface.to_string())
        .map_err(|e| WireGuardError::DaemonUnavailable(format!("{interface}: {e}")))
}

fn to_ip_addr_mask(allowed_ip: &AllowedIp) -> Result<IpAddrMask> {
    IpAddrMask::from_str(&allowed_ip.to_cidr())
        .map_err(|e| WireGuardError::InvalidCidr(format!("{}: {e}", allowed_ip.to_cidr())))
}

fn to_dg_key(bytes: &[u8]) -> Result<DgKey> {
    DgKey::try_from(bytes).map_err(|e| WireGuardError::InvalidKey(format!("netlink key: {e}")))
}

fn build_dg_peer(peer: &PeerConfig) -> Result<DgPeer> {
    let mut dg_peer = DgPeer::new(to_dg_key(peer.public_key.as_bytes())?);

    if let Some(ref endpoint) = peer.endpoint {
        // The kernel only takes socket addresses; names must be resolved first.
        let addr = endpoint
            .to_string()
            .parse::<SocketAddr>()
            .map_err(|_| WireGuardError::InvalidEndpoint(endpoint.to_string()))?;
        dg_peer.endpoint = Some(addr);
    }
    dg_peer.persistent_keepalive_interval = peer.persistent_keepalive;

    if let Some(ref psk) = peer.preshared_key {
        dg_peer.preshared_key = Some(to_dg_key(psk.as_bytes())?);
    }

    for aip in &peer.allowed_ips {
        dg_peer.allowed_ips.push(to_ip_addr_mask(aip)?);
    }

    Ok(dg_peer)
}

fn to_peer_status(dg_peer: &DgPeer) -> PeerStatus {
    let mut status = PeerStatus::new(PublicKey::from_bytes_array(dg_peer.public_key.as_array()));
    status.endpoint = dg_peer.endpoint.map(|addr| addr.to_string());
    status.allowed_ips = dg_peer
        .allowed_ips
        .iter()
        .filter_map(|aip| AllowedIp::from_cidr(&aip.to_string()).ok())
        .collect();
    status.last_handshake = dg_peer
        .last_handshake
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .filter(|secs| *secs > 0);
    status.rx_bytes = dg_peer.rx_bytes;
    status.tx_bytes = dg_peer.tx_bytes;
    status
}

impl PeerDaemon for NetlinkDaemon {
    async fn add_peer(&self, interface: &str, peer: &PeerConfig) -> Result<()> {
        let api = api(interface)?;
        let dg_peer = build_dg_peer(peer)?;

        api.configure_peer(&dg_peer)
            .map_err(|e| WireGuardError::DaemonRejected(format!("configure_peer: {e}")))?;
        api.configure_peer_routing(&[dg_peer])
            .map_err(|e| WireGuardError::DaemonRejected(format!("configure_peer_routing: {e}")))?;

        info!(interface, peer = %peer.public_key.short(), "peer configured over netlink");
        Ok(())
    }

    async fn remove_peer(&self, interface: &str, public_key: &PublicKey) -> Result<()> {
        let api = api(interface)?;
        let dg_key = to_dg_key(public_key.as_bytes())?;

        let host = api
            .read_interface_data()
            .map_err(|e| WireGuardError::DaemonUnavailable(format!("read_interface_data: {e}")))?;
        if !host.peers.contains_key(&dg_key) {
            debug!(interface, peer = %public_key.short(), "peer already absent");
            return Ok(());
        }

        api.remove_peer(&dg_key)
            .map_err(|e| WireGuardError::DaemonRejected(format!("remove_peer: {e}")))?;

        info!(interface, peer = %public_key.short(), "peer removed over netlink");
        Ok(())
    }

    async fn peers(&self, interface: &str) -> Result<Vec<PeerStatus>> {
        let host = api(interface)?
            .read_interface_data()
            .map_err(|e| WireGuardError::DaemonUnavailable(format!("read_interface_data: {e}")))?;

        Ok(host.peers.values().map(to_peer_status).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KEY_SIZE, PresharedKey};

    fn test_peer() -> PeerConfig {
        PeerConfig::new(PublicKey::from_bytes_array([4u8; KEY_SIZE]))
            .with_preshared_key(PresharedKey::from_bytes_array([5u8; KEY_SIZE]))
            .with_allowed_ip(AllowedIp::from_cidr("10.25.0.2/32").expect("valid cidr"))
            .with_endpoint("203.0.113.7:51820".parse().expect("valid endpoint"))
            .with_persistent_keepalive(25)
    }

    #[test]
    fn build_peer_converts_fields() {
        let dg_peer = build_dg_peer(&test_peer()).expect("convertible peer");
        assert_eq!(dg_peer.allowed_ips.len(), 1);
        assert_eq!(dg_peer.persistent_keepalive_interval, Some(25));
        assert!(dg_peer.preshared_key.is_some());
        assert_eq!(
            dg_peer.endpoint,
            Some("203.0.113.7:51820".parse().expect("valid socket addr"))
        );
    }

    #[test]
    fn build_peer_rejects_unresolved_endpoint() {
        let peer = test_peer().with_endpoint("vpn.example.com:51820".parse().expect("valid endpoint"));
        assert!(matches!(
            build_dg_peer(&peer),
            Err(WireGuardError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn status_round_trips_key() {
        let dg_peer = build_dg_peer(&test_peer()).expect("convertible peer");
        let status = to_peer_status(&dg_peer);
        assert_eq!(status.public_key, test_peer().public_key);
        assert_eq!(status.allowed_ips, test_peer().allowed_ips);
    }

    // Requires root and the WireGuard kernel module.
    #[tokio::test]
    #[ignore = "requires root and WireGuard kernel module"]
    async fn netlink_lists_peers() {
        let daemon = NetlinkDaemon::new();
        assert!(daemon.peers("wg0").await.is_ok());
    }
}
