//! Per-peer traffic counters.

use std::collections::{HashMap, HashSet};

use meshgate_registry::CommittedView;
use meshgate_wireguard::{AllowedIp, PeerStatus, PublicKey};
use serde::Serialize;

/// Traffic of one registered peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerTransfer {
    /// The peer.
    pub public_key: PublicKey,
    /// Addresses registered for the peer.
    pub allowed_ips: Vec<AllowedIp>,
    /// Bytes received from the peer.
    pub rx_bytes: u64,
    /// Bytes sent to the peer.
    pub tx_bytes: u64,
    /// Unix time of the last handshake.
    pub last_handshake: Option<u64>,
    /// Whether the daemon currently has the peer.
    pub live: bool,
}

/// Registry peers joined with the daemon's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    /// Registry generation the report was built from.
    pub generation: u64,
    /// Registered peers in registry order.
    pub peers: Vec<PeerTransfer>,
    /// Peers the daemon has but the registry does not.
    pub unregistered: Vec<PublicKey>,
}

impl TransferReport {
    /// Builds a report from a registry view and the daemon's peer table.
    #[must_use]
    pub fn build(view: &CommittedView, live: &[PeerStatus]) -> Self {
        let by_key: HashMap<&PublicKey, &PeerStatus> =
            live.iter().map(|status| (&status.public_key, status)).collect();

        let peers = view
            .peers()
            .iter()
            .map(|record| {
                let status = by_key.get(&record.public_key);
                PeerTransfer {
                    public_key: record.public_key,
                    allowed_ips: record.allowed_ips.clone(),
                    rx_bytes: status.map_or(0, |s| s.rx_bytes),
                    tx_bytes: status.map_or(0, |s| s.tx_bytes),
                    last_handshake: status.and_then(|s| s.last_handshake),
                    live: status.is_some(),
                }
            })
            .collect();

        let registered: HashSet<&PublicKey> = view.peers().iter().map(|r| &r.public_key).collect();
        let mut unregistered: Vec<PublicKey> = live
            .iter()
            .map(|status| status.public_key)
            .filter(|key| !registered.contains(key))
            .collect();
        unregistered.sort_unstable();

        Self {
            generation: view.generation(),
            peers,
            unregistered,
        }
    }

    /// Returns registered peers the daemon does not have.
    pub fn missing(&self) -> impl Iterator<Item = &PublicKey> {
        self.peers.iter().filter(|p| !p.live).map(|p| &p.public_key)
    }

    /// Returns true if registry and daemon hold the same peers.
    #[must_use]
    pub fn in_sync(&self) -> bool {
        self.unregistered.is_empty() && self.missing().next().is_none()
    }

    /// Total bytes received from all registered peers.
    #[must_use]
    pub fn total_rx(&self) -> u64 {
        self.peers.iter().map(|p| p.rx_bytes).fold(0, u64::saturating_add)
    }

    /// Total bytes sent to all registered peers.
    #[must_use]
    pub fn total_tx(&self) -> u64 {
        self.peers.iter().map(|p| p.tx_bytes).fold(0, u64::saturating_add)
    }
}
