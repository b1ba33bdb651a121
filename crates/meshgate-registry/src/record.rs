//! Peer records.

use chrono::{DateTime, SecondsFormat, Utc};
use meshgate_wireguard::{
    AddressFamily, AllowedIp, ClientConfig, PeerConfig, PresharedKey, PrivateKey, PublicKey,
};
use serde::ser::{Serialize, Serializer};

/// A registered peer.
///
/// Records are never edited in place: replacing a peer is a remove followed
/// by an add.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Identity of the peer, unique in the registry.
    pub public_key: PublicKey,
    /// Preshared key, if the peer uses one.
    pub preshared_key: Option<PresharedKey>,
    /// Addresses routed to the peer, at most one host per family for
    /// provisioned peers.
    pub allowed_ips: Vec<AllowedIp>,
    /// When the peer was provisioned. Unknown for hand-written peers.
    pub created_at: Option<DateTime<Utc>>,
    /// Other `[Peer]` settings found in the store, kept in order.
    pub extra: Vec<(String, String)>,
}

impl PeerRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(
        public_key: PublicKey,
        preshared_key: Option<PresharedKey>,
        allowed_ips: Vec<AllowedIp>,
    ) -> Self {
        Self {
            public_key,
            preshared_key,
            allowed_ips,
            created_at: Some(Utc::now()),
            extra: Vec::new(),
        }
    }

    /// Returns the first allowed IP of the given family.
    #[must_use]
    pub fn address(&self, family: AddressFamily) -> Option<&AllowedIp> {
        self.allowed_ips.iter().find(|ip| ip.family() == family)
    }

    /// Returns the first allowed IP that overlaps `other`.
    #[must_use]
    pub fn overlapping(&self, other: &AllowedIp) -> Option<&AllowedIp> {
        self.allowed_ips.iter().find(|ip| ip.overlaps(other))
    }

    /// Builds the daemon instruction for this peer.
    ///
    /// Only the fields the daemon needs are carried over; `extra` settings
    /// belong to whoever wrote them.
    #[must_use]
    pub fn to_peer_config(&self) -> PeerConfig {
        let mut config = PeerConfig::new(self.public_key);
        config.preshared_key.clone_from(&self.preshared_key);
        config.allowed_ips.clone_from(&self.allowed_ips);
        config
    }
}

/// A freshly provisioned peer, the only place its private key exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedPeer {
    /// The committed registry record.
    pub record: PeerRecord,
    /// The peer's private key, never persisted.
    pub private_key: PrivateKey,
}

impl ProvisionedPeer {
    /// Returns the peer's public key.
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.record.public_key
    }

    /// Builds the wg-quick configuration for the new peer.
    ///
    /// The peer's own addresses become the interface addresses and `server`
    /// is its single `[Peer]`. The peer's preshared key is applied to
    /// `server` unless it already carries one.
    #[must_use]
    pub fn client_config(&self, mut server: PeerConfig) -> ClientConfig {
        if server.preshared_key.is_none() {
            server.preshared_key.clone_from(&self.record.preshared_key);
        }
        let mut config = ClientConfig::new(self.private_key.clone(), server);
        config.addresses.clone_from(&self.record.allowed_ips);
        config
    }
}

#[derive(serde::Serialize)]
struct ProvisionedPeerJson<'a> {
    public_key: String,
    private_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    preshared_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ipv4: Option<&'a AllowedIp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ipv6: Option<&'a AllowedIp>,
    allowed_ips: &'a [AllowedIp],
    #[serde(skip_serializing_if = "Option::is_none")]
    created_at: Option<String>,
}

impl Serialize for ProvisionedPeer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let record = &self.record;
        ProvisionedPeerJson {
            public_key: record.public_key.to_base64(),
            private_key: self.private_key.to_base64(),
            preshared_key: record.preshared_key.as_ref().map(PresharedKey::to_base64),
            ipv4: record.address(AddressFamily::Ipv4),
            ipv6: record.address(AddressFamily::Ipv6),
            allowed_ips: &record.allowed_ips,
            created_at: record
                .created_at
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
        .serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_wireguard::KEY_SIZE;

    fn provisioned() -> ProvisionedPeer {
        let private_key = PrivateKey::from_bytes_array([1u8; KEY_SIZE]);
        let record = PeerRecord::new(
            private_key.public_key(),
            Some(PresharedKey::from_bytes_array([2u8; KEY_SIZE])),
            vec![
                AllowedIp::from_cidr("10.25.0.2/32").expect("valid cidr"),
                AllowedIp::from_cidr("fd42:42:42::2/128").expect("valid cidr"),
            ],
        );
        ProvisionedPeer { record, private_key }
    }

    #[test]
    fn address_by_family() {
        let peer = provisioned();
        assert_eq!(
            peer.record.address(AddressFamily::Ipv6).map(AllowedIp::to_cidr),
            Some("fd42:42:42::2/128".to_string())
        );
    }

    #[test]
    fn peer_config_carries_keys_and_addresses() {
        let peer = provisioned();
        let config = peer.record.to_peer_config();
        assert_eq!(config.public_key, peer.record.public_key);
        assert_eq!(config.preshared_key, peer.record.preshared_key);
        assert_eq!(config.allowed_ips.len(), 2);
        assert!(config.endpoint.is_none());
    }

    #[test]
    fn json_contains_all_key_material() {
        let peer = provisioned();
        let json = serde_json::to_value(&peer).expect("serialize");

        assert_eq!(json["public_key"], peer.record.public_key.to_base64());
        assert_eq!(json["private_key"], peer.private_key.to_base64());
        assert_eq!(
            json["preshared_key"],
            PresharedKey::from_bytes_array([2u8; KEY_SIZE]).to_base64()
        );
        assert_eq!(json["ipv4"], "10.25.0.2/32");
        assert_eq!(json["ipv6"], "fd42:42:42::2/128");
        assert!(json["created_at"].as_str().is_some_and(|s| s.ends_with('Z')));
    }

    #[test]
    fn debug_never_shows_private_key() {
        let peer = provisioned();
        let debug = format!("{peer:?}");
        assert!(!debug.contains(&peer.private_key.to_base64()));
    }

    #[test]
    fn client_config_uses_peer_addresses() {
        let peer = provisioned();
        let server = PeerConfig::new(PublicKey::from_bytes_array([9u8; KEY_SIZE]))
            .with_allowed_ip(AllowedIp::from_cidr("10.25.0.0/16").expect("valid cidr"));

        let rendered = peer.client_config(server).render();
        assert!(rendered.contains("Address = 10.25.0.2/32, fd42:42:42::2/128"));
        assert!(rendered.contains(&format!("PrivateKey = {}", peer.private_key.to_base64())));
        assert!(rendered.contains("PresharedKey = "));
        assert!(rendered.contains("AllowedIPs = 10.25.0.0/16"));
    }
}
