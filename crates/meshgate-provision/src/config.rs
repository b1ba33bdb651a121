//! Provisioning configuration.
//!
//! Loaded from TOML:
//!
//! ```toml
//! interface = "wg0"
//! registry_path = "/etc/wireguard/wg0.conf"
//! lock_timeout_secs = 30
//! cross_check_daemon = true
//! persistent_keepalive = 25
//!
//! [pools]
//! ipv4 = "10.25.0.0/16"
//! ipv6 = "fd42:42:42::/112"
//!
//! [client]
//! server_public_key = "..."
//! endpoint = "vpn.example.com:51820"
//! dns = ["1.1.1.1"]
//! allowed_ips = ["0.0.0.0/0", "::/0"]
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use meshgate_registry::{AddressPool, DEFAULT_IPV4_POOL, DEFAULT_IPV6_POOL};
use meshgate_wireguard::{AddressFamily, AllowedIp, Endpoint, PeerConfig, PublicKey, DEFAULT_WG_BINARY};
use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, Result};

/// Longest interface name Linux accepts.
const MAX_INTERFACE_NAME: usize = 15;

fn default_interface() -> String {
    "wg0".to_string()
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("/etc/wireguard/wg0.conf")
}

fn default_lock_timeout_secs() -> Option<u64> {
    Some(30)
}

fn default_true() -> bool {
    true
}

fn default_wg_binary() -> String {
    DEFAULT_WG_BINARY.to_string()
}

fn default_keepalive() -> Option<u16> {
    Some(25)
}

fn default_client_allowed_ips() -> Vec<AllowedIp> {
    ["0.0.0.0/0", "::/0"]
        .iter()
        .filter_map(|cidr| AllowedIp::from_cidr(cidr).ok())
        .collect()
}

/// Address pools by family.
///
/// Without a `[pools]` table both default pools are used. With one, only
/// the families it lists are provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolsConfig {
    /// IPv4 pool.
    #[serde(default)]
    pub ipv4: Option<AddressPool>,
    /// IPv6 pool.
    #[serde(default)]
    pub ipv6: Option<AddressPool>,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            ipv4: AddressPool::from_cidr(DEFAULT_IPV4_POOL).ok(),
            ipv6: AddressPool::from_cidr(DEFAULT_IPV6_POOL).ok(),
        }
    }
}

impl PoolsConfig {
    /// Returns the pool for a family.
    #[must_use]
    pub fn get(&self, family: AddressFamily) -> Option<&AddressPool> {
        match family {
            AddressFamily::Ipv4 => self.ipv4.as_ref(),
            AddressFamily::Ipv6 => self.ipv6.as_ref(),
        }
    }

    /// Returns the configured pools.
    pub fn iter(&self) -> impl Iterator<Item = &AddressPool> {
        self.ipv4.iter().chain(self.ipv6.iter())
    }
}

/// How new peers reach the server, used for client configurations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProfile {
    /// The server's public key.
    pub server_public_key: PublicKey,
    /// Where clients connect to.
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
    /// DNS servers handed to clients.
    #[serde(default)]
    pub dns: Vec<IpAddr>,
    /// Networks clients route through the tunnel.
    #[serde(default = "default_client_allowed_ips")]
    pub allowed_ips: Vec<AllowedIp>,
    /// Client-side keepalive interval.
    #[serde(default = "default_keepalive")]
    pub persistent_keepalive: Option<u16>,
    /// Client interface MTU.
    #[serde(default)]
    pub mtu: Option<u16>,
}

impl ClientProfile {
    /// Creates a profile with default routes for the given server key.
    #[must_use]
    pub fn new(server_public_key: PublicKey) -> Self {
        Self {
            server_public_key,
            endpoint: None,
            dns: Vec::new(),
            allowed_ips: default_client_allowed_ips(),
            persistent_keepalive: default_keepalive(),
            mtu: None,
        }
    }

    /// Returns the server as the client's peer.
    #[must_use]
    pub fn server_peer(&self) -> PeerConfig {
        let mut server = PeerConfig::new(self.server_public_key);
        server.allowed_ips.clone_from(&self.allowed_ips);
        server.endpoint.clone_from(&self.endpoint);
        server.persistent_keepalive = self.persistent_keepalive;
        server
    }
}

/// Main provisioning configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionConfig {
    /// `WireGuard` interface name.
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Registry store path.
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,
    /// Address pools.
    #[serde(default)]
    pub pools: PoolsConfig,
    /// Seconds to wait for the registry lock; absent waits forever.
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: Option<u64>,
    /// Whether addresses the daemon knows about are treated as allocated.
    #[serde(default = "default_true")]
    pub cross_check_daemon: bool,
    /// Path of the `wg` tool.
    #[serde(default = "default_wg_binary")]
    pub wg_binary: String,
    /// Server-side keepalive pushed with new peers.
    #[serde(default)]
    pub persistent_keepalive: Option<u16>,
    /// Client configuration profile.
    #[serde(default)]
    pub client: Option<ClientProfile>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            registry_path: default_registry_path(),
            pools: PoolsConfig::default(),
            lock_timeout_secs: default_lock_timeout_secs(),
            cross_check_daemon: true,
            wg_binary: default_wg_binary(),
            persistent_keepalive: None,
            client: None,
        }
    }
}

impl ProvisionConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ProvisionError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ProvisionError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Returns the lock timeout.
    #[must_use]
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_secs.map(Duration::from_secs)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.interface.is_empty() {
            return Err(ProvisionError::Config("interface cannot be empty".to_string()));
        }

        if self.interface.len() > MAX_INTERFACE_NAME {
            return Err(ProvisionError::Config(format!(
                "interface cannot exceed {MAX_INTERFACE_NAME} characters"
            )));
        }

        if !self
            .interface
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(ProvisionError::Config(
                "interface must contain only alphanumeric characters, '-', '_' and '.'"
                    .to_string(),
            ));
        }

        if self.registry_path.as_os_str().is_empty() {
            return Err(ProvisionError::Config("registry_path cannot be empty".to_string()));
        }

        if self.pools.iter().next().is_none() {
            return Err(ProvisionError::Config(
                "at least one address pool must be configured".to_string(),
            ));
        }

        for family in [AddressFamily::Ipv4, AddressFamily::Ipv6] {
            if let Some(pool) = self.pools.get(family)
                && pool.family() != family
            {
                return Err(ProvisionError::Config(format!(
                    "pools.{family} is an {} network: {pool}",
                    pool.family()
                )));
            }
        }

        if self.lock_timeout_secs == Some(0) {
            return Err(ProvisionError::Config(
                "lock_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.wg_binary.is_empty() {
            return Err(ProvisionError::Config("wg_binary cannot be empty".to_string()));
        }

        if let Some(ref client) = self.client
            && client.allowed_ips.is_empty()
        {
            return Err(ProvisionError::Config(
                "client.allowed_ips cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
