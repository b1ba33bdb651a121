//! Adding and removing peers.
//!
//! Every operation commits the registry first and then pushes the change
//! to the daemon through the [`SyncController`]. Registry work is file I/O
//! under a process lock and runs on the blocking pool.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use meshgate_registry::{
    AddressPool, CommittedView, PeerRecord, PeerRegistry, ProvisionedPeer, RegistryError,
};
use meshgate_wireguard::{
    AddressFamily, AllowedIp, ClientConfig, KeySource, OsKeySource, PeerDaemon, PublicKey,
    WgCommandDaemon,
};
use tracing::{debug, info, warn};

use crate::config::{ClientProfile, ProvisionConfig};
use crate::error::{ProvisionError, Result};
use crate::sync::{Mutation, SyncController, SyncError};
use crate::transfer::TransferReport;

/// Runs registry work on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> meshgate_registry::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProvisionError::Task(e.to_string()))?
        .map_err(ProvisionError::from)
}

/// Composes pools, key generation, registry and daemon sync into
/// `add_peer` / `remove_peer`.
pub struct PeerLifecycleManager<D, K = OsKeySource> {
    registry: Arc<PeerRegistry>,
    sync: SyncController<D>,
    keys: K,
    pools: BTreeMap<AddressFamily, AddressPool>,
    lock_timeout: Option<Duration>,
    cross_check: bool,
    client: Option<ClientProfile>,
}

impl PeerLifecycleManager<WgCommandDaemon> {
    /// Builds a manager that drives the `wg` tool named in the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the registry
    /// cannot be opened.
    pub fn from_config(config: &ProvisionConfig) -> Result<Self> {
        Self::with_config(config, WgCommandDaemon::with_binary(&config.wg_binary))
    }
}

impl<D: PeerDaemon> PeerLifecycleManager<D> {
    /// Creates a manager with no pools and no lock timeout.
    #[must_use]
    pub fn new(registry: Arc<PeerRegistry>, daemon: D, interface: impl Into<String>) -> Self {
        Self {
            sync: SyncController::new(Arc::clone(&registry), daemon, interface),
            registry,
            keys: OsKeySource,
            pools: BTreeMap::new(),
            lock_timeout: None,
            cross_check: false,
            client: None,
        }
    }

    /// Builds a manager from configuration with the given daemon.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the registry
    /// cannot be opened.
    pub fn with_config(config: &ProvisionConfig, daemon: D) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(PeerRegistry::open(config.registry_path.clone())?);

        let mut manager = Self::new(registry, daemon, config.interface.clone())
            .with_lock_timeout(config.lock_timeout())
            .with_daemon_cross_check(config.cross_check_daemon)
            .with_persistent_keepalive(config.persistent_keepalive);
        for pool in config.pools.iter() {
            manager = manager.with_pool(*pool);
        }
        if let Some(ref client) = config.client {
            manager = manager.with_client_profile(client.clone());
        }
        Ok(manager)
    }
}

impl<D: PeerDaemon, K: KeySource> PeerLifecycleManager<D, K> {
    /// Sets the pool for its family, replacing any previous one.
    #[must_use]
    pub fn with_pool(mut self, pool: AddressPool) -> Self {
        self.pools.insert(pool.family(), pool);
        self
    }

    /// Sets how long registry transactions wait for the lock.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self.sync = self.sync.with_lock_timeout(timeout);
        self
    }

    /// Treats addresses on the live daemon as allocated.
    #[must_use]
    pub fn with_daemon_cross_check(mut self, enabled: bool) -> Self {
        self.cross_check = enabled;
        self
    }

    /// Sets the keepalive pushed to the daemon with new peers.
    #[must_use]
    pub fn with_persistent_keepalive(mut self, seconds: Option<u16>) -> Self {
        self.sync = self.sync.with_persistent_keepalive(seconds);
        self
    }

    /// Sets the profile used to render client configurations.
    #[must_use]
    pub fn with_client_profile(mut self, profile: ClientProfile) -> Self {
        self.client = Some(profile);
        self
    }

    /// Replaces the key source.
    #[must_use]
    pub fn with_key_source<K2: KeySource>(self, keys: K2) -> PeerLifecycleManager<D, K2> {
        PeerLifecycleManager {
            registry: self.registry,
            sync: self.sync,
            keys,
            pools: self.pools,
            lock_timeout: self.lock_timeout,
            cross_check: self.cross_check,
            client: self.client,
        }
    }

    /// Returns the registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Returns the sync controller.
    #[must_use]
    pub fn sync(&self) -> &SyncController<D> {
        &self.sync
    }

    /// Returns the store path.
    #[must_use]
    pub fn registry_path(&self) -> PathBuf {
        self.registry.path().to_path_buf()
    }

    /// Provisions a new peer with one address from each requested family.
    ///
    /// The returned value holds the peer's private key; it is not stored
    /// anywhere.
    ///
    /// # Errors
    ///
    /// Allocation and registry failures leave the registry unchanged. A
    /// [`ProvisionError::Sync`] means the registry was committed; it says
    /// whether the add was rolled back and, when it was not, carries the
    /// provisioned peer.
    pub async fn add_peer(&self, families: &[AddressFamily]) -> Result<ProvisionedPeer> {
        let mut requested: Vec<AddressFamily> = Vec::with_capacity(families.len());
        for family in families {
            if !requested.contains(family) {
                requested.push(*family);
            }
        }
        if requested.is_empty() {
            return Err(ProvisionError::NoFamilies);
        }
        let pools = requested
            .iter()
            .map(|family| {
                self.pools
                    .get(family)
                    .copied()
                    .ok_or(ProvisionError::NoPool(*family))
            })
            .collect::<Result<Vec<_>>>()?;

        let live = self.live_allowed_ips().await;

        let key_pair = self.keys.generate_key_pair();
        let preshared_key = self.keys.generate_preshared_key();
        let public_key = *key_pair.public_key();

        let registry = Arc::clone(&self.registry);
        let timeout = self.lock_timeout;
        let (record, generation) = blocking(move || {
            let mut tx = registry.begin_with_timeout(timeout)?;

            let mut allowed_ips = Vec::with_capacity(pools.len());
            for pool in &pools {
                let mut allocated = tx.allocated_addresses(pool.family());
                let mut subnets = tx.allocated_subnets(pool.family());
                for ip in live.iter().filter(|ip| ip.family() == pool.family()) {
                    if ip.is_host() {
                        allocated.insert(ip.addr());
                    } else {
                        subnets.push(*ip.network());
                    }
                }
                allowed_ips.push(pool.allocate_host(&allocated, &subnets)?);
            }

            let record = PeerRecord::new(public_key, Some(preshared_key), allowed_ips);
            tx.add(record.clone())?;
            let view = tx.commit()?;
            Ok((record, view.generation()))
        })
        .await?;

        let addresses: Vec<String> = record.allowed_ips.iter().map(ToString::to_string).collect();
        info!(
            peer = %public_key.short(),
            addresses = %addresses.join(","),
            generation,
            "peer registered"
        );

        let provisioned = ProvisionedPeer {
            record,
            private_key: key_pair.into_private_key(),
        };

        if let Err(err) = self
            .sync
            .apply(generation, &Mutation::Add(Box::new(provisioned.record.clone())))
            .await
        {
            let peer = err.registry_kept().then(|| Box::new(provisioned));
            return Err(ProvisionError::Sync {
                source: Box::new(err),
                peer,
            });
        }

        Ok(provisioned)
    }

    /// Revokes a peer.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Registry`] with
    /// [`RegistryError::NotFound`] if the peer is not registered (see
    /// [`ProvisionError::is_not_found`]). A [`ProvisionError::Sync`] means the
    /// peer is gone from the registry but may still be live on the daemon.
    pub async fn remove_peer(&self, public_key: &PublicKey) -> Result<PeerRecord> {
        let registry = Arc::clone(&self.registry);
        let timeout = self.lock_timeout;
        let key = *public_key;
        let (record, generation) = blocking(move || {
            let mut tx = registry.begin_with_timeout(timeout)?;
            let record = tx.remove(&key)?;
            let view = tx.commit()?;
            Ok((record, view.generation()))
        })
        .await?;

        info!(peer = %public_key.short(), generation, "peer unregistered");

        self.sync
            .apply(generation, &Mutation::Remove(*public_key))
            .await
            .map_err(|err| ProvisionError::Sync {
                source: Box::new(err),
                peer: None,
            })?;

        Ok(record)
    }

    /// Retries the daemon push of a failed operation without touching the
    /// registry.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Sync`] if the push fails again.
    pub async fn resync(&self, failed: &SyncError) -> Result<()> {
        debug!(
            peer = %failed.mutation.public_key().short(),
            generation = failed.generation,
            "retrying daemon push"
        );
        self.sync
            .apply(failed.generation, &failed.mutation)
            .await
            .map_err(|err| ProvisionError::Sync {
                source: Box::new(err),
                peer: None,
            })
    }

    /// Returns the current committed registry state.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn list_peers(&self) -> Result<Arc<CommittedView>> {
        let registry = Arc::clone(&self.registry);
        blocking(move || registry.snapshot()).await
    }

    /// Looks up a registered peer.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if the peer is not registered.
    pub async fn get_peer(&self, public_key: &PublicKey) -> Result<PeerRecord> {
        let view = self.list_peers().await?;
        view.get(public_key)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(*public_key).into())
    }

    /// Joins registered peers with the daemon's traffic counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or the daemon cannot be read.
    pub async fn transfer_report(&self) -> Result<TransferReport> {
        let view = self.list_peers().await?;
        let live = self.sync.daemon().peers(self.sync.interface()).await?;
        Ok(TransferReport::build(&view, &live))
    }

    /// Renders the wg-quick configuration for a freshly provisioned peer.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Config`] if no client profile is set.
    pub fn client_config(&self, peer: &ProvisionedPeer) -> Result<ClientConfig> {
        let profile = self.client.as_ref().ok_or_else(|| {
            ProvisionError::Config("no client profile configured".to_string())
        })?;

        let mut config = peer.client_config(profile.server_peer());
        config.dns.clone_from(&profile.dns);
        config.mtu = profile.mtu;
        Ok(config)
    }

    async fn live_allowed_ips(&self) -> Vec<AllowedIp> {
        if !self.cross_check {
            return Vec::new();
        }

        match self.sync.daemon().peers(self.sync.interface()).await {
            Ok(peers) => peers.into_iter().flat_map(|p| p.allowed_ips).collect(),
            Err(err) => {
                warn!(
                    interface = %self.sync.interface(),
                    error = %err,
                    "could not read live peers, allocating from registry only"
                );
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_wireguard::{FailOn, FakeDaemon, KEY_SIZE, PeerStatus};
    use tempfile::TempDir;

    fn manager(pools: &[&str]) -> (TempDir, FakeDaemon, PeerLifecycleManager<FakeDaemon>) {
        let dir = tempfile::tempdir().expect("temp dir");
        let registry =
            Arc::new(PeerRegistry::open(dir.path().join("wg0.conf")).expect("open registry"));
        let daemon = FakeDaemon::new();
        let mut manager = PeerLifecycleManager::new(registry, daemon.clone(), "wg0")
            .with_lock_timeout(Some(Duration::from_secs(5)));
        for cidr in pools {
            manager = manager.with_pool(AddressPool::from_cidr(cidr).expect("valid pool"));
        }
        (dir, daemon, manager)
    }

    // ==================== Add Tests ====================

    #[tokio::test]
    async fn add_peer_dual_stack() {
        let (_dir, daemon, manager) = manager(&["10.25.0.0/16", "fd42:42:42::/112"]);

        let peer = manager
            .add_peer(&[AddressFamily::Ipv4, AddressFamily::Ipv6])
            .await
            .expect("add peer");

        let cidrs: Vec<String> = peer.record.allowed_ips.iter().map(ToString::to_string).collect();
        assert_eq!(cidrs, vec!["10.25.0.2/32", "fd42:42:42::2/128"]);
        assert_eq!(peer.private_key.public_key(), *peer.public_key());
        assert!(peer.record.preshared_key.is_some());
        assert!(daemon.has_peer("wg0", peer.public_key()).await);
    }

    #[tokio::test]
    async fn add_peer_requires_family_and_pool() {
        let (_dir, _daemon, manager) = manager(&["10.25.0.0/16"]);

        assert!(matches!(manager.add_peer(&[]).await, Err(ProvisionError::NoFamilies)));
        assert!(matches!(
            manager.add_peer(&[AddressFamily::Ipv6]).await,
            Err(ProvisionError::NoPool(AddressFamily::Ipv6))
        ));
        assert!(manager.list_peers().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn duplicate_families_allocate_once() {
        let (_dir, _daemon, manager) = manager(&["10.25.0.0/16"]);
        let peer = manager
            .add_peer(&[AddressFamily::Ipv4, AddressFamily::Ipv4])
            .await
            .expect("add peer");
        assert_eq!(peer.record.allowed_ips.len(), 1);
    }

    #[tokio::test]
    async fn cross_check_skips_live_addresses() {
        let (_dir, daemon, manager) = manager(&["10.25.0.0/16"]);
        let manager = manager.with_daemon_cross_check(true);

        let mut stray = PeerStatus::new(PublicKey::from_bytes_array([9u8; KEY_SIZE]));
        stray.allowed_ips.push(AllowedIp::from_cidr("10.25.0.2/32").expect("valid cidr"));
        daemon.insert_live_peer("wg0", stray).await;

        let peer = manager.add_peer(&[AddressFamily::Ipv4]).await.expect("add peer");
        assert_eq!(peer.record.allowed_ips[0].to_string(), "10.25.0.3/32");
    }

    #[tokio::test]
    async fn cross_check_skips_live_subnets() {
        let (_dir, daemon, manager) = manager(&["10.25.0.0/16"]);
        let manager = manager.with_daemon_cross_check(true);

        let mut site = PeerStatus::new(PublicKey::from_bytes_array([8u8; KEY_SIZE]));
        site.allowed_ips.push(AllowedIp::from_cidr("10.25.0.0/29").expect("valid cidr"));
        site.allowed_ips.push(AllowedIp::from_cidr("192.168.0.0/16").expect("valid cidr"));
        daemon.insert_live_peer("wg0", site).await;

        let peer = manager.add_peer(&[AddressFamily::Ipv4]).await.expect("add peer");
        assert_eq!(peer.record.allowed_ips[0].to_string(), "10.25.0.8/32");
    }

    #[tokio::test]
    async fn cross_check_failure_falls_back_to_registry() {
        let (_dir, daemon, manager) = manager(&["10.25.0.0/16"]);
        let manager = manager.with_daemon_cross_check(true);
        daemon.fail_times(FailOn::List, true, 1).await;

        let peer = manager.add_peer(&[AddressFamily::Ipv4]).await.expect("add peer");
        assert_eq!(peer.record.allowed_ips[0].to_string(), "10.25.0.2/32");
    }

    // ==================== Remove and Sync Tests ====================

    #[tokio::test]
    async fn remove_peer_reaches_daemon() {
        let (_dir, daemon, manager) = manager(&["10.25.0.0/16"]);
        let peer = manager.add_peer(&[AddressFamily::Ipv4]).await.expect("add peer");

        let removed = manager.remove_peer(peer.public_key()).await.expect("remove");
        assert_eq!(removed, peer.record);
        assert!(!daemon.has_peer("wg0", peer.public_key()).await);
        assert!(manager.get_peer(peer.public_key()).await.is_err_and(|e| e.is_not_found()));
    }

    #[tokio::test]
    async fn transient_add_failure_returns_peer() {
        let (_dir, daemon, manager) = manager(&["10.25.0.0/16"]);
        daemon.fail_times(FailOn::Add, true, 1).await;

        let err = manager
            .add_peer(&[AddressFamily::Ipv4])
            .await
            .expect_err("daemon unreachable");
        assert!(err.is_retryable());

        let sync_err = err.sync_error().expect("sync error");
        manager.resync(sync_err).await.expect("resync");

        let peer = err.into_provisioned().expect("peer kept");
        assert!(daemon.has_peer("wg0", peer.public_key()).await);
        assert!(manager.get_peer(peer.public_key()).await.is_ok());
    }

    // ==================== Config Tests ====================

    #[tokio::test]
    async fn client_config_needs_profile() {
        let (_dir, _daemon, manager) = manager(&["10.25.0.0/16"]);
        let peer = manager.add_peer(&[AddressFamily::Ipv4]).await.expect("add peer");
        assert!(matches!(
            manager.client_config(&peer),
            Err(ProvisionError::Config(_))
        ));

        let server = PublicKey::from_bytes_array([3u8; KEY_SIZE]);
        let mut profile = ClientProfile::new(server);
        profile.dns.push("10.25.0.1".parse().expect("valid ip"));
        profile.endpoint = Some("vpn.example.com:51820".parse().expect("valid endpoint"));
        let manager = manager.with_client_profile(profile);

        let rendered = manager.client_config(&peer).expect("client config").render();
        assert!(rendered.contains("Address = 10.25.0.2/32"));
        assert!(rendered.contains("DNS = 10.25.0.1"));
        assert!(rendered.contains(&format!("PublicKey = {server}")));
        assert!(rendered.contains("Endpoint = vpn.example.com:51820"));
        assert!(rendered.contains("PersistentKeepalive = 25"));
    }

    #[tokio::test]
    async fn with_config_opens_registry() {
        let dir = tempfile::tempdir().expect("temp dir");
        let toml = format!(
            "interface = \"wg9\"\nregistry_path = \"{}\"\ncross_check_daemon = false\n[pools]\nipv4 = \"10.30.0.0/30\"\n",
            dir.path().join("wg9.conf").display()
        );
        let config = ProvisionConfig::from_toml(&toml).expect("valid config");
        let daemon = FakeDaemon::new();
        let manager = PeerLifecycleManager::with_config(&config, daemon.clone()).expect("manager");

        let peer = manager.add_peer(&[AddressFamily::Ipv4]).await.expect("add peer");
        assert_eq!(peer.record.allowed_ips[0].to_string(), "10.30.0.2/32");
        assert!(daemon.has_peer("wg9", peer.public_key()).await);
        assert_eq!(manager.registry_path(), dir.path().join("wg9.conf"));
    }
}
