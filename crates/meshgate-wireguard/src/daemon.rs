//! Control interface of the running `WireGuard` daemon.
//!
//! The daemon is an external system: the core only tells it to add or remove
//! a peer and reads back its live peer table. Adds are upserts and removing an
//! absent peer succeeds, which is how `wg set` behaves.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::PeerConfig;
use crate::error::{Result, WireGuardError};
use crate::keys::PublicKey;
use crate::types::PeerStatus;

/// Instructions the provisioning core can issue to the daemon.
pub trait PeerDaemon: Send + Sync {
    /// Adds (or replaces) a peer on the interface.
    fn add_peer(&self, interface: &str, peer: &PeerConfig)
    -> impl Future<Output = Result<()>> + Send;

    /// Removes a peer from the interface by identity.
    fn remove_peer(
        &self,
        interface: &str,
        public_key: &PublicKey,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Returns the live peer table of the interface.
    fn peers(&self, interface: &str) -> impl Future<Output = Result<Vec<PeerStatus>>> + Send;
}

/// Which instruction the fake daemon should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOn {
    /// Fail `add_peer`.
    Add,
    /// Fail `remove_peer`.
    Remove,
    /// Fail `peers`.
    List,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    on: FailOn,
    transient: bool,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct FakeState {
    interfaces: HashMap<String, HashMap<PublicKey, PeerStatus>>,
    failures: Vec<InjectedFailure>,
    instructions: usize,
}

impl FakeState {
    fn take_failure(&mut self, on: FailOn) -> Option<WireGuardError> {
        let idx = self.failures.iter().position(|f| f.on == on)?;
        let failure = self.failures[idx].clone();
        match failure.remaining {
            Some(1) => {
                self.failures.remove(idx);
            }
            Some(n) => self.failures[idx].remaining = Some(n - 1),
            None => {}
        }
        let message = format!("injected {on:?} failure");
        Some(if failure.transient {
            WireGuardError::DaemonUnavailable(message)
        } else {
            WireGuardError::DaemonRejected(message)
        })
    }
}

/// An in-memory daemon for tests.
#[derive(Clone, Default)]
pub struct FakeDaemon {
    state: Arc<RwLock<FakeState>>,
}

impl FakeDaemon {
    /// Creates a fake daemon with no interfaces.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following call of the given kind fail.
    pub async fn fail(&self, on: FailOn, transient: bool) {
        self.state.write().await.failures.push(InjectedFailure {
            on,
            transient,
            remaining: None,
        });
    }

    /// Makes the next `times` calls of the given kind fail.
    pub async fn fail_times(&self, on: FailOn, transient: bool, times: usize) {
        if times == 0 {
            return;
        }
        self.state.write().await.failures.push(InjectedFailure {
            on,
            transient,
            remaining: Some(times),
        });
    }

    /// Clears all injected failures.
    pub async fn heal(&self) {
        self.state.write().await.failures.clear();
    }

    /// Adds traffic counters to a live peer.
    pub async fn simulate_traffic(
        &self,
        interface: &str,
        public_key: &PublicKey,
        rx_bytes: u64,
        tx_bytes: u64,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let peer = state
            .interfaces
            .get_mut(interface)
            .and_then(|peers| peers.get_mut(public_key))
            .ok_or_else(|| WireGuardError::DaemonRejected(format!("no peer {public_key}")))?;

        peer.rx_bytes = peer.rx_bytes.saturating_add(rx_bytes);
        peer.tx_bytes = peer.tx_bytes.saturating_add(tx_bytes);
        Ok(())
    }

    /// Inserts a peer directly, bypassing the provisioning core.
    pub async fn insert_live_peer(&self, interface: &str, status: PeerStatus) {
        self.state
            .write()
            .await
            .interfaces
            .entry(interface.to_string())
            .or_default()
            .insert(status.public_key, status);
    }

    /// Returns true if the interface currently has the peer.
    pub async fn has_peer(&self, interface: &str, public_key: &PublicKey) -> bool {
        self.state
            .read()
            .await
            .interfaces
            .get(interface)
            .is_some_and(|peers| peers.contains_key(public_key))
    }

    /// Returns the number of live peers on the interface.
    pub async fn peer_count(&self, interface: &str) -> usize {
        self.state
            .read()
            .await
            .interfaces
            .get(interface)
            .map_or(0, HashMap::len)
    }

    /// Returns how many add/remove instructions were accepted.
    pub async fn instruction_count(&self) -> usize {
        self.state.read().await.instructions
    }
}

impl PeerDaemon for FakeDaemon {
    async fn add_peer(&self, interface: &str, peer: &PeerConfig) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(err) = state.take_failure(FailOn::Add) {
            return Err(err);
        }

        let peers = state.interfaces.entry(interface.to_string()).or_default();
        let status = peers
            .entry(peer.public_key)
            .or_insert_with(|| PeerStatus::new(peer.public_key));
        status.allowed_ips.clone_from(&peer.allowed_ips);
        status.endpoint = peer.endpoint.as_ref().map(ToString::to_string);
        state.instructions += 1;
        Ok(())
    }

    async fn remove_peer(&self, interface: &str, public_key: &PublicKey) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(err) = state.take_failure(FailOn::Remove) {
            return Err(err);
        }

        if let Some(peers) = state.interfaces.get_mut(interface) {
            peers.remove(public_key);
        }
        state.instructions += 1;
        Ok(())
    }

    async fn peers(&self, interface: &str) -> Result<Vec<PeerStatus>> {
        let mut state = self.state.write().await;
        if let Some(err) = state.take_failure(FailOn::List) {
            return Err(err);
        }

        Ok(state
            .interfaces
            .get(interface)
            .map(|peers| peers.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PrivateKey;
    use crate::types::AllowedIp;

    fn test_peer() -> PeerConfig {
        let public_key = PrivateKey::generate().public_key();
        PeerConfig::new(public_key)
            .with_allowed_ip(AllowedIp::from_cidr("10.25.0.2/32").expect("valid cidr"))
    }

    #[tokio::test]
    async fn add_and_list_peer() {
        let daemon = FakeDaemon::new();
        let peer = test_peer();

        daemon.add_peer("wg0", &peer).await.expect("add");

        let peers = daemon.peers("wg0").await.expect("list");
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].public_key, peer.public_key);
        assert_eq!(peers[0].allowed_ips, peer.allowed_ips);
    }

    #[tokio::test]
    async fn add_is_upsert() {
        let daemon = FakeDaemon::new();
        let peer = test_peer();
        daemon.add_peer("wg0", &peer).await.expect("first add");

        let moved = peer
            .clone()
            .with_allowed_ip(AllowedIp::from_cidr("fd42::2/128").expect("valid cidr"));
        daemon.add_peer("wg0", &moved).await.expect("second add");

        assert_eq!(daemon.peer_count("wg0").await, 1);
        let peers = daemon.peers("wg0").await.expect("list");
        assert_eq!(peers[0].allowed_ips.len(), 2);
    }

    #[tokio::test]
    async fn remove_absent_peer_succeeds() {
        let daemon = FakeDaemon::new();
        let key = PrivateKey::generate().public_key();
        assert!(daemon.remove_peer("wg0", &key).await.is_ok());
    }

    #[tokio::test]
    async fn injected_failure_is_classified() {
        let daemon = FakeDaemon::new();
        daemon.fail(FailOn::Add, true).await;
        let err = daemon
            .add_peer("wg0", &test_peer())
            .await
            .expect_err("add must fail");
        assert!(err.is_transient());

        daemon.heal().await;
        daemon.fail(FailOn::Remove, false).await;
        let key = PrivateKey::generate().public_key();
        let err = daemon
            .remove_peer("wg0", &key)
            .await
            .expect_err("remove must fail");
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn fail_times_expires() {
        let daemon = FakeDaemon::new();
        daemon.fail_times(FailOn::List, true, 2).await;

        assert!(daemon.peers("wg0").await.is_err());
        assert!(daemon.peers("wg0").await.is_err());
        assert!(daemon.peers("wg0").await.is_ok());
    }

    #[tokio::test]
    async fn simulate_traffic_accumulates() {
        let daemon = FakeDaemon::new();
        let peer = test_peer();
        daemon.add_peer("wg0", &peer).await.expect("add");

        daemon
            .simulate_traffic("wg0", &peer.public_key, 1000, 500)
            .await
            .expect("traffic");
        daemon
            .simulate_traffic("wg0", &peer.public_key, 1, 1)
            .await
            .expect("traffic");

        let peers = daemon.peers("wg0").await.expect("list");
        assert_eq!(peers[0].rx_bytes, 1001);
        assert_eq!(peers[0].tx_bytes, 501);
        assert_eq!(daemon.instruction_count().await, 1);
    }
}
