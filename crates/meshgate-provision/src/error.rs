//! Error types for peer provisioning.

use meshgate_registry::{ProvisionedPeer, RegistryError};
use meshgate_wireguard::{AddressFamily, WireGuardError};
use thiserror::Error;

use crate::sync::SyncError;

/// Result type alias for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Errors returned by [`PeerLifecycleManager`](crate::PeerLifecycleManager).
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Allocation, registry or storage failure. Nothing reached the daemon.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The registry was committed but the daemon could not be brought in line.
    #[error("{source}")]
    Sync {
        /// What went wrong and whether it was rolled back.
        source: Box<SyncError>,
        /// The provisioned peer, when the registry still holds it.
        peer: Option<Box<ProvisionedPeer>>,
    },

    /// A family was requested that has no pool.
    #[error("no address pool configured for {0}")]
    NoPool(AddressFamily),

    /// No family was requested.
    #[error("at least one address family must be requested")]
    NoFamilies,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A daemon query failed.
    #[error(transparent)]
    Daemon(#[from] WireGuardError),

    /// A blocking registry task panicked or was cancelled.
    #[error("registry task failed: {0}")]
    Task(String),
}

impl ProvisionError {
    /// Returns true if the peer was not registered.
    ///
    /// Callers that want an idempotent delete treat this as success.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Registry(RegistryError::NotFound(_)))
    }

    /// Returns true if a pool ran out of addresses.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Registry(RegistryError::Exhausted { .. }))
    }

    /// Returns true if retrying may succeed.
    ///
    /// For [`ProvisionError::Sync`] the retry is
    /// [`resync`](crate::PeerLifecycleManager::resync), not the whole
    /// operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Registry(err) => err.is_retryable(),
            Self::Sync { source, .. } => source.transient,
            Self::Daemon(err) => err.is_transient(),
            Self::NoPool(_) | Self::NoFamilies | Self::Config(_) | Self::Task(_) => false,
        }
    }

    /// Returns the sync failure, if the error happened after commit.
    #[must_use]
    pub fn sync_error(&self) -> Option<&SyncError> {
        match self {
            Self::Sync { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Takes the provisioned peer out of a sync failure.
    #[must_use]
    pub fn into_provisioned(self) -> Option<ProvisionedPeer> {
        match self {
            Self::Sync { peer, .. } => peer.map(|p| *p),
            _ => None,
        }
    }
}
