//! Peer provisioning for meshgate.
//!
//! [`PeerLifecycleManager`] allocates addresses, generates keys, commits the
//! [`PeerRegistry`](meshgate_registry::PeerRegistry) and pushes the change to
//! the daemon. [`SyncController`] owns the push and its compensating rollback.
//!
//! ```no_run
//! use meshgate_provision::{PeerLifecycleManager, ProvisionConfig};
//! use meshgate_wireguard::AddressFamily;
//!
//! # async fn run() -> meshgate_provision::Result<()> {
//! let config = ProvisionConfig::from_file("/etc/meshgate/provision.toml")?;
//! let manager = PeerLifecycleManager::from_config(&config)?;
//!
//! let peer = manager
//!     .add_peer(&[AddressFamily::Ipv4, AddressFamily::Ipv6])
//!     .await?;
//! manager.remove_peer(peer.public_key()).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod sync;
pub mod transfer;

pub use config::{ClientProfile, PoolsConfig, ProvisionConfig};
pub use error::{ProvisionError, Result};
pub use lifecycle::PeerLifecycleManager;
pub use sync::{Mutation, Rollback, SyncController, SyncError, SyncFailure};
pub use transfer::{PeerTransfer, TransferReport};
