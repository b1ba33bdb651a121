//! Address pools and the persisted peer registry.
//!
//! [`AddressPool`] picks the next free address of a CIDR. [`PeerRegistry`]
//! is the authoritative, file-backed set of peers, changed only through
//! locked [`Transaction`]s that replace the store atomically.

pub mod codec;
pub mod error;
pub mod lock;
pub mod pool;
pub mod record;
pub mod registry;

pub use error::{Conflict, RegistryError, Result};
pub use lock::{LockMode, StoreLock};
pub use pool::{AddressPool, DEFAULT_IPV4_POOL, DEFAULT_IPV6_POOL};
pub use record::{PeerRecord, ProvisionedPeer};
pub use registry::{CommittedView, PeerRegistry, Transaction};
