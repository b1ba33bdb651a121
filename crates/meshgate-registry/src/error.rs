//! Error types for address pools and the peer registry.

use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use ipnet::IpNet;
use meshgate_wireguard::{AddressFamily, AllowedIp, PublicKey};
use thiserror::Error;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// What an added record collided with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// The public key is already registered.
    PublicKey,
    /// An allowed address overlaps an address of another record.
    Address {
        /// The requested address.
        address: AllowedIp,
        /// The peer that already holds it.
        owner: PublicKey,
    },
}

/// Errors that can occur in the address pool and the peer registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Every host address of the pool is allocated.
    #[error("address pool {network} is exhausted")]
    Exhausted {
        /// The exhausted network.
        network: IpNet,
    },

    /// A pool was built from a CIDR of the wrong family.
    #[error("pool {network} is not an {expected} network")]
    FamilyMismatch {
        /// The offending network.
        network: IpNet,
        /// The family the pool was declared for.
        expected: AddressFamily,
    },

    /// The pool is too small to hold a single peer.
    #[error("pool {0} has no host addresses")]
    NoHosts(IpNet),

    /// The record collides with an existing record.
    #[error("duplicate peer {}: {}", public_key.short(), describe(conflict))]
    DuplicateKey {
        /// The key of the rejected record.
        public_key: PublicKey,
        /// What it collided with.
        conflict: Conflict,
    },

    /// No record with this key exists.
    #[error("peer {} not found", .0.short())]
    NotFound(PublicKey),

    /// Reading or writing the store failed.
    #[error("storage error at {}: {source}", path.display())]
    Storage {
        /// Path that failed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The store exists but cannot be parsed.
    #[error("corrupt store at line {line}: {message}")]
    Corrupt {
        /// Line number in the store (1-based, 0 when unknown).
        line: usize,
        /// Description of the problem.
        message: String,
    },

    /// The exclusive lock was not granted before the deadline.
    #[error("timed out after {waited:?} waiting for lock on {}", path.display())]
    LockTimeout {
        /// Lock file path.
        path: PathBuf,
        /// How long the caller waited.
        waited: Duration,
    },

    /// Invalid CIDR notation.
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),
}

fn describe(conflict: &Conflict) -> String {
    match conflict {
        Conflict::PublicKey => "public key already registered".to_string(),
        Conflict::Address { address, owner } => {
            format!("address {address} already held by {}", owner.short())
        }
    }
}

impl RegistryError {
    /// Builds a storage error for the given path.
    pub(crate) fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Builds an exhaustion error for the given network.
    pub(crate) fn exhausted(network: IpNet) -> Self {
        Self::Exhausted { network }
    }

    /// Returns true if retrying the whole operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::LockTimeout { .. })
    }

    /// Returns the address a duplicate record collided on, if any.
    #[must_use]
    pub fn conflicting_address(&self) -> Option<IpAddr> {
        match self {
            Self::DuplicateKey {
                conflict: Conflict::Address { address, .. },
                ..
            } => Some(address.addr()),
            _ => None,
        }
    }
}
