//! Pushing committed registry changes to the daemon.
//!
//! The registry is committed before the daemon is told anything. When the
//! daemon refuses an add, the registry entry is removed again. A refused
//! remove is never re-added to the registry. When the daemon cannot be
//! reached at all, the registry stays committed and the caller retries the
//! push alone.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use meshgate_registry::{PeerRecord, PeerRegistry, RegistryError};
use meshgate_wireguard::{PeerDaemon, PublicKey, WireGuardError};
use thiserror::Error;
use tracing::{debug, info, warn};

/// A committed registry change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// A peer was added.
    Add(Box<PeerRecord>),
    /// A peer was removed.
    Remove(PublicKey),
}

impl Mutation {
    /// Returns the key of the affected peer.
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        match self {
            Self::Add(record) => &record.public_key,
            Self::Remove(public_key) => public_key,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Add(_) => "add",
            Self::Remove(_) => "remove",
        }
    }
}

/// Outcome of the compensating registry change after a failed push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rollback {
    /// No compensation was attempted; the registry keeps the change.
    NotAttempted,
    /// The registry change was undone.
    Applied,
    /// Undoing the registry change failed; the registry keeps the change.
    Failed(String),
}

impl fmt::Display for Rollback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAttempted => write!(f, "registry kept"),
            Self::Applied => write!(f, "registry rolled back"),
            Self::Failed(reason) => write!(f, "rollback failed: {reason}"),
        }
    }
}

/// Why a push failed.
#[derive(Debug, Error)]
pub enum SyncFailure {
    /// The daemon refused the instruction or could not be reached.
    #[error(transparent)]
    Daemon(#[from] WireGuardError),

    /// The registry no longer reflects the change; nothing was pushed.
    #[error("registry moved on to generation {current} and no longer reflects this change")]
    Stale {
        /// The generation found in the registry.
        current: u64,
    },

    /// The registry could not be read to check the change.
    #[error("could not read registry: {0}")]
    Registry(Box<RegistryError>),

    /// A blocking registry task panicked or was cancelled.
    #[error("registry task failed: {0}")]
    Task(String),
}

/// A committed change that the daemon does not reflect.
#[derive(Debug, Error)]
#[error(
    "failed to push {} of peer {} (generation {generation}): {failure}; {rollback}",
    mutation.kind(),
    mutation.public_key().short()
)]
pub struct SyncError {
    /// The cause.
    #[source]
    pub failure: SyncFailure,
    /// True if the same push may succeed when retried.
    pub transient: bool,
    /// What happened to the registry change.
    pub rollback: Rollback,
    /// The change that was pushed.
    pub mutation: Mutation,
    /// The registry generation the change was committed at.
    pub generation: u64,
}

impl SyncError {
    /// Returns true if the registry still holds the change.
    #[must_use]
    pub fn registry_kept(&self) -> bool {
        self.rollback != Rollback::Applied
    }
}

/// Brings the daemon in line with single registry commits.
#[derive(Debug)]
pub struct SyncController<D> {
    registry: Arc<PeerRegistry>,
    daemon: D,
    interface: String,
    lock_timeout: Option<Duration>,
    persistent_keepalive: Option<u16>,
}

impl<D: PeerDaemon> SyncController<D> {
    /// Creates a controller for one interface.
    #[must_use]
    pub fn new(registry: Arc<PeerRegistry>, daemon: D, interface: impl Into<String>) -> Self {
        Self {
            registry,
            daemon,
            interface: interface.into(),
            lock_timeout: None,
            persistent_keepalive: None,
        }
    }

    /// Sets how long a rollback waits for the registry lock.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the keepalive interval pushed with added peers.
    #[must_use]
    pub fn with_persistent_keepalive(mut self, seconds: Option<u16>) -> Self {
        self.persistent_keepalive = seconds;
        self
    }

    /// Returns the daemon.
    #[must_use]
    pub fn daemon(&self) -> &D {
        &self.daemon
    }

    /// Returns the interface name.
    #[must_use]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Pushes a change committed at `generation` to the daemon.
    ///
    /// Issues exactly one daemon instruction, or none when the registry no
    /// longer reflects the change. The registry lock is never held while
    /// the daemon is called.
    ///
    /// # Errors
    ///
    /// Returns a [`SyncError`] describing the failure and the rollback
    /// outcome.
    pub async fn apply(&self, generation: u64, mutation: &Mutation) -> Result<(), SyncError> {
        let fail = |failure: SyncFailure, transient: bool, rollback: Rollback| SyncError {
            failure,
            transient,
            rollback,
            mutation: mutation.clone(),
            generation,
        };

        if let Err((failure, transient)) = self.check_current(generation, mutation).await {
            return Err(fail(failure, transient, Rollback::NotAttempted));
        }

        let peer = mutation.public_key().short();
        let result = match mutation {
            Mutation::Add(record) => {
                let mut config = record.to_peer_config();
                config.persistent_keepalive = self.persistent_keepalive;
                self.daemon.add_peer(&self.interface, &config).await
            }
            Mutation::Remove(public_key) => self.daemon.remove_peer(&self.interface, public_key).await,
        };

        let Err(err) = result else {
            debug!(interface = %self.interface, %peer, generation, op = mutation.kind(), "daemon in sync");
            return Ok(());
        };

        let transient = err.is_transient();
        let rollback = match mutation {
            Mutation::Add(record) if !transient => self.roll_back_add(record.public_key).await,
            _ => Rollback::NotAttempted,
        };

        warn!(
            interface = %self.interface,
            %peer,
            generation,
            op = mutation.kind(),
            transient,
            %rollback,
            error = %err,
            "daemon push failed"
        );
        Err(fail(SyncFailure::Daemon(err), transient, rollback))
    }

    async fn check_current(
        &self,
        generation: u64,
        mutation: &Mutation,
    ) -> Result<(), (SyncFailure, bool)> {
        let registry = Arc::clone(&self.registry);
        let view = match tokio::task::spawn_blocking(move || registry.snapshot()).await {
            Ok(Ok(view)) => view,
            Ok(Err(err)) => {
                let transient = err.is_retryable();
                return Err((SyncFailure::Registry(Box::new(err)), transient));
            }
            Err(err) => return Err((SyncFailure::Task(err.to_string()), false)),
        };

        if view.generation() == generation {
            return Ok(());
        }

        let reflected = match mutation {
            Mutation::Add(record) => view
                .get(&record.public_key)
                .is_some_and(|current| current.allowed_ips == record.allowed_ips),
            Mutation::Remove(public_key) => !view.contains(public_key),
        };
        if reflected {
            return Ok(());
        }

        warn!(
            interface = %self.interface,
            peer = %mutation.public_key().short(),
            generation,
            current = view.generation(),
            "stale change not pushed"
        );
        Err((
            SyncFailure::Stale {
                current: view.generation(),
            },
            false,
        ))
    }

    async fn roll_back_add(&self, public_key: PublicKey) -> Rollback {
        let registry = Arc::clone(&self.registry);
        let timeout = self.lock_timeout;

        let result = tokio::task::spawn_blocking(move || -> meshgate_registry::Result<Option<u64>> {
            let mut tx = registry.begin_with_timeout(timeout)?;
            match tx.remove(&public_key) {
                Ok(_) => tx.commit().map(|view| Some(view.generation())),
                Err(RegistryError::NotFound(_)) => Ok(None),
                Err(err) => Err(err),
            }
        })
        .await;

        match result {
            Ok(Ok(Some(generation))) => {
                info!(peer = %public_key.short(), generation, "rolled back registry add");
                Rollback::Applied
            }
            Ok(Ok(None)) => {
                debug!(peer = %public_key.short(), "peer already absent from registry");
                Rollback::Applied
            }
            Ok(Err(err)) => Rollback::Failed(err.to_string()),
            Err(err) => Rollback::Failed(err.to_string()),
        }
    }
}
