//! The transactional peer registry.
//!
//! All reads and writes of the store go through [`StoreLock`]: snapshots
//! take the shared lock, transactions take the exclusive lock before reading
//! and keep it until commit or drop. A commit writes the whole store to a
//! temporary file and renames it over the old one, so readers see either the
//! previous or the new content.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use meshgate_wireguard::{AddressFamily, PublicKey};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::codec::{parse_store, render_store, StoreDocument};
use crate::error::{Conflict, RegistryError, Result};
use crate::lock::StoreLock;
use crate::record::PeerRecord;

/// A committed state of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommittedView {
    generation: u64,
    peers: Vec<PeerRecord>,
}

impl CommittedView {
    /// Returns the commit counter of this state.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns all peers in store order.
    #[must_use]
    pub fn peers(&self) -> &[PeerRecord] {
        &self.peers
    }

    /// Looks up a peer.
    #[must_use]
    pub fn get(&self, public_key: &PublicKey) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| p.public_key == *public_key)
    }

    /// Returns true if the peer is registered.
    #[must_use]
    pub fn contains(&self, public_key: &PublicKey) -> bool {
        self.get(public_key).is_some()
    }

    /// Returns the number of peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns true if no peer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Returns every address of the given family held by a peer.
    #[must_use]
    pub fn allocated_addresses(&self, family: AddressFamily) -> HashSet<IpAddr> {
        allocated_in(&self.peers, family)
    }

    /// Returns every multi-address network of the given family held by a
    /// peer.
    #[must_use]
    pub fn allocated_subnets(&self, family: AddressFamily) -> Vec<IpNet> {
        subnets_in(&self.peers, family)
    }
}

fn allocated_in(peers: &[PeerRecord], family: AddressFamily) -> HashSet<IpAddr> {
    peers
        .iter()
        .flat_map(|p| p.allowed_ips.iter())
        .filter(|ip| ip.family() == family)
        .map(meshgate_wireguard::AllowedIp::addr)
        .collect()
}

fn subnets_in(peers: &[PeerRecord], family: AddressFamily) -> Vec<IpNet> {
    peers
        .iter()
        .flat_map(|p| p.allowed_ips.iter())
        .filter(|ip| ip.family() == family && !ip.is_host())
        .map(|ip| *ip.network())
        .collect()
}

impl From<&StoreDocument> for CommittedView {
    fn from(doc: &StoreDocument) -> Self {
        Self {
            generation: doc.generation,
            peers: doc.peers.clone(),
        }
    }
}

/// The authoritative set of peers, persisted at one path.
#[derive(Debug)]
pub struct PeerRegistry {
    path: PathBuf,
    lock_path: PathBuf,
    view: RwLock<Arc<CommittedView>>,
}

impl PeerRegistry {
    /// Opens the registry stored at `path`.
    ///
    /// A missing store is an empty registry; it is created by the first
    /// commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let lock_path = StoreLock::path_for(&path);

        let doc = {
            let _lock = StoreLock::shared(&lock_path)?;
            load(&path)?
        };
        debug!(
            path = %path.display(),
            generation = doc.generation,
            peers = doc.peers.len(),
            "registry opened"
        );

        Ok(Self {
            path,
            lock_path,
            view: RwLock::new(Arc::new(CommittedView::from(&doc))),
        })
    }

    /// Returns the store path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the current committed state from the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or parsed.
    pub fn snapshot(&self) -> Result<Arc<CommittedView>> {
        let doc = {
            let _lock = StoreLock::shared(&self.lock_path)?;
            load(&self.path)?
        };
        Ok(self.publish(CommittedView::from(&doc)))
    }

    /// Returns the last state this instance read or committed, without
    /// touching the store.
    #[must_use]
    pub fn cached(&self) -> Arc<CommittedView> {
        Arc::clone(&self.view.read())
    }

    /// Starts a transaction, waiting as long as needed for the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be locked, read or parsed.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        self.begin_with_timeout(None)
    }

    /// Starts a transaction, waiting at most `timeout` for the lock.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::LockTimeout`] if the lock was not granted in
    /// time; nothing has been read or written in that case.
    pub fn begin_with_timeout(&self, timeout: Option<Duration>) -> Result<Transaction<'_>> {
        let lock = StoreLock::exclusive(&self.lock_path, timeout)?;
        let doc = load(&self.path)?;
        let base_generation = doc.generation;
        Ok(Transaction {
            registry: self,
            _lock: lock,
            doc,
            base_generation,
            dirty: false,
        })
    }

    fn publish(&self, view: CommittedView) -> Arc<CommittedView> {
        let view = Arc::new(view);
        let mut cached = self.view.write();
        // Another thread may already have published a newer state.
        if view.generation >= cached.generation {
            *cached = Arc::clone(&view);
        }
        view
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(ToOwned::to_owned).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn write_atomic(&self, content: &str) -> Result<()> {
        let tmp_path = self.temp_path();

        let written = write_synced(&tmp_path, content.as_bytes())
            .map_err(|e| RegistryError::storage(&tmp_path, e))
            .and_then(|()| {
                fs::rename(&tmp_path, &self.path).map_err(|e| RegistryError::storage(&self.path, e))
            });

        if let Err(err) = written {
            if let Err(e) = fs::remove_file(&tmp_path)
                && e.kind() != ErrorKind::NotFound
            {
                warn!(path = %tmp_path.display(), error = %e, "failed to remove temporary store");
            }
            return Err(err);
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty())
            && let Err(e) = File::open(parent).and_then(|dir| dir.sync_all())
        {
            debug!(path = %parent.display(), error = %e, "could not sync store directory");
        }
        Ok(())
    }
}

fn load(path: &Path) -> Result<StoreDocument> {
    match fs::read_to_string(path) {
        Ok(content) => parse_store(&content),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(StoreDocument::default()),
        Err(e) => Err(RegistryError::storage(path, e)),
    }
}

fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

/// A pending change to the registry, holding the exclusive lock.
///
/// Dropping a transaction without committing discards its changes.
#[derive(Debug)]
pub struct Transaction<'a> {
    registry: &'a PeerRegistry,
    _lock: StoreLock,
    doc: StoreDocument,
    base_generation: u64,
    dirty: bool,
}

impl Transaction<'_> {
    /// Returns the generation the transaction started from.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.base_generation
    }

    /// Returns the peers as changed so far.
    #[must_use]
    pub fn peers(&self) -> &[PeerRecord] {
        &self.doc.peers
    }

    /// Looks up a peer in the pending state.
    #[must_use]
    pub fn get(&self, public_key: &PublicKey) -> Option<&PeerRecord> {
        self.doc.peers.iter().find(|p| p.public_key == *public_key)
    }

    /// Returns every address of the family held in the pending state.
    #[must_use]
    pub fn allocated_addresses(&self, family: AddressFamily) -> HashSet<IpAddr> {
        allocated_in(&self.doc.peers, family)
    }

    /// Returns every multi-address network of the family held in the
    /// pending state.
    #[must_use]
    pub fn allocated_subnets(&self, family: AddressFamily) -> Vec<IpNet> {
        subnets_in(&self.doc.peers, family)
    }

    /// Adds a peer.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateKey`] if the key is registered or
    /// one of its addresses overlaps an address of another peer.
    pub fn add(&mut self, record: PeerRecord) -> Result<()> {
        if self.get(&record.public_key).is_some() {
            return Err(RegistryError::DuplicateKey {
                public_key: record.public_key,
                conflict: Conflict::PublicKey,
            });
        }

        for requested in &record.allowed_ips {
            if let Some(owner) = self
                .doc
                .peers
                .iter()
                .find(|p| p.overlapping(requested).is_some())
            {
                return Err(RegistryError::DuplicateKey {
                    public_key: record.public_key,
                    conflict: Conflict::Address {
                        address: requested.clone(),
                        owner: owner.public_key,
                    },
                });
            }
        }

        self.doc.peers.push(record);
        self.dirty = true;
        Ok(())
    }

    /// Removes a peer and returns its record.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if the key is not registered.
    pub fn remove(&mut self, public_key: &PublicKey) -> Result<PeerRecord> {
        let idx = self
            .doc
            .peers
            .iter()
            .position(|p| p.public_key == *public_key)
            .ok_or(RegistryError::NotFound(*public_key))?;
        self.dirty = true;
        Ok(self.doc.peers.remove(idx))
    }

    /// Persists the changes and releases the lock.
    ///
    /// A transaction without changes writes nothing and keeps the
    /// generation.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Storage`] if the store could not be
    /// replaced; the previous content is left as it was.
    pub fn commit(mut self) -> Result<Arc<CommittedView>> {
        if !self.dirty {
            return Ok(self.registry.publish(CommittedView::from(&self.doc)));
        }

        self.doc.generation = self.base_generation + 1;
        self.registry.write_atomic(&render_store(&self.doc))?;

        info!(
            path = %self.registry.path.display(),
            generation = self.doc.generation,
            peers = self.doc.peers.len(),
            "registry committed"
        );
        Ok(self.registry.publish(CommittedView::from(&self.doc)))
    }
}
