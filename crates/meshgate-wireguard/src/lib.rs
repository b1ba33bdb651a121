//! `WireGuard` building blocks for meshgate.
//!
//! This crate provides:
//! - Curve25519 key types and a pluggable [`KeySource`]
//! - Peer and client configuration types
//! - The [`PeerDaemon`] control interface, with a `wg`-tool implementation,
//!   an optional netlink implementation and an in-memory fake for tests

pub mod command;
pub mod config;
pub mod daemon;
pub mod error;
mod keys;
#[cfg(feature = "netlink")]
pub mod netlink;
pub mod types;
pub mod wg;

pub use config::{ClientConfig, PeerConfig};
pub use daemon::{FailOn, FakeDaemon, PeerDaemon};
pub use error::{Result, WireGuardError};
pub use keys::{KeyPair, KeySource, OsKeySource, PresharedKey, PrivateKey, PublicKey, KEY_SIZE};
#[cfg(feature = "netlink")]
pub use netlink::NetlinkDaemon;
pub use types::{AddressFamily, AllowedIp, Endpoint, PeerStatus};
pub use wg::{parse_dump, WgCommandDaemon, DEFAULT_WG_BINARY};
