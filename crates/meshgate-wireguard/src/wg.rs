//! Daemon control through the `wg` command-line tool.

use tracing::{debug, info};

use crate::command::WgCommand;
use crate::config::PeerConfig;
use crate::daemon::PeerDaemon;
use crate::error::{Result, WireGuardError};
use crate::keys::PublicKey;
use crate::types::{AllowedIp, PeerStatus};

/// Default name of the `wg` binary, resolved through `PATH`.
pub const DEFAULT_WG_BINARY: &str = "wg";

/// Drives a kernel or userspace `WireGuard` interface with `wg set` / `wg show`.
#[derive(Debug, Clone)]
pub struct WgCommandDaemon {
    binary: String,
}

impl WgCommandDaemon {
    /// Creates a daemon controller using `wg` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_binary(DEFAULT_WG_BINARY)
    }

    /// Creates a daemon controller using the given `wg` binary.
    #[must_use]
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Returns the configured binary.
    #[must_use]
    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn set_peer_command(&self, interface: &str, peer: &PeerConfig) -> WgCommand {
        let mut cmd = WgCommand::new(&self.binary)
            .arg("set")
            .arg(interface)
            .arg("peer")
            .arg(peer.public_key.to_base64());

        if let Some(ref psk) = peer.preshared_key {
            cmd = cmd
                .arg("preshared-key")
                .arg("/dev/stdin")
                .stdin(format!("{}\n", psk.to_base64()));
        }

        cmd = cmd.arg("allowed-ips").arg(peer.allowed_ips_csv());

        if let Some(ref endpoint) = peer.endpoint {
            cmd = cmd.arg("endpoint").arg(endpoint.to_string());
        }
        if let Some(keepalive) = peer.persistent_keepalive {
            cmd = cmd.arg("persistent-keepalive").arg(keepalive.to_string());
        }
        cmd
    }
}

impl Default for WgCommandDaemon {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerDaemon for WgCommandDaemon {
    async fn add_peer(&self, interface: &str, peer: &PeerConfig) -> Result<()> {
        self.set_peer_command(interface, peer).run().await?;
        info!(interface, peer = %peer.public_key.short(), "peer pushed to daemon");
        Ok(())
    }

    async fn remove_peer(&self, interface: &str, public_key: &PublicKey) -> Result<()> {
        WgCommand::new(&self.binary)
            .arg("set")
            .arg(interface)
            .arg("peer")
            .arg(public_key.to_base64())
            .arg("remove")
            .run()
            .await?;
        info!(interface, peer = %public_key.short(), "peer removed from daemon");
        Ok(())
    }

    async fn peers(&self, interface: &str) -> Result<Vec<PeerStatus>> {
        let output = WgCommand::new(&self.binary)
            .arg("show")
            .arg(interface)
            .arg("dump")
            .run()
            .await?;
        let peers = parse_dump(&output.stdout_lossy())?;
        debug!(interface, peers = peers.len(), "read live peer table");
        Ok(peers)
    }
}

fn optional(field: &str) -> Option<&str> {
    match field {
        "(none)" | "off" | "" => None,
        value => Some(value),
    }
}

/// Parses the output of `wg show <interface> dump`.
///
/// The first line describes the interface and is skipped; every following
/// line is a tab-separated peer entry.
pub fn parse_dump(dump: &str) -> Result<Vec<PeerStatus>> {
    let mut peers = Vec::new();

    for (idx, line) in dump.lines().enumerate().skip(1) {
        let line_number = idx + 1;
        if line.trim().is_empty() {
            continue;
        }

        let malformed = |message: String| WireGuardError::MalformedOutput {
            line: line_number,
            message,
        };

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 8 {
            return Err(malformed(format!(
                "expected 8 fields, found {}",
                fields.len()
            )));
        }

        let public_key = PublicKey::from_base64(fields[0])
            .map_err(|e| malformed(format!("public key: {e}")))?;

        let allowed_ips = match optional(fields[3]) {
            None => Vec::new(),
            Some(list) => list
                .split(',')
                .map(AllowedIp::from_cidr)
                .collect::<Result<Vec<_>>>()
                .map_err(|e| malformed(format!("allowed ips: {e}")))?,
        };

        let last_handshake = match fields[4].parse::<u64>() {
            Ok(0) => None,
            Ok(ts) => Some(ts),
            Err(e) => return Err(malformed(format!("latest handshake: {e}"))),
        };
        let rx_bytes = fields[5]
            .parse()
            .map_err(|e| malformed(format!("transfer rx: {e}")))?;
        let tx_bytes = fields[6]
            .parse()
            .map_err(|e| malformed(format!("transfer tx: {e}")))?;

        peers.push(PeerStatus {
            public_key,
            endpoint: optional(fields[2]).map(ToString::to_string),
            allowed_ips,
            last_handshake,
            rx_bytes,
            tx_bytes,
        });
    }

    Ok(peers)
}
