//! On-disk store format.
//!
//! The store is a wg-quick configuration file, so the daemon can load it
//! directly:
//!
//! ```text
//! #! generation = 7
//! [Interface]
//! PrivateKey = ...
//! Address = 10.25.0.1/16
//!
//! [Peer]
//! #! created-at = 2026-01-02T03:04:05Z
//! PublicKey = ...
//! PresharedKey = ...
//! AllowedIPs = 10.25.0.2/32, fd42:42:42::2/128
//! ```
//!
//! Everything before the first `[Peer]` is kept verbatim. Registry metadata
//! lives in `#!` comment lines, which wg-quick ignores. Peer settings the
//! registry does not model (`Endpoint`, `PersistentKeepalive`, ...) are kept
//! in order. As in wg-quick, text from `#` to the end of a line is a
//! comment and section names are case-insensitive. Comments inside peer
//! blocks are not preserved.

use std::collections::HashSet;
use std::fmt::Write as FmtWrite;

use chrono::{DateTime, SecondsFormat, Utc};
use meshgate_wireguard::{AllowedIp, PresharedKey, PublicKey};

use crate::error::{RegistryError, Result};
use crate::record::PeerRecord;

const DIRECTIVE: &str = "#!";
const GENERATION: &str = "generation";
const CREATED_AT: &str = "created-at";

/// Parsed content of a store file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreDocument {
    /// Commit counter.
    pub generation: u64,
    /// Lines before the first `[Peer]`, without registry directives.
    pub preamble: String,
    /// Peers in file order.
    pub peers: Vec<PeerRecord>,
}

fn corrupt(line: usize, message: impl Into<String>) -> RegistryError {
    RegistryError::Corrupt {
        line,
        message: message.into(),
    }
}

/// Drops a trailing `#` comment the way wg-quick does. Directive lines are
/// returned whole.
fn strip_comment(line: &str) -> &str {
    if line.starts_with(DIRECTIVE) {
        return line;
    }
    line.split_once('#').map_or(line, |(setting, _)| setting).trim_end()
}

fn directive(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.strip_prefix(DIRECTIVE)?.split_once('=')?;
    Some((key.trim(), value.trim()))
}

/// Builder for a `[Peer]` block during parsing.
#[derive(Default)]
struct ParsedPeer {
    start_line: usize,
    public_key: Option<PublicKey>,
    preshared_key: Option<PresharedKey>,
    allowed_ips: Vec<AllowedIp>,
    created_at: Option<DateTime<Utc>>,
    extra: Vec<(String, String)>,
}

impl ParsedPeer {
    fn new(start_line: usize) -> Self {
        Self {
            start_line,
            ..Self::default()
        }
    }

    fn parse_directive(&mut self, key: &str, value: &str, line_number: usize) -> Result<()> {
        if key == CREATED_AT {
            let created_at = DateTime::parse_from_rfc3339(value)
                .map_err(|e| corrupt(line_number, format!("invalid {CREATED_AT}: {e}")))?;
            self.created_at = Some(created_at.with_timezone(&Utc));
        }
        Ok(())
    }

    fn parse_key(&mut self, key: &str, value: &str, line_number: usize) -> Result<()> {
        if key.eq_ignore_ascii_case("PublicKey") {
            if self.public_key.is_some() {
                return Err(corrupt(line_number, "PublicKey set twice in one [Peer]"));
            }
            self.public_key = Some(
                PublicKey::from_base64(value)
                    .map_err(|_| corrupt(line_number, "invalid PublicKey"))?,
            );
        } else if key.eq_ignore_ascii_case("PresharedKey") {
            self.preshared_key = Some(
                PresharedKey::from_base64(value)
                    .map_err(|_| corrupt(line_number, "invalid PresharedKey"))?,
            );
        } else if key.eq_ignore_ascii_case("AllowedIPs") {
            for ip in value.split(',').map(str::trim).filter(|ip| !ip.is_empty()) {
                self.allowed_ips.push(
                    AllowedIp::from_cidr(ip)
                        .map_err(|_| corrupt(line_number, format!("invalid AllowedIPs: {ip}")))?,
                );
            }
        } else {
            self.extra.push((key.to_string(), value.to_string()));
        }
        Ok(())
    }

    fn build(self) -> Result<PeerRecord> {
        let public_key = self
            .public_key
            .ok_or_else(|| corrupt(self.start_line, "missing PublicKey in [Peer] section"))?;

        Ok(PeerRecord {
            public_key,
            preshared_key: self.preshared_key,
            allowed_ips: self.allowed_ips,
            created_at: self.created_at,
            extra: self.extra,
        })
    }
}

/// Parses store content.
///
/// # Errors
///
/// Returns [`RegistryError::Corrupt`] with the offending line if the content
/// is not a valid store.
pub fn parse_store(content: &str) -> Result<StoreDocument> {
    let mut generation = 0;
    let mut preamble: Vec<&str> = Vec::new();
    let mut peers: Vec<PeerRecord> = Vec::new();
    let mut seen: HashSet<PublicKey> = HashSet::new();
    let mut current_peer: Option<ParsedPeer> = None;

    let mut finish = |peer: ParsedPeer, peers: &mut Vec<PeerRecord>| -> Result<()> {
        let start = peer.start_line;
        let record = peer.build()?;
        if !seen.insert(record.public_key) {
            return Err(corrupt(
                start,
                format!("peer {} listed twice", record.public_key.short()),
            ));
        }
        peers.push(record);
        Ok(())
    };

    for (line_num, raw) in content.lines().enumerate() {
        let line = strip_comment(raw.trim());
        let line_number = line_num + 1;

        if let Some(section_name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let section_name = section_name.trim();
            if section_name.eq_ignore_ascii_case("Peer") {
                if let Some(peer) = current_peer.take() {
                    finish(peer, &mut peers)?;
                }
                current_peer = Some(ParsedPeer::new(line_number));
                continue;
            }
            if current_peer.is_some() {
                return Err(corrupt(
                    line_number,
                    format!("unexpected section after peers: {section_name}"),
                ));
            }
        }

        let Some(peer) = current_peer.as_mut() else {
            match directive(line) {
                Some((GENERATION, value)) => {
                    generation = value
                        .parse()
                        .map_err(|_| corrupt(line_number, format!("invalid {GENERATION}: {value}")))?;
                }
                _ => preamble.push(raw),
            }
            continue;
        };

        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = directive(line) {
            peer.parse_directive(key, value, line_number)?;
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(corrupt(line_number, format!("invalid line format: {line}")));
        };
        peer.parse_key(key.trim(), value.trim(), line_number)?;
    }

    if let Some(peer) = current_peer {
        finish(peer, &mut peers)?;
    }

    while preamble.last().is_some_and(|l| l.trim().is_empty()) {
        preamble.pop();
    }

    Ok(StoreDocument {
        generation,
        preamble: preamble.join("\n"),
        peers,
    })
}

/// Renders a store document.
#[must_use]
pub fn render_store(doc: &StoreDocument) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "{DIRECTIVE} {GENERATION} = {}", doc.generation);
    if !doc.preamble.is_empty() {
        output.push_str(&doc.preamble);
        output.push('\n');
    }

    for peer in &doc.peers {
        output.push('\n');
        output.push_str("[Peer]\n");
        if let Some(created_at) = peer.created_at {
            let _ = writeln!(
                output,
                "{DIRECTIVE} {CREATED_AT} = {}",
                created_at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
            );
        }
        let _ = writeln!(output, "PublicKey = {}", peer.public_key.to_base64());

        if let Some(ref psk) = peer.preshared_key {
            let _ = writeln!(output, "PresharedKey = {}", psk.to_base64());
        }

        if !peer.allowed_ips.is_empty() {
            let ips: Vec<String> = peer.allowed_ips.iter().map(AllowedIp::to_cidr).collect();
            let _ = writeln!(output, "AllowedIPs = {}", ips.join(", "));
        }

        for (key, value) in &peer.extra {
            let _ = writeln!(output, "{key} = {value}");
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_wireguard::KEY_SIZE;
    use test_case::test_case;

    fn key(byte: u8) -> PublicKey {
        PublicKey::from_bytes_array([byte; KEY_SIZE])
    }

    fn record(byte: u8, ips: &[&str]) -> PeerRecord {
        PeerRecord::new(
            key(byte),
            Some(PresharedKey::from_bytes_array([byte + 100; KEY_SIZE])),
            ips.iter()
                .map(|ip| AllowedIp::from_cidr(ip).expect("valid cidr"))
                .collect(),
        )
    }

    // ==================== Parse Tests ====================

    #[test]
    fn parse_empty_store() {
        let doc = parse_store("").expect("empty store");
        assert_eq!(doc, StoreDocument::default());
    }

    #[test]
    fn parse_hand_written_config() {
        let content = format!(
            "[Interface]\n\
             PrivateKey = {}\n\
             Address = 10.25.0.1/16\n\
             ListenPort = 51820\n\
             \n\
             # laptop\n\
             [Peer]\n\
             PublicKey = {}\n\
             AllowedIPs = 10.25.0.2/32\n\
             Endpoint = 203.0.113.7:51820\n\
             PersistentKeepalive = 25\n",
            meshgate_wireguard::PrivateKey::from_bytes_array([1u8; KEY_SIZE]).to_base64(),
            key(2)
        );

        let doc = parse_store(&content).expect("valid store");
        assert_eq!(doc.generation, 0);
        assert!(doc.preamble.starts_with("[Interface]\n"));
        assert!(doc.preamble.ends_with("# laptop"));
        assert_eq!(doc.peers.len(), 1);

        let peer = &doc.peers[0];
        assert_eq!(peer.public_key, key(2));
        assert_eq!(peer.preshared_key, None);
        assert_eq!(peer.created_at, None);
        assert_eq!(
            peer.extra,
            vec![
                ("Endpoint".to_string(), "203.0.113.7:51820".to_string()),
                ("PersistentKeepalive".to_string(), "25".to_string()),
            ]
        );
    }

    #[test]
    fn parse_accumulates_allowed_ips_lines() {
        let content = format!(
            "[Peer]\nPublicKey = {}\nAllowedIPs = 10.25.0.2/32\nallowedips = fd42:42:42::2/128\n",
            key(1)
        );
        let doc = parse_store(&content).expect("valid store");
        assert_eq!(doc.peers[0].allowed_ips.len(), 2);
    }

    #[test_case("[Peer]\nAllowedIPs = 10.25.0.2/32\n", 1 ; "missing public key")]
    #[test_case("[Peer]\nPublicKey = nope\n", 2 ; "invalid public key")]
    #[test_case("#! generation = many\n", 1 ; "invalid generation")]
    #[test_case("[Peer]\nthis is not a setting\n", 2 ; "not key value")]
    fn parse_rejects(content: &str, line: usize) {
        let err = parse_store(content).expect_err("corrupt store");
        assert!(
            matches!(err, RegistryError::Corrupt { line: l, .. } if l == line),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn parse_rejects_duplicate_peer() {
        let content = format!("[Peer]\nPublicKey = {0}\n\n[Peer]\nPublicKey = {0}\n", key(1));
        assert!(matches!(
            parse_store(&content),
            Err(RegistryError::Corrupt { line: 4, .. })
        ));
    }

    #[test]
    fn parse_rejects_interface_after_peers() {
        let content = format!("[Peer]\nPublicKey = {}\n[Interface]\n", key(1));
        assert!(matches!(
            parse_store(&content),
            Err(RegistryError::Corrupt { line: 3, .. })
        ));
    }

    #[test]
    fn parse_peer_header_with_trailing_comment() {
        let content = format!(
            "[Interface]\nAddress = 10.0.0.1/24\n\n[Peer] # laptop\nPublicKey = {}\nAllowedIPs = 10.0.0.2/32\n",
            key(7)
        );
        let doc = parse_store(&content).expect("valid store");
        assert_eq!(doc.preamble, "[Interface]\nAddress = 10.0.0.1/24");
        assert_eq!(doc.peers.len(), 1);
        assert_eq!(doc.peers[0].public_key, key(7));
        assert_eq!(doc.peers[0].allowed_ips[0].to_string(), "10.0.0.2/32");
    }

    #[test_case("[peer]" ; "lowercase")]
    #[test_case("[ Peer ]" ; "padded")]
    #[test_case("[PEER]#phone" ; "uppercase with comment")]
    fn parse_peer_header_variants(header: &str) {
        let content = format!("{header}\nPublicKey = {}\n", key(1));
        let doc = parse_store(&content).expect("valid store");
        assert_eq!(doc.peers.len(), 1);
        assert!(doc.preamble.is_empty());
    }

    #[test]
    fn parse_strips_trailing_comments_from_settings() {
        let content = format!(
            "[Peer]\n#! created-at = 2026-01-02T03:04:05Z\nPublicKey = {} # laptop\nAllowedIPs = 10.0.0.2/32 # laptop\nEndpoint = 203.0.113.7:51820 #home\n",
            key(1)
        );
        let doc = parse_store(&content).expect("valid store");
        let peer = &doc.peers[0];
        assert_eq!(peer.public_key, key(1));
        assert_eq!(peer.allowed_ips[0].to_string(), "10.0.0.2/32");
        assert!(peer.created_at.is_some());
        assert_eq!(
            peer.extra,
            vec![("Endpoint".to_string(), "203.0.113.7:51820".to_string())]
        );
    }

    #[test]
    fn parse_rejects_commented_interface_after_peers() {
        let content = format!("[Peer]\nPublicKey = {}\n[Interface] # again\n", key(1));
        assert!(matches!(
            parse_store(&content),
            Err(RegistryError::Corrupt { line: 3, .. })
        ));
    }

    #[test]
    fn parse_rejects_bad_created_at() {
        let content = format!("[Peer]\n#! created-at = yesterday\nPublicKey = {}\n", key(1));
        assert!(matches!(
            parse_store(&content),
            Err(RegistryError::Corrupt { line: 2, .. })
        ));
    }

    // ==================== Render Tests ====================

    #[test]
    fn render_then_parse_is_lossless() {
        let mut hand_written = record(3, &["10.25.0.9/32"]);
        hand_written.created_at = None;
        hand_written.preshared_key = None;
        hand_written
            .extra
            .push(("Endpoint".to_string(), "vpn.example.com:51820".to_string()));

        let doc = StoreDocument {
            generation: 42,
            preamble: "[Interface]\nPrivateKey = abc\nAddress = 10.25.0.1/16".to_string(),
            peers: vec![
                record(1, &["10.25.0.2/32", "fd42:42:42::2/128"]),
                record(2, &["fd42:42:42::3/128"]),
                hand_written,
            ],
        };

        let rendered = render_store(&doc);
        assert!(rendered.starts_with("#! generation = 42\n[Interface]\n"));
        assert_eq!(parse_store(&rendered).expect("valid store"), doc);
    }

    #[test]
    fn render_empty_store() {
        let doc = StoreDocument::default();
        assert_eq!(render_store(&doc), "#! generation = 0\n");
    }

    #[test]
    fn render_keeps_private_key_out() {
        let doc = StoreDocument {
            generation: 1,
            preamble: String::new(),
            peers: vec![record(1, &["10.25.0.2/32"])],
        };
        let rendered = render_store(&doc);
        assert!(!rendered.contains("PrivateKey"));
        assert!(rendered.contains("AllowedIPs = 10.25.0.2/32\n"));
    }
}
