//! `WireGuard` key types and key material generation.
//!
//! `WireGuard` uses Curve25519 for key exchange. Keys are 32 bytes and are
//! exchanged with the daemon and stored on disk in standard base64, the same
//! encoding `wg genkey` / `wg pubkey` / `wg genpsk` produce.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::error::{Result, WireGuardError};

/// `WireGuard` key size in bytes (256-bit Curve25519 keys).
pub const KEY_SIZE: usize = 32;

fn decode_key(s: &str) -> Result<[u8; KEY_SIZE]> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(s.trim())?;
    if bytes.len() != KEY_SIZE {
        return Err(WireGuardError::InvalidKeyLength(bytes.len()));
    }
    let mut arr = [0u8; KEY_SIZE];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

fn encode_key(bytes: &[u8; KEY_SIZE]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// A `WireGuard` public key (Curve25519, 32 bytes).
///
/// The public key is the identity of a peer in the registry and on the daemon.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    /// Creates a public key from raw bytes.
    #[must_use]
    pub const fn from_bytes_array(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Creates a public key from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(WireGuardError::InvalidKeyLength(bytes.len()));
        }
        let mut arr = [0u8; KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Returns the raw bytes of the public key.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encodes the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        encode_key(&self.0)
    }

    /// Decodes a public key from base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64 or wrong length.
    pub fn from_base64(s: &str) -> Result<Self> {
        decode_key(s).map(Self)
    }

    /// Returns a short prefix of the base64 form, suitable for log fields.
    #[must_use]
    pub fn short(&self) -> String {
        let mut b64 = self.to_base64();
        b64.truncate(8);
        b64
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", self.short())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl FromStr for PublicKey {
    type Err = WireGuardError;
    fn from_str(s: &str) -> Result<Self> {
        Self::from_base64(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

impl From<X25519PublicKey> for PublicKey {
    fn from(key: X25519PublicKey) -> Self {
        Self::from_bytes_array(*key.as_bytes())
    }
}

/// A `WireGuard` private key (Curve25519, 32 bytes).
///
/// Not `Serialize`; use `to_base64` to export it.
#[derive(Clone)]
pub struct PrivateKey([u8; KEY_SIZE]);

impl PrivateKey {
    /// Generates a new random private key.
    #[must_use]
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self(secret.to_bytes())
    }

    /// Creates a private key from a 32-byte array.
    #[must_use]
    pub const fn from_bytes_array(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of the private key.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Derives the corresponding public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey::from(X25519PublicKey::from(&secret))
    }

    /// Encodes the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        encode_key(&self.0)
    }

    /// Decodes a private key from base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64 or wrong length.
    pub fn from_base64(s: &str) -> Result<Self> {
        decode_key(s).map(Self)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for PrivateKey {}

/// A `WireGuard` preshared key (32 random bytes).
#[derive(Clone)]
pub struct PresharedKey([u8; KEY_SIZE]);

impl PresharedKey {
    /// Creates a preshared key from raw bytes.
    #[must_use]
    pub const fn from_bytes_array(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of the preshared key.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encodes the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        encode_key(&self.0)
    }

    /// Decodes a preshared key from base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64 or wrong length.
    pub fn from_base64(s: &str) -> Result<Self> {
        decode_key(s).map(Self)
    }

    /// Generates a new random preshared key from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresharedKey").field("key", &"[REDACTED]").finish()
    }
}

impl PartialEq for PresharedKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for PresharedKey {}

/// A `WireGuard` key pair (private + public).
#[derive(Clone)]
pub struct KeyPair {
    private: PrivateKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generates a new random key pair.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_private_key(PrivateKey::generate())
    }

    /// Creates a key pair from an existing private key.
    #[must_use]
    pub fn from_private_key(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }

    /// Returns a reference to the private key.
    #[must_use]
    pub const fn private_key(&self) -> &PrivateKey {
        &self.private
    }

    /// Returns a reference to the public key.
    #[must_use]
    pub const fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Consumes the key pair and returns the private key.
    #[must_use]
    pub fn into_private_key(self) -> PrivateKey {
        self.private
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private", &"[REDACTED]")
            .field("public", &self.public)
            .finish()
    }
}

/// Source of fresh key material for new peers.
///
/// Implementations must return cryptographically random, collision-free keys.
pub trait KeySource: Send + Sync {
    /// Generates a new key pair.
    fn generate_key_pair(&self) -> KeyPair;

    /// Generates a new preshared key.
    fn generate_preshared_key(&self) -> PresharedKey;
}

/// Key source backed by the operating system's CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsKeySource;

impl KeySource for OsKeySource {
    fn generate_key_pair(&self) -> KeyPair {
        KeyPair::generate()
    }

    fn generate_preshared_key(&self) -> PresharedKey {
        PresharedKey::generate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_key_to_public_key_is_deterministic() {
        let private = PrivateKey::generate();
        assert_eq!(private.public_key(), private.public_key());
    }

    #[test]
    fn different_private_keys_produce_different_public_keys() {
        let private1 = PrivateKey::generate();
        let private2 = PrivateKey::generate();
        assert_ne!(private1.public_key(), private2.public_key());
    }

    #[test]
    fn public_key_base64_roundtrip() {
        let public = PrivateKey::generate().public_key();
        let decoded = PublicKey::from_base64(&public.to_base64()).expect("decode failed");
        assert_eq!(public, decoded);
    }

    #[test]
    fn public_key_display_matches_wg_encoding() {
        let public = PublicKey::from_bytes_array([0u8; KEY_SIZE]);
        assert_eq!(public.to_string(), "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=");
        assert_eq!(public.short(), "AAAAAAAA");
    }

    #[test]
    fn public_key_from_str_trims_whitespace() {
        let public = PrivateKey::generate().public_key();
        let parsed: PublicKey = format!("  {public}\n").parse().expect("parse failed");
        assert_eq!(parsed, public);
    }

    #[test]
    fn known_curve25519_derivation() {
        // RFC 7748 section 6.1 test vector (Alice).
        let private = PrivateKey::from_bytes_array([
            0x77, 0x07, 0x6d, 0x0a, 0x73, 0x18, 0xa5, 0x7d, 0x3c, 0x16, 0xc1, 0x72, 0x51, 0xb2,
            0x66, 0x45, 0xdf, 0x4c, 0x2f, 0x87, 0xeb, 0xc0, 0x99, 0x2a, 0xb1, 0x77, 0xfb, 0xa5,
            0x1d, 0xb9, 0x2c, 0x2a,
        ]);
        let expected = [
            0x85, 0x20, 0xf0, 0x09, 0x89, 0x30, 0xa7, 0x54, 0x74, 0x8b, 0x7d, 0xdc, 0xb4, 0x3e,
            0xf7, 0x5a, 0x0d, 0xbf, 0x3a, 0x0d, 0x26, 0x38, 0x1a, 0xf4, 0xeb, 0xa4, 0xa9, 0x8e,
            0xaa, 0x9b, 0x4e, 0x6a,
        ];
        assert_eq!(private.public_key().as_bytes(), &expected);
    }

    #[test]
    fn private_key_base64_roundtrip() {
        let private = PrivateKey::generate();
        let decoded = PrivateKey::from_base64(&private.to_base64()).expect("decode failed");
        assert_eq!(private, decoded);
    }

    #[test]
    fn secrets_debug_redacts() {
        assert!(format!("{:?}", PrivateKey::generate()).contains("REDACTED"));
        assert!(format!("{:?}", PresharedKey::generate()).contains("REDACTED"));
        assert!(format!("{:?}", KeyPair::generate()).contains("REDACTED"));
    }

    #[test]
    fn public_key_serde_uses_base64() {
        let public = PrivateKey::generate().public_key();
        let json = serde_json::to_string(&public).expect("serialize failed");
        assert_eq!(json, format!("\"{}\"", public.to_base64()));
        let deserialized: PublicKey = serde_json::from_str(&json).expect("deserialize failed");
        assert_eq!(public, deserialized);
    }

    #[test]
    fn keypair_from_private_key() {
        let private = PrivateKey::generate();
        let expected_public = private.public_key();
        let keypair = KeyPair::from_private_key(private);
        assert_eq!(keypair.public_key(), &expected_public);
    }

    #[test]
    fn os_key_source_produces_distinct_material() {
        let source = OsKeySource;
        let a = source.generate_key_pair();
        let b = source.generate_key_pair();
        assert_ne!(a.public_key(), b.public_key());
        assert_ne!(source.generate_preshared_key(), source.generate_preshared_key());
    }

    #[test]
    fn invalid_key_length_rejected() {
        let short_bytes = [0u8; 16];
        assert!(PublicKey::from_bytes(&short_bytes).is_err());

        let short_b64 = base64::engine::general_purpose::STANDARD.encode(short_bytes);
        assert!(matches!(
            PresharedKey::from_base64(&short_b64),
            Err(WireGuardError::InvalidKeyLength(16))
        ));
    }

    #[test]
    fn invalid_base64_rejected() {
        assert!(matches!(
            PublicKey::from_base64("not base64!"),
            Err(WireGuardError::InvalidBase64(_))
        ));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn public_key_base64_roundtrip_prop(bytes in prop::array::uniform32(any::<u8>())) {
                let public = PublicKey::from_bytes_array(bytes);
                let decoded = PublicKey::from_base64(&public.to_base64());
                prop_assert!(decoded.is_ok());
                prop_assert_eq!(public, decoded.unwrap());
            }

            #[test]
            fn keypair_derivation_consistent(seed: [u8; 32]) {
                let private = PrivateKey::from_bytes_array(seed);
                prop_assert_eq!(private.public_key(), private.public_key());
            }
        }
    }
}
