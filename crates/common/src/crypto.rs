//! WireGuard key handling
//!
//! Keys travel as standard base64 of 32 raw bytes, the format `wg` itself
//! prints and accepts. Uses x25519-dalek for public key derivation.

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

/// Length of a raw WireGuard key
pub const KEY_LEN: usize = 32;

/// A validated WireGuard key (public or private)
#[derive(Clone, PartialEq, Eq)]
pub struct WgKey([u8; KEY_LEN]);

impl WgKey {
    /// Parse a base64 encoded key
    pub fn parse(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::validation(format!("invalid WireGuard key encoding: {}", e)))?;
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|v: Vec<u8>| {
            Error::validation(format!(
                "invalid WireGuard key length: expected {} bytes, got {}",
                KEY_LEN,
                v.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Base64 form, as accepted by `wg`
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Treat this key as a private key and derive its public counterpart
    pub fn public_key(&self) -> WgKey {
        let secret = StaticSecret::from(self.0);
        WgKey(*PublicKey::from(&secret).as_bytes())
    }
}

impl std::fmt::Debug for WgKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material; private keys flow through this type too.
        f.write_str("WgKey(..)")
    }
}

/// WireGuard key pair, base64 encoded
#[derive(Debug, Clone)]
pub struct WgKeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// Generate a fresh WireGuard key pair
pub fn generate_keypair() -> WgKeyPair {
    let mut private_key_bytes = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut private_key_bytes);

    // Curve25519 clamping
    private_key_bytes[0] &= 248;
    private_key_bytes[31] &= 127;
    private_key_bytes[31] |= 64;

    let private_key = WgKey(private_key_bytes);
    WgKeyPair {
        public_key: private_key.public_key().to_base64(),
        private_key: private_key.to_base64(),
    }
}

/// Derive the base64 public key for a base64 private key
pub fn derive_public_key(private_key: &str) -> Result<String> {
    Ok(WgKey::parse(private_key)?.public_key().to_base64())
}
