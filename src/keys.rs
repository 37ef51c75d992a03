//! Key derivation module
//!
//! Every track payload is encrypted with its own 16-byte Blowfish key. The key is
//! not transmitted; it is derived from the track's asset id and a fixed application
//! secret, so the derivation below has to match the server side bit for bit.

use std::fmt;

use md5::{Digest, Md5};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Application secret mixed into every derived key
const KEY_SECRET: [u8; 16] = *b"g4el58wc0zvf9na1";

/// Length of a derived key in bytes
pub const KEY_LEN: usize = 16;

/// Opaque track identifier used as key derivation input
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for AssetId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Per-asset Blowfish key. Wiped from memory when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DecryptionKey([u8; KEY_LEN]);

impl DecryptionKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl From<[u8; KEY_LEN]> for DecryptionKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for DecryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DecryptionKey(<redacted>)")
    }
}

/// Derive the decryption key for an asset.
///
/// The MD5 digest is hex-encoded first and the XOR runs over the 32 ASCII hex
/// characters (first half against second half), not over the raw digest bytes.
pub fn derive_key(asset_id: &AssetId) -> DecryptionKey {
    let digest_hex = hex::encode(Md5::digest(asset_id.as_str().as_bytes()));
    let hex = digest_hex.as_bytes();

    let mut key = [0u8; KEY_LEN];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = hex[i] ^ hex[i + KEY_LEN] ^ KEY_SECRET[i];
    }
    DecryptionKey(key)
}
