//! Shared session keys
//!
//! Both ends of a link derive the same hop sequence from a [`SecretKey`]
//! exchanged out of band as a hex string.

use crate::types::{ModemError, ModemResult};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;

/// Recommended minimum key length in bytes.
pub const RECOMMENDED_KEY_LEN: usize = 16;

/// Length of keys produced by [`SecretKey::generate`].
pub const GENERATED_KEY_LEN: usize = 32;

/// Opaque key material, immutable once created.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey {
    bytes: Vec<u8>,
}

impl SecretKey {
    /// Wrap raw key bytes. Empty keys are rejected.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> ModemResult<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(ModemError::Key("key must not be empty".to_string()));
        }
        if bytes.len() < RECOMMENDED_KEY_LEN {
            tracing::warn!(
                len = bytes.len(),
                recommended = RECOMMENDED_KEY_LEN,
                "secret key is shorter than recommended"
            );
        }
        Ok(Self { bytes })
    }

    /// Fresh random key from the operating system RNG.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; GENERATED_KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// SHA-256 of arbitrary material, e.g. a passphrase.
    pub fn derive(material: &[u8]) -> Self {
        Self {
            bytes: Sha256::digest(material).to_vec(),
        }
    }

    /// Parse a key from its hex export.
    pub fn import_hex(hex_str: &str) -> ModemResult<Self> {
        let bytes = hex::decode(hex_str.trim()).map_err(|e| ModemError::Key(e.to_string()))?;
        Self::from_bytes(bytes)
    }

    /// Hex string for handing the key to a cooperating decoder.
    pub fn export_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey")
            .field("len", &self.bytes.len())
            .finish_non_exhaustive()
    }
}

/// Export a key as hex.
pub fn export_key(key: &SecretKey) -> String {
    key.export_hex()
}

/// Import a key from hex.
pub fn import_key(hex_str: &str) -> ModemResult<SecretKey> {
    SecretKey::import_hex(hex_str)
}
