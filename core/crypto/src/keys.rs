//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use keyward_common::{Error, Result};

/// Length of symmetric keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of freshly generated salts in bytes.
pub const SALT_LENGTH: usize = 32;

/// Shortest salt accepted when reading existing parameters.
pub const MIN_SALT_LENGTH: usize = 16;

/// Longest salt accepted when reading existing parameters.
pub const MAX_SALT_LENGTH: usize = 64;

/// Symmetric key used by the envelope engine.
///
/// Either derived from a passphrase or a purpose-specific subkey of one.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    key: [u8; KEY_LENGTH],
}

impl SymmetricKey {
    /// Create a key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Create a key from a slice.
    ///
    /// # Errors
    /// - Returns error if the slice is not KEY_LENGTH bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_LENGTH {
            return Err(Error::Crypto(format!(
                "Invalid key length: expected {}, got {}",
                KEY_LENGTH,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    /// Generate a random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Derive a purpose-specific subkey.
    ///
    /// Uses BLAKE2b over the parent key and a context label, so keys used for
    /// the vault body, sync blobs and the verifier never coincide.
    pub fn derive_subkey(&self, context: &[u8]) -> SymmetricKey {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(self.key);
        hasher.update((context.len() as u32).to_le_bytes());
        hasher.update(context);
        hasher.update(b"keyward-subkey");

        let result = hasher.finalize();
        let mut derived = [0u8; KEY_LENGTH];
        derived.copy_from_slice(&result);
        SymmetricKey::from_bytes(derived)
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymmetricKey([REDACTED])")
    }
}

/// Where a salt came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaltOrigin {
    /// Generated from the OS RNG and stored with the vault.
    Random,
    /// Computed from a stable vault identifier by the old scheme.
    /// Accepted only to open existing vaults.
    LegacyDerived,
}

/// Salt for key derivation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salt(#[serde(with = "crate::encoding::base64_bytes")] Vec<u8>);

impl Salt {
    /// Generate a random salt.
    pub fn generate() -> Self {
        let mut salt = vec![0u8; SALT_LENGTH];
        OsRng.fill_bytes(&mut salt);
        Self(salt)
    }

    /// Create from bytes.
    ///
    /// # Errors
    /// - Returns error if the length is outside MIN_SALT_LENGTH..=MAX_SALT_LENGTH
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() < MIN_SALT_LENGTH || bytes.len() > MAX_SALT_LENGTH {
            return Err(Error::Validation(format!(
                "Salt must be {}..={} bytes, got {}",
                MIN_SALT_LENGTH,
                MAX_SALT_LENGTH,
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// Reproduce the salt of the old deterministic scheme.
    ///
    /// Only for re-deriving keys of vaults written before random salts were
    /// introduced. Never use the result for a new vault.
    pub fn legacy_from_identifier(identifier: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"keyward-vault-salt:");
        hasher.update(identifier.as_bytes());
        Self(hasher.finalize().to_vec())
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the salt is empty (never true for a validated salt).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Salt({} bytes)", self.0.len())
    }
}
