//! Cryptographic primitives for Keyward.
//!
//! This module provides:
//! - Passphrase key derivation (Argon2id, scrypt, legacy PBKDF2)
//! - Versioned authenticated-encryption envelopes (AES-256-GCM and
//!   XChaCha20-Poly1305 profiles)
//! - Key types with automatic zeroization and purpose-separated subkeys
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Constant-time operations for sensitive comparisons

pub mod aead;
pub mod encoding;
pub mod envelope;
pub mod kdf;
pub mod keys;

pub use envelope::{constant_time_eq, decrypt, encrypt, open, seal, wipe, Envelope, Profile};
pub use kdf::{
    derive_for_new_vault, derive_key, derive_key_cancellable, DerivedKey, KdfAlgorithm,
    KdfParameters,
};
pub use keys::{Salt, SaltOrigin, SymmetricKey, KEY_LENGTH};
