//! Authenticated encryption primitives.
//!
//! Two AEAD ciphers back the envelope profiles:
//! - AES-256-GCM with a 12-byte nonce (portable, hardware accelerated almost
//!   everywhere)
//! - XChaCha20-Poly1305 with a 24-byte nonce (safe for random nonces at any
//!   volume)
//!
//! Both operate in place on a caller-owned buffer with a detached tag, so the
//! envelope layer controls where plaintext lives and when it is wiped.

use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::XChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use crate::keys::SymmetricKey;
use keyward_common::{Error, Result};

/// Nonce size for AES-256-GCM (12 bytes).
pub const GCM_NONCE_SIZE: usize = 12;

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// Authentication tag size for both ciphers (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Fill a fresh nonce of `len` bytes from the OS RNG.
pub fn random_nonce(len: usize) -> Vec<u8> {
    let mut nonce = vec![0u8; len];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt `buffer` in place with AES-256-GCM and return the tag.
///
/// # Preconditions
/// - `nonce` must be GCM_NONCE_SIZE bytes and unique for this key
pub fn gcm_seal(
    key: &SymmetricKey,
    nonce: &[u8],
    aad: &[u8],
    buffer: &mut [u8],
) -> Result<[u8; TAG_SIZE]> {
    check_nonce(nonce, GCM_NONCE_SIZE)?;
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buffer)
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;
    Ok(tag_array(&tag))
}

/// Decrypt `buffer` in place with AES-256-GCM.
///
/// # Security
/// - On failure the buffer is wiped before returning; GCM decrypts before
///   the tag comparison completes
pub fn gcm_open(
    key: &SymmetricKey,
    nonce: &[u8],
    aad: &[u8],
    buffer: &mut [u8],
    tag: &[u8; TAG_SIZE],
) -> Result<()> {
    check_nonce(nonce, GCM_NONCE_SIZE)?;
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
    let result = cipher.decrypt_in_place_detached(
        GenericArray::from_slice(nonce),
        aad,
        buffer,
        GenericArray::from_slice(tag),
    );
    if result.is_err() {
        buffer.zeroize();
        return Err(Error::authentication());
    }
    Ok(())
}

/// Encrypt `buffer` in place with XChaCha20-Poly1305 and return the tag.
pub fn xchacha_seal(
    key: &SymmetricKey,
    nonce: &[u8],
    aad: &[u8],
    buffer: &mut [u8],
) -> Result<[u8; TAG_SIZE]> {
    check_nonce(nonce, XCHACHA_NONCE_SIZE)?;
    let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(key.as_bytes()));
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buffer)
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;
    Ok(tag_array(&tag))
}

/// Decrypt `buffer` in place with XChaCha20-Poly1305, wiping it on failure.
pub fn xchacha_open(
    key: &SymmetricKey,
    nonce: &[u8],
    aad: &[u8],
    buffer: &mut [u8],
    tag: &[u8; TAG_SIZE],
) -> Result<()> {
    check_nonce(nonce, XCHACHA_NONCE_SIZE)?;
    let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(key.as_bytes()));
    let result = cipher.decrypt_in_place_detached(
        GenericArray::from_slice(nonce),
        aad,
        buffer,
        GenericArray::from_slice(tag),
    );
    if result.is_err() {
        buffer.zeroize();
        return Err(Error::authentication());
    }
    Ok(())
}

fn tag_array(tag: &[u8]) -> [u8; TAG_SIZE] {
    let mut out = [0u8; TAG_SIZE];
    out.copy_from_slice(tag);
    out
}

fn check_nonce(nonce: &[u8], expected: usize) -> Result<()> {
    if nonce.len() != expected {
        return Err(Error::Crypto(format!(
            "Invalid nonce length: expected {}, got {}",
            expected,
            nonce.len()
        )));
    }
    Ok(())
}
