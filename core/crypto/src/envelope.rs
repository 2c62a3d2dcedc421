//! Versioned authenticated-encryption envelopes.
//!
//! An envelope is the unit of ciphertext everywhere in Keyward: the vault
//! body, the passphrase verifier, sync blobs and encrypted exports.
//!
//! Binary layout:
//!
//! ```text
//! "KWE" | version u8 | profile u8 | nonce | tag (16) | ciphertext
//! ```
//!
//! The five header bytes are prepended to the caller's associated data, so
//! rewriting the profile or version byte fails authentication even when the
//! nonce length happens to match.
//!
//! # Security Guarantees
//! - The profile is never inferred when opening; the caller states it
//! - Any modification yields the same fixed authentication error
//! - Plaintext is only ever returned in a zeroizing buffer

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use crate::aead::{self, GCM_NONCE_SIZE, TAG_SIZE, XCHACHA_NONCE_SIZE};
use crate::keys::SymmetricKey;
use keyward_common::{Error, Result};

/// Envelope magic bytes.
pub const ENVELOPE_MAGIC: &[u8; 3] = b"KWE";

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

const HEADER_LEN: usize = 5;

/// Cipher profile of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    /// AES-256-GCM, readable by any platform implementation.
    CrossPlatform,
    /// XChaCha20-Poly1305, used for local vault files.
    Local,
}

impl Profile {
    /// Wire identifier.
    pub fn id(self) -> u8 {
        match self {
            Profile::CrossPlatform => 1,
            Profile::Local => 2,
        }
    }

    /// Parse a wire identifier.
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            1 => Ok(Profile::CrossPlatform),
            2 => Ok(Profile::Local),
            other => Err(Error::Corruption(format!(
                "Unknown envelope profile {}",
                other
            ))),
        }
    }

    /// Nonce length for this profile.
    pub fn nonce_len(self) -> usize {
        match self {
            Profile::CrossPlatform => GCM_NONCE_SIZE,
            Profile::Local => XCHACHA_NONCE_SIZE,
        }
    }
}

/// Sealed ciphertext together with everything needed to open it.
#[derive(Clone, PartialEq, Eq)]
pub struct Envelope {
    version: u8,
    profile: Profile,
    nonce: Vec<u8>,
    tag: [u8; TAG_SIZE],
    ciphertext: Vec<u8>,
}

impl Envelope {
    /// Encrypt `plaintext` under `key` with a fresh random nonce.
    ///
    /// # Postconditions
    /// - Two seals of the same plaintext never share a nonce
    ///
    /// # Errors
    /// - Returns `Crypto` if the cipher rejects its inputs
    pub fn seal(profile: Profile, key: &SymmetricKey, plaintext: &[u8], aad: &[u8]) -> Result<Self> {
        let nonce = aead::random_nonce(profile.nonce_len());
        let header = header_bytes(ENVELOPE_VERSION, profile);
        let bound = authenticated_data(&header, aad);

        let mut buffer = plaintext.to_vec();
        let sealed = match profile {
            Profile::CrossPlatform => aead::gcm_seal(key, &nonce, &bound, &mut buffer),
            Profile::Local => aead::xchacha_seal(key, &nonce, &bound, &mut buffer),
        };
        let tag = match sealed {
            Ok(tag) => tag,
            Err(e) => {
                buffer.zeroize();
                return Err(e);
            }
        };

        Ok(Self {
            version: ENVELOPE_VERSION,
            profile,
            nonce,
            tag,
            ciphertext: buffer,
        })
    }

    /// Decrypt and authenticate.
    ///
    /// # Preconditions
    /// - `expected` is the profile the caller sealed with
    ///
    /// # Errors
    /// - Returns `Authentication` with a fixed message if the profile does not
    ///   match, the key is wrong, or any byte was modified
    ///
    /// # Security
    /// - Decryption happens on a copy that is wiped on failure
    pub fn open(
        &self,
        expected: Profile,
        key: &SymmetricKey,
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        if self.profile != expected || self.nonce.len() != expected.nonce_len() {
            return Err(Error::authentication());
        }

        let header = header_bytes(self.version, self.profile);
        let bound = authenticated_data(&header, aad);

        let mut buffer = Zeroizing::new(self.ciphertext.clone());
        match self.profile {
            Profile::CrossPlatform => {
                aead::gcm_open(key, &self.nonce, &bound, &mut buffer, &self.tag)?
            }
            Profile::Local => {
                aead::xchacha_open(key, &self.nonce, &bound, &mut buffer, &self.tag)?
            }
        }
        Ok(buffer)
    }

    /// Serialize to the binary layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(HEADER_LEN + self.nonce.len() + TAG_SIZE + self.ciphertext.len());
        out.extend_from_slice(&header_bytes(self.version, self.profile));
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse the binary layout.
    ///
    /// # Errors
    /// - Returns `Corruption` for a bad magic, an unsupported version, an
    ///   unknown profile or a truncated buffer
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN || &bytes[..3] != ENVELOPE_MAGIC {
            return Err(Error::Corruption("Not an envelope".to_string()));
        }
        let version = bytes[3];
        if version != ENVELOPE_VERSION {
            return Err(Error::Corruption(format!(
                "Unsupported envelope version {}",
                version
            )));
        }
        let profile = Profile::from_id(bytes[4])?;
        let nonce_len = profile.nonce_len();

        let body = &bytes[HEADER_LEN..];
        if body.len() < nonce_len + TAG_SIZE {
            return Err(Error::Corruption("Envelope truncated".to_string()));
        }
        let (nonce, rest) = body.split_at(nonce_len);
        let (tag_bytes, ciphertext) = rest.split_at(TAG_SIZE);
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(tag_bytes);

        Ok(Self {
            version,
            profile,
            nonce: nonce.to_vec(),
            tag,
            ciphertext: ciphertext.to_vec(),
        })
    }

    /// Format version.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Cipher profile.
    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// Nonce bytes.
    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    /// Authentication tag.
    pub fn tag(&self) -> &[u8; TAG_SIZE] {
        &self.tag
    }

    /// Ciphertext without nonce or tag.
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("version", &self.version)
            .field("profile", &self.profile)
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

fn header_bytes(version: u8, profile: Profile) -> [u8; HEADER_LEN] {
    [
        ENVELOPE_MAGIC[0],
        ENVELOPE_MAGIC[1],
        ENVELOPE_MAGIC[2],
        version,
        profile.id(),
    ]
}

fn authenticated_data(header: &[u8], aad: &[u8]) -> Vec<u8> {
    let mut bound = Vec::with_capacity(header.len() + aad.len());
    bound.extend_from_slice(header);
    bound.extend_from_slice(aad);
    bound
}

/// Seal `plaintext` into an envelope.
pub fn seal(profile: Profile, key: &SymmetricKey, plaintext: &[u8], aad: &[u8]) -> Result<Envelope> {
    Envelope::seal(profile, key, plaintext, aad)
}

/// Open an envelope sealed with `expected`.
pub fn open(
    envelope: &Envelope,
    expected: Profile,
    key: &SymmetricKey,
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    envelope.open(expected, key, aad)
}

/// Seal without associated data and return the encoded bytes.
pub fn encrypt(profile: Profile, key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    Ok(Envelope::seal(profile, key, plaintext, &[])?.to_bytes())
}

/// Decode and open bytes produced by [`encrypt`].
///
/// # Errors
/// - Returns `Authentication` for any malformed or modified input, so a
///   truncated blob is indistinguishable from a wrong key
pub fn decrypt(profile: Profile, key: &SymmetricKey, bytes: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let envelope = Envelope::from_bytes(bytes).map_err(|_| Error::authentication())?;
    envelope.open(profile, key, &[])
}

/// Overwrite a buffer that held secrets.
pub fn wipe(buffer: &mut [u8]) {
    buffer.zeroize();
}

/// Compare two secrets without early exit.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
