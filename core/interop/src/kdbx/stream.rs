//! Payload layers: outer cipher, block framing, gzip and the inner
//! random stream.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit, StreamCipher};
use flate2::read::GzDecoder;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use std::io::Read;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use keyward_common::{Error, Result};

use super::header::{ByteReader, InnerStreamKind, OuterCipher};
use super::keys::block_hmac_key;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Fixed nonce of the Salsa20 inner stream.
const SALSA20_NONCE: [u8; 8] = [0xE8, 0x30, 0x09, 0x4B, 0x97, 0x20, 0x5D, 0x2A];

/// Decrypt the outer payload.
pub(crate) fn decrypt_outer(
    cipher: OuterCipher,
    key: &[u8; 32],
    iv: &[u8],
    data: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let mut buffer = Zeroizing::new(data.to_vec());
    match cipher {
        OuterCipher::Aes256Cbc => {
            let decryptor = Aes256CbcDec::new_from_slices(key, iv)
                .map_err(|_| Error::Corruption("Invalid AES IV length".to_string()))?;
            let len = decryptor
                .decrypt_padded_mut::<Pkcs7>(buffer.as_mut_slice())
                .map_err(|_| Error::authentication())?
                .len();
            buffer.truncate(len);
        }
        OuterCipher::ChaCha20 => {
            let mut stream = chacha20::ChaCha20::new_from_slices(key, iv)
                .map_err(|_| Error::Corruption("Invalid ChaCha20 nonce length".to_string()))?;
            stream.apply_keystream(buffer.as_mut_slice());
        }
    }
    Ok(buffer)
}

/// Reassemble the v3 hashed block stream, checking every block hash.
pub(crate) fn read_hashed_blocks(data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let mut reader = ByteReader::new(data);
    let mut out = Zeroizing::new(Vec::with_capacity(data.len()));

    for expected_index in 0u32.. {
        let index = reader.u32()?;
        if index != expected_index {
            return Err(Error::Corruption("Hashed block out of order".to_string()));
        }
        let hash = reader.bytes(32)?;
        let size = reader.length()?;
        if size == 0 {
            if hash.iter().any(|b| *b != 0) {
                return Err(Error::Corruption("Malformed final hashed block".to_string()));
            }
            break;
        }
        let block = reader.bytes(size)?;
        if !bool::from(Sha256::digest(block).as_slice().ct_eq(hash)) {
            return Err(Error::Corruption("Hashed block digest mismatch".to_string()));
        }
        out.extend_from_slice(block);
    }
    Ok(out)
}

/// Verify a v4 header HMAC.
pub(crate) fn verify_header_hmac(header: &[u8], tag: &[u8], base_key: &[u8; 64]) -> Result<()> {
    let key = block_hmac_key(base_key, u64::MAX);
    let mut mac = HmacSha256::new_from_slice(key.as_slice())
        .map_err(|e| Error::Crypto(e.to_string()))?;
    mac.update(header);
    mac.verify_slice(tag).map_err(|_| Error::authentication())
}

/// Reassemble the v4 HMAC block stream, authenticating every block.
pub(crate) fn read_hmac_blocks(data: &[u8], base_key: &[u8; 64]) -> Result<Vec<u8>> {
    let mut reader = ByteReader::new(data);
    let mut out = Vec::with_capacity(data.len());

    for index in 0u64.. {
        let tag = reader.bytes(32)?;
        let size = reader.length()?;
        let block = reader.bytes(size)?;

        let key = block_hmac_key(base_key, index);
        let mut mac = HmacSha256::new_from_slice(key.as_slice())
            .map_err(|e| Error::Crypto(e.to_string()))?;
        mac.update(&index.to_le_bytes());
        mac.update(&(size as i32).to_le_bytes());
        mac.update(block);
        mac.verify_slice(tag)
            .map_err(|_| Error::Corruption("Block HMAC mismatch".to_string()))?;

        if size == 0 {
            break;
        }
        out.extend_from_slice(block);
    }
    Ok(out)
}

/// Decompress gzip, failing as soon as the output passes `max_bytes`.
pub(crate) fn gunzip_bounded(data: &[u8], max_bytes: u64) -> Result<Zeroizing<Vec<u8>>> {
    let mut out = Zeroizing::new(Vec::new());
    GzDecoder::new(data)
        .take(max_bytes.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| Error::Corruption(format!("Invalid gzip payload: {}", e)))?;
    if out.len() as u64 > max_bytes {
        return Err(Error::Validation(format!(
            "Decompressed payload exceeds {} bytes",
            max_bytes
        )));
    }
    Ok(out)
}

/// Keystream that unmasks protected XML values in document order.
pub(crate) enum InnerStream {
    None,
    Salsa20(salsa20::Salsa20),
    ChaCha20(chacha20::ChaCha20),
}

impl InnerStream {
    pub(crate) fn new(kind: InnerStreamKind, key: &[u8]) -> Result<Self> {
        match kind {
            InnerStreamKind::None => Ok(Self::None),
            InnerStreamKind::Salsa20 => {
                let mut stream_key: [u8; 32] = Sha256::digest(key).into();
                let cipher = salsa20::Salsa20::new_from_slices(&stream_key, &SALSA20_NONCE)
                    .map_err(|e| Error::Crypto(e.to_string()));
                stream_key.zeroize();
                Ok(Self::Salsa20(cipher?))
            }
            InnerStreamKind::ChaCha20 => {
                let mut digest = Sha512::digest(key);
                let cipher = chacha20::ChaCha20::new_from_slices(&digest[..32], &digest[32..44])
                    .map_err(|e| Error::Crypto(e.to_string()));
                digest.as_mut_slice().zeroize();
                Ok(Self::ChaCha20(cipher?))
            }
        }
    }

    /// XOR the next `data.len()` keystream bytes into `data`.
    pub(crate) fn unprotect(&mut self, data: &mut [u8]) {
        match self {
            Self::None => {}
            Self::Salsa20(cipher) => cipher.apply_keystream(data),
            Self::ChaCha20(cipher) => cipher.apply_keystream(data),
        }
    }
}
