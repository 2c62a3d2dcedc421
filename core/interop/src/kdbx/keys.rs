//! KDBX key schedule: composite key, transformation and derived keys.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::{Aes256, Block};
use argon2::{Algorithm, Argon2, Params, Version};
use sha2::{Digest, Sha256, Sha512};
use zeroize::{Zeroize, Zeroizing};

use keyward_common::{Error, Result};

use super::header::{Argon2Variant, KdfConfig};

/// Upper bound on AES-KDF rounds accepted from a file.
pub const MAX_AES_ROUNDS: u64 = 60_000_000;

/// Upper bound on Argon2 memory accepted from a file (1 GiB).
pub const MAX_ARGON2_MEMORY_BYTES: u64 = 1024 * 1024 * 1024;

/// Upper bound on Argon2 passes accepted from a file.
pub const MAX_ARGON2_ITERATIONS: u64 = 100;

/// Upper bound on Argon2 lanes accepted from a file.
pub const MAX_ARGON2_PARALLELISM: u32 = 16;

/// SHA-256 of SHA-256 of the password. Key files are not supported.
pub(crate) fn composite_key(password: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut inner: [u8; 32] = Sha256::digest(password).into();
    let outer: [u8; 32] = Sha256::digest(inner).into();
    inner.zeroize();
    Zeroizing::new(outer)
}

/// Apply the header's key transformation to the composite key.
///
/// # Errors
/// - `Validation` when the parameters exceed the accepted bounds
pub(crate) fn transform(kdf: &KdfConfig, composite: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>> {
    match kdf {
        KdfConfig::Aes { seed, rounds } => aes_kdf(seed, *rounds, composite),
        KdfConfig::Argon2 {
            variant,
            salt,
            memory_bytes,
            iterations,
            parallelism,
            version,
        } => {
            if *memory_bytes > MAX_ARGON2_MEMORY_BYTES
                || *iterations == 0
                || *iterations > MAX_ARGON2_ITERATIONS
                || *parallelism == 0
                || *parallelism > MAX_ARGON2_PARALLELISM
            {
                return Err(Error::Validation(
                    "Argon2 parameters out of accepted range".to_string(),
                ));
            }
            let version = match version {
                0x10 => Version::V0x10,
                0x13 => Version::V0x13,
                other => {
                    return Err(Error::Validation(format!(
                        "Unsupported Argon2 version {:#x}",
                        other
                    )))
                }
            };
            let algorithm = match variant {
                Argon2Variant::D => Algorithm::Argon2d,
                Argon2Variant::Id => Algorithm::Argon2id,
            };
            let params = Params::new(
                (*memory_bytes / 1024) as u32,
                *iterations as u32,
                *parallelism,
                Some(32),
            )
            .map_err(|e| Error::Validation(format!("Invalid Argon2 parameters: {}", e)))?;

            let mut out = Zeroizing::new([0u8; 32]);
            Argon2::new(algorithm, version, params)
                .hash_password_into(composite, salt, &mut out[..])
                .map_err(|e| Error::Crypto(format!("Argon2 failed: {}", e)))?;
            Ok(out)
        }
    }
}

fn aes_kdf(seed: &[u8], rounds: u64, composite: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>> {
    if seed.len() != 32 {
        return Err(Error::Validation("AES-KDF seed must be 32 bytes".to_string()));
    }
    if rounds == 0 || rounds > MAX_AES_ROUNDS {
        return Err(Error::Validation(
            "AES-KDF rounds out of accepted range".to_string(),
        ));
    }

    let cipher = Aes256::new(GenericArray::from_slice(seed));
    let mut blocks: [Block; 2] = [
        GenericArray::clone_from_slice(&composite[..16]),
        GenericArray::clone_from_slice(&composite[16..]),
    ];
    for _ in 0..rounds {
        cipher.encrypt_blocks(&mut blocks);
    }

    let mut hasher = Sha256::new();
    for block in blocks.iter_mut() {
        hasher.update(block.as_slice());
        block.as_mut_slice().zeroize();
    }
    Ok(Zeroizing::new(hasher.finalize().into()))
}

/// Key for the outer cipher.
pub(crate) fn master_key(master_seed: &[u8], transformed: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    let digest: [u8; 32] = Sha256::new()
        .chain_update(master_seed)
        .chain_update(transformed)
        .finalize()
        .into();
    Zeroizing::new(digest)
}

/// Base key for the v4 header and block HMACs.
pub(crate) fn hmac_base_key(master_seed: &[u8], transformed: &[u8; 32]) -> Zeroizing<[u8; 64]> {
    let digest = Sha512::new()
        .chain_update(master_seed)
        .chain_update(transformed)
        .chain_update([0x01u8])
        .finalize();
    let mut key = Zeroizing::new([0u8; 64]);
    key.copy_from_slice(&digest);
    key
}

/// HMAC key for block `index`; the header uses `u64::MAX`.
pub(crate) fn block_hmac_key(base: &[u8; 64], index: u64) -> Zeroizing<[u8; 64]> {
    let digest = Sha512::new()
        .chain_update(index.to_le_bytes())
        .chain_update(base)
        .finalize();
    let mut key = Zeroizing::new([0u8; 64]);
    key.copy_from_slice(&digest);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_key_is_double_sha256() {
        let expected: [u8; 32] = Sha256::digest(Sha256::digest(b"secret")).into();
        assert_eq!(*composite_key(b"secret"), expected);
    }

    #[test]
    fn test_aes_kdf_depends_on_rounds_and_seed() {
        let composite = composite_key(b"pw");
        let seed = [1u8; 32];
        let a = aes_kdf(&seed, 10, &composite).unwrap();
        let b = aes_kdf(&seed, 11, &composite).unwrap();
        let c = aes_kdf(&[2u8; 32], 10, &composite).unwrap();
        assert_ne!(*a, *b);
        assert_ne!(*a, *c);
        assert_eq!(*a, *aes_kdf(&seed, 10, &composite).unwrap());
    }

    #[test]
    fn test_hostile_parameters_are_refused() {
        let composite = composite_key(b"pw");
        let too_many_rounds = KdfConfig::Aes {
            seed: vec![0u8; 32],
            rounds: MAX_AES_ROUNDS + 1,
        };
        assert!(matches!(
            transform(&too_many_rounds, &composite),
            Err(Error::Validation(_))
        ));

        let huge_memory = KdfConfig::Argon2 {
            variant: Argon2Variant::Id,
            salt: vec![0u8; 32],
            memory_bytes: MAX_ARGON2_MEMORY_BYTES * 2,
            iterations: 2,
            parallelism: 1,
            version: 0x13,
        };
        assert!(matches!(
            transform(&huge_memory, &composite),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_block_keys_differ_per_index() {
        let base = hmac_base_key(&[0u8; 32], &[1u8; 32]);
        assert_ne!(*block_hmac_key(&base, 0), *block_hmac_key(&base, 1));
        assert_ne!(*block_hmac_key(&base, 0), *block_hmac_key(&base, u64::MAX));
    }
}
