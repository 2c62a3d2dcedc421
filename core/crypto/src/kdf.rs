//! Passphrase key derivation.
//!
//! Three algorithms are supported:
//! - `Primary`: Argon2id, memory-hard, the default for new vaults.
//! - `Fallback`: scrypt, for devices that cannot afford Argon2 memory costs.
//! - `Legacy`: PBKDF2-HMAC-SHA256, kept so old vaults can still be opened.
//!
//! Parameters below the documented floors are rejected when constructed.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use zeroize::Zeroizing;

use crate::keys::{Salt, SaltOrigin, SymmetricKey, KEY_LENGTH, MAX_SALT_LENGTH, MIN_SALT_LENGTH};
use keyward_common::{Error, Result, SensitiveBytes};

/// Minimum Argon2 memory cost in KiB (19 MiB).
pub const ARGON2_MIN_MEMORY_KIB: u32 = 19_456;
/// Maximum Argon2 memory cost accepted from a stored header (4 GiB).
pub const ARGON2_MAX_MEMORY_KIB: u32 = 4 * 1024 * 1024;
/// Minimum Argon2 passes.
pub const ARGON2_MIN_TIME_COST: u32 = 2;
/// Maximum Argon2 passes accepted from a stored header.
pub const ARGON2_MAX_TIME_COST: u32 = 64;
/// Maximum lanes for any algorithm.
pub const MAX_PARALLELISM: u32 = 16;
/// Minimum scrypt work factor exponent (N = 2^15).
pub const SCRYPT_MIN_LOG_N: u32 = 15;
/// Maximum scrypt work factor exponent.
pub const SCRYPT_MAX_LOG_N: u32 = 22;
/// scrypt block size parameter.
pub const SCRYPT_BLOCK_SIZE: u32 = 8;
/// Minimum PBKDF2 iterations for freshly constructed parameters.
pub const PBKDF2_MIN_ITERATIONS: u32 = 100_000;
/// Minimum PBKDF2 iterations accepted when reading an existing vault.
pub const PBKDF2_LEGACY_MIN_ITERATIONS: u32 = 10_000;
/// Maximum PBKDF2 iterations accepted from a stored header.
pub const PBKDF2_MAX_ITERATIONS: u32 = 10_000_000;
/// Shortest derived key.
pub const MIN_OUTPUT_LEN: usize = 16;
/// Longest derived key.
pub const MAX_OUTPUT_LEN: usize = 64;

/// Key derivation algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KdfAlgorithm {
    /// Argon2id (memory-hard).
    Primary,
    /// scrypt (CPU-hard with tunable memory).
    Fallback,
    /// PBKDF2-HMAC-SHA256 (iteration-hard, backward compatibility).
    Legacy,
}

/// Derivation recipe persisted alongside an envelope.
///
/// Cost fields are interpreted per algorithm:
/// - Primary: `memory_cost_kib`, `time_cost` (passes), `parallelism` (lanes)
/// - Fallback: `time_cost` is log2(N), `parallelism` is p, `memory_cost_kib`
///   records the resulting memory (128 * r * N bytes)
/// - Legacy: `time_cost` is the iteration count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParameters {
    pub algorithm: KdfAlgorithm,
    pub memory_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
    pub output_len: usize,
    pub salt: Salt,
    pub salt_origin: SaltOrigin,
}

impl KdfParameters {
    /// Argon2id parameters for interactive unlock (64 MiB, 3 passes, 4 lanes)
    /// with a fresh random salt.
    pub fn primary() -> Self {
        Self {
            algorithm: KdfAlgorithm::Primary,
            memory_cost_kib: 65_536,
            time_cost: 3,
            parallelism: 4,
            output_len: KEY_LENGTH,
            salt: Salt::generate(),
            salt_origin: SaltOrigin::Random,
        }
    }

    /// Parameters for any algorithm with explicit costs and a fresh salt.
    ///
    /// For `Fallback`, `time_cost` is log2(N) and `memory_cost_kib` is
    /// recomputed from it. For `Legacy`, `time_cost` is the iteration count.
    ///
    /// # Errors
    /// - Returns `Validation` if any cost is below its floor
    pub fn new(
        algorithm: KdfAlgorithm,
        memory_cost_kib: u32,
        time_cost: u32,
        parallelism: u32,
    ) -> Result<Self> {
        match algorithm {
            KdfAlgorithm::Primary => Self::primary_with(memory_cost_kib, time_cost, parallelism),
            KdfAlgorithm::Fallback => Self::fallback_with(time_cost, parallelism),
            KdfAlgorithm::Legacy => Self::legacy(time_cost),
        }
    }

    /// Argon2id with explicit costs and a fresh random salt.
    ///
    /// # Errors
    /// - Returns `Validation` if any cost is below its floor
    pub fn primary_with(memory_cost_kib: u32, time_cost: u32, parallelism: u32) -> Result<Self> {
        let params = Self {
            memory_cost_kib,
            time_cost,
            parallelism,
            ..Self::primary()
        };
        params.validate()?;
        Ok(params)
    }

    /// scrypt parameters (N = 2^17, r = 8, p = 1) with a fresh random salt.
    pub fn fallback() -> Self {
        Self::scrypt_params(17, 1)
    }

    /// scrypt with explicit costs.
    ///
    /// # Errors
    /// - Returns `Validation` if log_n is below its floor
    pub fn fallback_with(log_n: u32, parallelism: u32) -> Result<Self> {
        let params = Self::scrypt_params(log_n, parallelism);
        params.validate()?;
        Ok(params)
    }

    fn scrypt_params(log_n: u32, parallelism: u32) -> Self {
        let memory_cost_kib = if log_n < 32 {
            // 128 * r * N bytes, r = 8  =>  N KiB
            (1u64 << log_n).min(u32::MAX as u64) as u32
        } else {
            u32::MAX
        };
        Self {
            algorithm: KdfAlgorithm::Fallback,
            memory_cost_kib,
            time_cost: log_n,
            parallelism,
            output_len: KEY_LENGTH,
            salt: Salt::generate(),
            salt_origin: SaltOrigin::Random,
        }
    }

    /// PBKDF2-HMAC-SHA256 parameters.
    ///
    /// # Errors
    /// - Returns `Validation` if iterations are below PBKDF2_MIN_ITERATIONS
    pub fn legacy(iterations: u32) -> Result<Self> {
        let params = Self {
            algorithm: KdfAlgorithm::Legacy,
            memory_cost_kib: 0,
            time_cost: iterations,
            parallelism: 1,
            output_len: KEY_LENGTH,
            salt: Salt::generate(),
            salt_origin: SaltOrigin::Random,
        };
        params.validate()?;
        Ok(params)
    }

    /// Replace the salt, e.g. to reproduce a stored recipe.
    pub fn with_salt(mut self, salt: Salt, origin: SaltOrigin) -> Self {
        self.salt = salt;
        self.salt_origin = origin;
        self
    }

    /// Replace the output length.
    pub fn with_output_len(mut self, output_len: usize) -> Self {
        self.output_len = output_len;
        self
    }

    /// Same costs, fresh random salt.
    pub fn reseeded(&self) -> Self {
        Self {
            salt: Salt::generate(),
            salt_origin: SaltOrigin::Random,
            ..self.clone()
        }
    }

    /// Construction-time validation against the minimum-security floors.
    pub fn validate(&self) -> Result<()> {
        self.check(PBKDF2_MIN_ITERATIONS)
    }

    /// Validation of a recipe read from an existing vault.
    ///
    /// Identical to [`validate`](Self::validate) except that the legacy
    /// iteration floor is relaxed so historical vaults stay readable.
    pub fn validate_existing(&self) -> Result<()> {
        self.check(PBKDF2_LEGACY_MIN_ITERATIONS)
    }

    /// Validation for a recipe about to protect a new vault or a re-seal.
    ///
    /// Rejects the legacy algorithm and any non-random salt.
    pub fn ensure_new_vault(&self) -> Result<()> {
        self.validate()?;
        if self.algorithm == KdfAlgorithm::Legacy {
            return Err(Error::Validation(
                "Legacy derivation cannot be used for new vaults".to_string(),
            ));
        }
        if self.salt_origin != SaltOrigin::Random {
            return Err(Error::Validation(
                "New vaults require a randomly generated salt".to_string(),
            ));
        }
        Ok(())
    }

    fn check(&self, pbkdf2_floor: u32) -> Result<()> {
        if self.output_len < MIN_OUTPUT_LEN || self.output_len > MAX_OUTPUT_LEN {
            return Err(Error::Validation(format!(
                "Output length must be {}..={} bytes",
                MIN_OUTPUT_LEN, MAX_OUTPUT_LEN
            )));
        }
        if self.salt.len() < MIN_SALT_LENGTH || self.salt.len() > MAX_SALT_LENGTH {
            return Err(Error::Validation(format!(
                "Salt must be {}..={} bytes",
                MIN_SALT_LENGTH, MAX_SALT_LENGTH
            )));
        }
        if self.parallelism == 0 || self.parallelism > MAX_PARALLELISM {
            return Err(Error::Validation(format!(
                "Parallelism must be 1..={}",
                MAX_PARALLELISM
            )));
        }

        match self.algorithm {
            KdfAlgorithm::Primary => {
                if self.memory_cost_kib < ARGON2_MIN_MEMORY_KIB {
                    return Err(Error::Validation(format!(
                        "Argon2 memory cost below {} KiB",
                        ARGON2_MIN_MEMORY_KIB
                    )));
                }
                if self.memory_cost_kib > ARGON2_MAX_MEMORY_KIB {
                    return Err(Error::Validation("Argon2 memory cost too large".to_string()));
                }
                if self.time_cost < ARGON2_MIN_TIME_COST {
                    return Err(Error::Validation(format!(
                        "Argon2 time cost below {}",
                        ARGON2_MIN_TIME_COST
                    )));
                }
                if self.time_cost > ARGON2_MAX_TIME_COST {
                    return Err(Error::Validation("Argon2 time cost too large".to_string()));
                }
            }
            KdfAlgorithm::Fallback => {
                if self.time_cost < SCRYPT_MIN_LOG_N {
                    return Err(Error::Validation(format!(
                        "scrypt log_n below {}",
                        SCRYPT_MIN_LOG_N
                    )));
                }
                if self.time_cost > SCRYPT_MAX_LOG_N {
                    return Err(Error::Validation("scrypt log_n too large".to_string()));
                }
            }
            KdfAlgorithm::Legacy => {
                if self.time_cost < pbkdf2_floor {
                    return Err(Error::Validation(format!(
                        "PBKDF2 iteration count below {}",
                        pbkdf2_floor
                    )));
                }
                if self.time_cost > PBKDF2_MAX_ITERATIONS {
                    return Err(Error::Validation(
                        "PBKDF2 iteration count too large".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Default for KdfParameters {
    fn default() -> Self {
        Self::primary()
    }
}

/// Output of a derivation: the key bytes and the exact recipe used.
pub struct DerivedKey {
    bytes: Zeroizing<Vec<u8>>,
    params: KdfParameters,
}

impl DerivedKey {
    /// Raw derived bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Parameters that reproduce this key.
    pub fn params(&self) -> &KdfParameters {
        &self.params
    }

    /// Convert into an envelope key.
    ///
    /// # Errors
    /// - Returns error if the output length is not KEY_LENGTH
    pub fn to_symmetric_key(&self) -> Result<SymmetricKey> {
        SymmetricKey::from_slice(&self.bytes)
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("bytes", &"[REDACTED]")
            .field("params", &self.params)
            .finish()
    }
}

/// Derive a key from a passphrase.
///
/// # Preconditions
/// - `passphrase` must not be empty
/// - `params` must pass [`KdfParameters::validate_existing`]
///
/// # Postconditions
/// - The derived key is deterministic given the same inputs
///
/// # Errors
/// - `Validation` for an empty passphrase or parameters below the floors
/// - `Crypto` if the underlying primitive rejects the parameters
///
/// # Security
/// - Passphrase is not stored or logged
/// - The output buffer is zeroized on drop
pub fn derive_key(passphrase: &[u8], params: &KdfParameters) -> Result<DerivedKey> {
    if passphrase.is_empty() {
        return Err(Error::Validation("Passphrase cannot be empty".to_string()));
    }
    params.validate_existing()?;

    let mut output = Zeroizing::new(vec![0u8; params.output_len]);
    match params.algorithm {
        KdfAlgorithm::Primary => {
            let argon2_params = Params::new(
                params.memory_cost_kib,
                params.time_cost,
                params.parallelism,
                Some(params.output_len),
            )
            .map_err(|e| Error::Crypto(format!("Invalid KDF parameters: {}", e)))?;

            Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params)
                .hash_password_into(passphrase, params.salt.as_bytes(), &mut output)
                .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;
        }
        KdfAlgorithm::Fallback => {
            let scrypt_params = scrypt::Params::new(
                params.time_cost as u8,
                SCRYPT_BLOCK_SIZE,
                params.parallelism,
                params.output_len,
            )
            .map_err(|e| Error::Crypto(format!("Invalid KDF parameters: {}", e)))?;

            scrypt::scrypt(passphrase, params.salt.as_bytes(), &scrypt_params, &mut output)
                .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;
        }
        KdfAlgorithm::Legacy => {
            pbkdf2::pbkdf2_hmac::<Sha256>(
                passphrase,
                params.salt.as_bytes(),
                params.time_cost,
                &mut output,
            );
        }
    }

    Ok(DerivedKey {
        bytes: output,
        params: params.clone(),
    })
}

/// Derive a key that will protect a new vault or a re-sealed one.
///
/// # Errors
/// - `Validation` if the parameters use the legacy algorithm or a
///   non-random salt, in addition to the errors of [`derive_key`]
pub fn derive_for_new_vault(passphrase: &[u8], params: &KdfParameters) -> Result<DerivedKey> {
    params.ensure_new_vault()?;
    derive_key(passphrase, params)
}

/// Derive a key on the blocking thread pool, abandoning it on cancellation.
///
/// The derivation itself cannot be interrupted; when `cancel` fires the
/// caller gets `Cancelled` immediately and the detached computation's result
/// is zeroized as soon as it completes.
pub async fn derive_key_cancellable(
    passphrase: SensitiveBytes,
    params: KdfParameters,
    cancel: CancellationToken,
) -> Result<DerivedKey> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let task = tokio::task::spawn_blocking(move || derive_key(passphrase.as_bytes(), &params));

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("Key derivation abandoned by caller");
            Err(Error::Cancelled)
        }
        joined = task => {
            joined.map_err(|e| Error::Crypto(format!("Derivation task failed: {}", e)))?
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_primary() -> KdfParameters {
        KdfParameters::primary_with(ARGON2_MIN_MEMORY_KIB, 2, 1).unwrap()
    }

    #[test]
    fn test_known_answer_vector() {
        let salt = Salt::from_bytes(b"0123456789abcdef".to_vec()).unwrap();
        let params = KdfParameters::primary_with(65_536, 3, 4)
            .unwrap()
            .with_salt(salt, SaltOrigin::Random);

        let key = derive_key(b"correct horse battery staple", &params).unwrap();

        assert_eq!(
            hex::encode(key.as_bytes()),
            "efb51f9a76584f6dd6a4f7942a1a2f6ae5a6e4ec5142ff674dfd5d27eb45e446"
        );
        assert_eq!(key.params(), &params);
    }

    #[test]
    fn test_derive_key_deterministic() {
        let params = fast_primary();

        let key1 = derive_key(b"test-password-123", &params).unwrap();
        let key2 = derive_key(b"test-password-123", &params).unwrap();

        assert_eq!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_derive_key_different_salt() {
        let params1 = fast_primary();
        let params2 = params1.reseeded();

        let key1 = derive_key(b"test-password-123", &params1).unwrap();
        let key2 = derive_key(b"test-password-123", &params2).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_derive_key_different_password() {
        let params = fast_primary();

        let key1 = derive_key(b"password1", &params).unwrap();
        let key2 = derive_key(b"password2", &params).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_derive_key_empty_password_fails() {
        let params = fast_primary();
        assert!(matches!(derive_key(b"", &params), Err(Error::Validation(_))));
    }

    #[test]
    fn test_floors_rejected_at_construction() {
        assert!(matches!(
            KdfParameters::primary_with(8_192, 3, 4),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            KdfParameters::primary_with(65_536, 1, 4),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            KdfParameters::primary_with(65_536, 3, 0),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            KdfParameters::fallback_with(10, 1),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            KdfParameters::legacy(1_000),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_output_length_bounds() {
        let params = fast_primary().with_output_len(8);
        assert!(params.validate().is_err());
        let params = fast_primary().with_output_len(64);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_legacy_relaxed_floor_for_existing() {
        let mut params = KdfParameters::legacy(PBKDF2_MIN_ITERATIONS).unwrap();
        params.time_cost = 20_000;
        assert!(params.validate().is_err());
        assert!(params.validate_existing().is_ok());

        let key = derive_key(b"old-vault", &params).unwrap();
        assert_eq!(key.as_bytes().len(), KEY_LENGTH);
    }

    #[test]
    fn test_new_vault_rejects_legacy_salt_and_algorithm() {
        let legacy_salt = fast_primary().with_salt(
            Salt::legacy_from_identifier("vault-id"),
            SaltOrigin::LegacyDerived,
        );
        assert!(legacy_salt.ensure_new_vault().is_err());

        let legacy_algo = KdfParameters::legacy(PBKDF2_MIN_ITERATIONS).unwrap();
        assert!(legacy_algo.ensure_new_vault().is_err());

        assert!(fast_primary().ensure_new_vault().is_ok());
    }

    #[test]
    fn test_derive_for_new_vault_refuses_legacy_salt() {
        let params = fast_primary().with_salt(
            Salt::legacy_from_identifier("vault-id"),
            SaltOrigin::LegacyDerived,
        );
        assert!(matches!(
            derive_for_new_vault(b"pass", &params),
            Err(Error::Validation(_))
        ));
        assert!(derive_key(b"pass", &params).is_ok());
    }

    #[test]
    fn test_new_dispatches_per_algorithm() {
        let params = KdfParameters::new(KdfAlgorithm::Fallback, 0, 16, 1).unwrap();
        assert_eq!(params.algorithm, KdfAlgorithm::Fallback);
        assert_eq!(params.memory_cost_kib, 1 << 16);
        assert!(KdfParameters::new(KdfAlgorithm::Primary, 1024, 3, 1).is_err());
    }

    #[test]
    fn test_fallback_derivation() {
        let params = KdfParameters::fallback_with(SCRYPT_MIN_LOG_N, 1).unwrap();
        let key1 = derive_key(b"pass", &params).unwrap();
        let key2 = derive_key(b"pass", &params).unwrap();
        assert_eq!(key1.as_bytes(), key2.as_bytes());
        assert_eq!(params.memory_cost_kib, 1 << SCRYPT_MIN_LOG_N);
    }

    #[test]
    fn test_params_roundtrip_through_json() {
        let params = fast_primary();
        let json = serde_json::to_string(&params).unwrap();
        let restored: KdfParameters = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, params);
    }

    #[tokio::test]
    async fn test_cancellable_derivation_completes() {
        let params = fast_primary();
        let expected = derive_key(b"pass", &params).unwrap();

        let key = derive_key_cancellable(
            SensitiveBytes::from_passphrase("pass"),
            params,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(key.as_bytes(), expected.as_bytes());
    }

    #[tokio::test]
    async fn test_cancelled_derivation_returns_cancelled() {
        let token = CancellationToken::new();
        token.cancel();

        let result = derive_key_cancellable(
            SensitiveBytes::from_passphrase("pass"),
            KdfParameters::primary(),
            token,
        )
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
