//! Passphrase-sealed export for moving a vault between installations.
//!
//! Layout:
//!
//! ```text
//! "KWX1" | header_len u32 LE | header JSON | CrossPlatform envelope
//! ```
//!
//! The envelope holds a full [`crate::json`] document. The exact header
//! bytes, prefixed with `portable:`, are its associated data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use keyward_common::{Error, Result, SensitiveBytes};
use keyward_crypto::{derive_for_new_vault, derive_key, Envelope, KdfAlgorithm, KdfParameters, Profile};
use keyward_vault::VaultStore;

use crate::json::{self, ExportMode};
use crate::limits::ImportLimits;
use crate::report::{ImportFormat, ImportOutcome};

/// File magic.
pub const PORTABLE_MAGIC: &[u8; 4] = b"KWX1";

/// Current header format version.
pub const PORTABLE_VERSION: u32 = 1;

const AAD_PREFIX: &[u8] = b"portable:";
const MAX_HEADER_LEN: usize = 64 * 1024;

/// Cleartext header of a portable export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortableHeader {
    pub format_version: u32,
    pub kdf: KdfParameters,
    pub exported_at: DateTime<Utc>,
    pub entry_count: usize,
}

/// Whether `input` starts with the portable export magic.
pub fn is_portable(input: &[u8]) -> bool {
    input.starts_with(PORTABLE_MAGIC)
}

fn aad(header_bytes: &[u8]) -> Vec<u8> {
    let mut aad = AAD_PREFIX.to_vec();
    aad.extend_from_slice(header_bytes);
    aad
}

/// Seal `store` under `passphrase`.
///
/// `kdf` supplies the costs; a fresh salt is always drawn.
///
/// # Errors
/// - `Validation` for an empty passphrase or a recipe other than the primary
///   algorithm
pub fn export_portable(
    store: &VaultStore,
    passphrase: &SensitiveBytes,
    kdf: &KdfParameters,
    now: DateTime<Utc>,
) -> Result<Vec<u8>> {
    if kdf.algorithm != KdfAlgorithm::Primary {
        return Err(Error::Validation(
            "Portable exports require the primary key derivation".to_string(),
        ));
    }
    let kdf = kdf.reseeded();
    let key = derive_for_new_vault(passphrase.as_bytes(), &kdf)?.to_symmetric_key()?;

    let header = PortableHeader {
        format_version: PORTABLE_VERSION,
        kdf,
        exported_at: now,
        entry_count: store.len(),
    };
    let header_bytes = serde_json::to_vec(&header)?;
    let header_len = u32::try_from(header_bytes.len())
        .map_err(|_| Error::Serialization("Portable header too large".to_string()))?;

    let document = json::export_json(store, ExportMode::Full, now)?;
    let envelope = Envelope::seal(Profile::CrossPlatform, &key, &document, &aad(&header_bytes))?;

    let mut out = Vec::with_capacity(8 + header_bytes.len() + document.len() + 64);
    out.extend_from_slice(PORTABLE_MAGIC);
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&envelope.to_bytes());
    info!(entries = header.entry_count, "Sealed portable export");
    Ok(out)
}

/// Split a portable export into its header bytes, parsed header and
/// envelope.
fn parse(input: &[u8]) -> Result<(&[u8], PortableHeader, Envelope)> {
    if !is_portable(input) {
        return Err(Error::Validation("Not a portable export".to_string()));
    }
    let len_bytes: [u8; 4] = input
        .get(4..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::Corruption("Truncated portable export".to_string()))?;
    let header_len = u32::from_le_bytes(len_bytes) as usize;
    if header_len > MAX_HEADER_LEN {
        return Err(Error::Corruption("Portable header too large".to_string()));
    }
    let header_bytes = input
        .get(8..8 + header_len)
        .ok_or_else(|| Error::Corruption("Truncated portable export".to_string()))?;
    let header: PortableHeader = serde_json::from_slice(header_bytes)
        .map_err(|e| Error::Corruption(format!("Portable header: {}", e)))?;
    if header.format_version != PORTABLE_VERSION {
        return Err(Error::Validation(format!(
            "Unsupported portable export version {}",
            header.format_version
        )));
    }
    let envelope = Envelope::from_bytes(&input[8 + header_len..])?;
    Ok((header_bytes, header, envelope))
}

/// Open a portable export sealed with `passphrase`.
///
/// # Errors
/// - `Validation` for a foreign file, an empty passphrase or a header
///   naming anything but the primary derivation
/// - `Authentication` for a wrong passphrase or any modified byte
/// - `Corruption` for a structurally broken header
pub fn import_portable(
    input: &[u8],
    passphrase: &SensitiveBytes,
    limits: &ImportLimits,
) -> Result<ImportOutcome> {
    limits.check_input(input)?;
    let (header_bytes, header, envelope) = parse(input)?;
    if header.kdf.algorithm != KdfAlgorithm::Primary {
        return Err(Error::Validation(
            "Portable exports require the primary key derivation".to_string(),
        ));
    }
    debug!(
        entries = header.entry_count,
        exported_at = %header.exported_at,
        "Opening portable export"
    );

    let key = derive_key(passphrase.as_bytes(), &header.kdf)?.to_symmetric_key()?;
    let document = envelope.open(Profile::CrossPlatform, &key, &aad(header_bytes))?;
    json::import_document(&document, limits, ImportFormat::Portable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyward_crypto::kdf::ARGON2_MIN_MEMORY_KIB;
    use keyward_vault::VaultEntry;

    fn kdf() -> KdfParameters {
        KdfParameters::primary_with(ARGON2_MIN_MEMORY_KIB, 2, 1).unwrap()
    }

    fn store() -> VaultStore {
        let mut store = VaultStore::new();
        store
            .add_entry(VaultEntry::login("Mail", "alice", "hunter2").with_url("https://mail.test"))
            .unwrap();
        store
    }

    fn pass(value: &str) -> SensitiveBytes {
        SensitiveBytes::from_passphrase(value)
    }

    #[test]
    fn test_roundtrip() {
        let original = store();
        let sealed = export_portable(&original, &pass("transfer"), &kdf(), Utc::now()).unwrap();
        assert!(is_portable(&sealed));
        assert!(!sealed.windows(7).any(|w| w == b"hunter2"));

        let outcome = import_portable(&sealed, &pass("transfer"), &ImportLimits::default()).unwrap();
        assert_eq!(outcome.report.format, ImportFormat::Portable);
        assert_eq!(outcome.report.imported, 1);
        assert_eq!(outcome.entries[0].password, "hunter2");
    }

    #[test]
    fn test_each_export_uses_fresh_salt() {
        let params = kdf();
        let a = export_portable(&store(), &pass("transfer"), &params, Utc::now()).unwrap();
        let b = export_portable(&store(), &pass("transfer"), &params, Utc::now()).unwrap();
        let (_, ha, _) = parse(&a).unwrap();
        let (_, hb, _) = parse(&b).unwrap();
        assert_ne!(ha.kdf.salt, hb.kdf.salt);
        assert_ne!(ha.kdf.salt, params.salt);
    }

    #[test]
    fn test_wrong_passphrase() {
        let sealed = export_portable(&store(), &pass("transfer"), &kdf(), Utc::now()).unwrap();
        let err = import_portable(&sealed, &pass("guess"), &ImportLimits::default()).unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[test]
    fn test_header_tamper_detected() {
        let mut sealed = export_portable(&store(), &pass("transfer"), &kdf(), Utc::now()).unwrap();
        let header_len = u32::from_le_bytes(sealed[4..8].try_into().unwrap()) as usize;
        let header = std::str::from_utf8(&sealed[8..8 + header_len]).unwrap().to_string();
        let edited = header.replace("\"entry_count\":1", "\"entry_count\":9");
        assert_eq!(edited.len(), header.len());
        sealed[8..8 + header_len].copy_from_slice(edited.as_bytes());

        let err = import_portable(&sealed, &pass("transfer"), &ImportLimits::default()).unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[test]
    fn test_body_tamper_detected() {
        let mut sealed = export_portable(&store(), &pass("transfer"), &kdf(), Utc::now()).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        let err = import_portable(&sealed, &pass("transfer"), &ImportLimits::default()).unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[test]
    fn test_legacy_recipe_refused() {
        let legacy = KdfParameters::legacy(100_000).unwrap();
        let err = export_portable(&store(), &pass("transfer"), &legacy, Utc::now()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_foreign_and_truncated_input() {
        let err = import_portable(b"PK\x03\x04", &pass("x"), &ImportLimits::default()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = import_portable(b"KWX1\x10", &pass("x"), &ImportLimits::default()).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }
}
