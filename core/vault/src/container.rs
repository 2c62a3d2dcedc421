//! Vault file container.
//!
//! Layout of a `.kwv` file:
//!
//! ```text
//! "KWV1" | header_len u32 LE | header JSON | body envelope
//! ```
//!
//! The header is cleartext metadata: derivation recipe, verifier, the
//! wrapped sync key and the optional duress slot. Each envelope binds the
//! header fields it depends on as associated data:
//! - body: format version, vault id, profile, KDF and verifier
//! - verifier: vault id
//! - sync key: vault id
//! - duress body: format version, vault id, profile and the duress KDF
//!
//! The sync key is random per vault and only wrapped by the passphrase key,
//! so a passphrase change on one device leaves remote blobs readable by the
//! others.
//!
//! This lets the decoy slot be re-sealed without the real key and vice versa,
//! while any edit to the fields a slot depends on fails its authentication.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::debug;

use crate::store::VaultStore;
use keyward_common::{Error, Result, VaultId};
use keyward_crypto::encoding::base64_bytes;
use keyward_crypto::{constant_time_eq, Envelope, KdfParameters, Profile, SymmetricKey, KEY_LENGTH};

/// File magic.
pub const VAULT_MAGIC: &[u8; 4] = b"KWV1";

/// Current header format version.
pub const FORMAT_VERSION: u32 = 1;

/// Default file extension.
pub const VAULT_EXTENSION: &str = "kwv";

/// Subkey context for the vault body.
pub const BODY_CONTEXT: &[u8] = b"vault-body";

/// Subkey context for the passphrase verifier.
pub const VERIFIER_CONTEXT: &[u8] = b"verifier";

/// Subkey context for sync blobs, derived from the vault sync key.
pub const SYNC_CONTEXT: &[u8] = b"sync-blob";

/// Subkey context wrapping the vault sync key.
const SYNC_WRAP_CONTEXT: &[u8] = b"sync-key";

const VERIFIER_PLAINTEXT: &[u8] = b"KEYWARD_KEY_VERIFICATION_V1";
const MAX_HEADER_LEN: usize = 1024 * 1024;

/// Decoy slot opened by the duress passphrase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuressSlot {
    pub kdf: KdfParameters,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
}

/// Cleartext vault header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultHeader {
    pub format_version: u32,
    pub vault_id: VaultId,
    pub profile: Profile,
    pub kdf: KdfParameters,
    #[serde(with = "base64_bytes")]
    pub verifier: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub sync_key: Vec<u8>,
    #[serde(default)]
    pub duress: Option<DuressSlot>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct BodyBinding<'a> {
    format_version: u32,
    vault_id: &'a VaultId,
    profile: Profile,
    kdf: &'a KdfParameters,
    #[serde(with = "base64_bytes")]
    verifier: &'a [u8],
}

#[derive(Serialize)]
struct DuressBinding<'a> {
    format_version: u32,
    vault_id: &'a VaultId,
    profile: Profile,
    kdf: &'a KdfParameters,
}

impl VaultHeader {
    fn body_aad(&self) -> Result<Vec<u8>> {
        let mut aad = b"body:".to_vec();
        serde_json::to_writer(
            &mut aad,
            &BodyBinding {
                format_version: self.format_version,
                vault_id: &self.vault_id,
                profile: self.profile,
                kdf: &self.kdf,
                verifier: &self.verifier,
            },
        )?;
        Ok(aad)
    }

    fn duress_aad(&self, kdf: &KdfParameters) -> Result<Vec<u8>> {
        let mut aad = b"duress:".to_vec();
        serde_json::to_writer(
            &mut aad,
            &DuressBinding {
                format_version: self.format_version,
                vault_id: &self.vault_id,
                profile: self.profile,
                kdf,
            },
        )?;
        Ok(aad)
    }

    fn verifier_aad(&self) -> Vec<u8> {
        let mut aad = b"verifier:".to_vec();
        aad.extend_from_slice(self.vault_id.as_str().as_bytes());
        aad
    }

    fn sync_key_aad(&self) -> Vec<u8> {
        let mut aad = b"sync-key:".to_vec();
        aad.extend_from_slice(self.vault_id.as_str().as_bytes());
        aad
    }
}

/// A parsed vault file.
#[derive(Debug, Clone)]
pub struct VaultFile {
    header: VaultHeader,
    body: Envelope,
}

impl VaultFile {
    /// Seal a store into a new vault file.
    ///
    /// # Preconditions
    /// - `master` was derived from `kdf`
    ///
    /// # Errors
    /// - `Validation` if `kdf` is not acceptable for a new vault
    pub fn create(
        vault_id: VaultId,
        profile: Profile,
        kdf: KdfParameters,
        master: &SymmetricKey,
        store: &VaultStore,
    ) -> Result<Self> {
        kdf.ensure_new_vault()?;
        Self::seal_with(vault_id, profile, kdf, master, store)
    }

    /// Seal without the new-vault checks. Used to rewrite an existing vault
    /// whose recipe predates them, and by tests that need such a vault.
    pub(crate) fn seal_with(
        vault_id: VaultId,
        profile: Profile,
        kdf: KdfParameters,
        master: &SymmetricKey,
        store: &VaultStore,
    ) -> Result<Self> {
        let now = Utc::now();
        let mut header = VaultHeader {
            format_version: FORMAT_VERSION,
            vault_id,
            profile,
            kdf,
            verifier: Vec::new(),
            sync_key: Vec::new(),
            duress: None,
            created_at: now,
            modified_at: now,
        };
        header.verifier = seal_verifier(&header, master)?;
        header.sync_key = wrap_sync_key(&header, master, &SymmetricKey::generate())?;

        let body = seal_body(&header, master, store)?;
        Ok(Self { header, body })
    }

    /// Header metadata.
    pub fn header(&self) -> &VaultHeader {
        &self.header
    }

    /// Vault identifier.
    pub fn vault_id(&self) -> &VaultId {
        &self.header.vault_id
    }

    /// Whether a duress slot is configured.
    pub fn has_duress(&self) -> bool {
        self.header.duress.is_some()
    }

    /// Check a candidate key against the verifier.
    pub fn verify(&self, master: &SymmetricKey) -> bool {
        let verifier = match Envelope::from_bytes(&self.header.verifier) {
            Ok(envelope) => envelope,
            Err(_) => return false,
        };
        let key = master.derive_subkey(VERIFIER_CONTEXT);
        match verifier.open(self.header.profile, &key, &self.header.verifier_aad()) {
            Ok(plaintext) => constant_time_eq(&plaintext, VERIFIER_PLAINTEXT),
            Err(_) => false,
        }
    }

    /// Decrypt the real store.
    ///
    /// # Errors
    /// - `Authentication` for a wrong key or a modified file
    pub fn open_body(&self, master: &SymmetricKey) -> Result<VaultStore> {
        let key = master.derive_subkey(BODY_CONTEXT);
        let plaintext = self
            .body
            .open(self.header.profile, &key, &self.header.body_aad()?)?;
        VaultStore::from_bytes(&plaintext)
    }

    /// Unwrap the vault sync key.
    ///
    /// # Errors
    /// - `Authentication` for a wrong key or a modified slot
    pub fn open_sync_key(&self, master: &SymmetricKey) -> Result<SymmetricKey> {
        let envelope =
            Envelope::from_bytes(&self.header.sync_key).map_err(|_| Error::authentication())?;
        let key = master.derive_subkey(SYNC_WRAP_CONTEXT);
        let plaintext = envelope.open(self.header.profile, &key, &self.header.sync_key_aad())?;
        SymmetricKey::from_slice(&plaintext)
    }

    /// Decrypt the decoy store.
    ///
    /// # Errors
    /// - `Authentication` if there is no duress slot or the key is wrong
    pub fn open_duress(&self, duress_key: &SymmetricKey) -> Result<VaultStore> {
        let slot = self.header.duress.as_ref().ok_or_else(Error::authentication)?;
        let envelope = Envelope::from_bytes(&slot.body).map_err(|_| Error::authentication())?;
        let key = duress_key.derive_subkey(BODY_CONTEXT);
        let plaintext = envelope.open(
            self.header.profile,
            &key,
            &self.header.duress_aad(&slot.kdf)?,
        )?;
        VaultStore::from_bytes(&plaintext)
    }

    /// Re-seal the real store under the current recipe.
    pub fn reseal_body(&mut self, master: &SymmetricKey, store: &VaultStore) -> Result<()> {
        self.body = seal_body(&self.header, master, store)?;
        self.touch();
        Ok(())
    }

    /// Replace the recipe and re-seal verifier, sync key and body under the
    /// new key.
    ///
    /// `sync_key` is the unwrapped key of this vault; it is carried over
    /// unchanged. The duress slot does not depend on the real recipe and
    /// stays valid.
    pub fn rekey(
        &mut self,
        kdf: KdfParameters,
        master: &SymmetricKey,
        store: &VaultStore,
        sync_key: &SymmetricKey,
    ) -> Result<()> {
        kdf.ensure_new_vault()?;
        self.header.kdf = kdf;
        self.header.verifier = seal_verifier(&self.header, master)?;
        self.header.sync_key = wrap_sync_key(&self.header, master, sync_key)?;
        self.reseal_body(master, store)
    }

    /// Install or replace the duress slot.
    pub fn set_duress(
        &mut self,
        kdf: KdfParameters,
        duress_key: &SymmetricKey,
        decoy: &VaultStore,
    ) -> Result<()> {
        kdf.ensure_new_vault()?;
        let body = seal_duress(&self.header, &kdf, duress_key, decoy)?;
        self.header.duress = Some(DuressSlot { kdf, body });
        self.touch();
        Ok(())
    }

    /// Re-seal the decoy store under the existing duress recipe.
    pub fn reseal_duress(&mut self, duress_key: &SymmetricKey, decoy: &VaultStore) -> Result<()> {
        let kdf = match self.header.duress.as_ref() {
            Some(slot) => slot.kdf.clone(),
            None => return Err(Error::NotFound("Duress slot".to_string())),
        };
        let body = seal_duress(&self.header, &kdf, duress_key, decoy)?;
        self.header.duress = Some(DuressSlot { kdf, body });
        self.touch();
        Ok(())
    }

    /// Remove the duress slot.
    pub fn clear_duress(&mut self) {
        if self.header.duress.take().is_some() {
            self.touch();
        }
    }

    fn touch(&mut self) {
        self.header.modified_at = Utc::now();
    }

    /// Encode to the on-disk layout.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let header = serde_json::to_vec(&self.header)?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| Error::Validation("Vault header too large".to_string()))?;

        let body = self.body.to_bytes();
        let mut out = Vec::with_capacity(8 + header.len() + body.len());
        out.extend_from_slice(VAULT_MAGIC);
        out.extend_from_slice(&header_len.to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode the on-disk layout.
    ///
    /// # Errors
    /// - `Corruption` for a bad magic, oversized or malformed header, an
    ///   unsupported version or a recipe below the read floors
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 || &bytes[..4] != VAULT_MAGIC {
            return Err(Error::Corruption("Not a Keyward vault".to_string()));
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[4..8]);
        let header_len = u32::from_le_bytes(len_bytes) as usize;
        if header_len > MAX_HEADER_LEN || bytes.len() < 8 + header_len {
            return Err(Error::Corruption("Vault header truncated".to_string()));
        }

        let header: VaultHeader = serde_json::from_slice(&bytes[8..8 + header_len])
            .map_err(|e| Error::Corruption(format!("Vault header: {}", e)))?;
        if header.format_version != FORMAT_VERSION {
            return Err(Error::Corruption(format!(
                "Unsupported vault format version {}",
                header.format_version
            )));
        }
        check_recipe(&header.kdf)?;
        if let Some(slot) = &header.duress {
            check_recipe(&slot.kdf)?;
        }

        let body = Envelope::from_bytes(&bytes[8 + header_len..])?;
        Ok(Self { header, body })
    }

    /// Read and decode a vault file.
    pub async fn read(path: &Path) -> Result<Self> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("Vault file {}", path.display())))
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_bytes(&bytes)
    }

    /// Write the file atomically (temp file + rename in the same directory).
    pub async fn write(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        write_atomic(path, &bytes).await?;
        debug!(path = %path.display(), vault_id = %self.header.vault_id, "Vault file written");
        Ok(())
    }
}

fn check_recipe(kdf: &KdfParameters) -> Result<()> {
    kdf.validate_existing()
        .map_err(|e| Error::Corruption(format!("Vault KDF recipe rejected: {}", e)))?;
    if kdf.output_len != KEY_LENGTH {
        return Err(Error::Corruption(format!(
            "Vault KDF output must be {} bytes",
            KEY_LENGTH
        )));
    }
    Ok(())
}

fn seal_verifier(header: &VaultHeader, master: &SymmetricKey) -> Result<Vec<u8>> {
    let key = master.derive_subkey(VERIFIER_CONTEXT);
    let envelope = Envelope::seal(header.profile, &key, VERIFIER_PLAINTEXT, &header.verifier_aad())?;
    Ok(envelope.to_bytes())
}

fn wrap_sync_key(
    header: &VaultHeader,
    master: &SymmetricKey,
    sync_key: &SymmetricKey,
) -> Result<Vec<u8>> {
    let key = master.derive_subkey(SYNC_WRAP_CONTEXT);
    let envelope = Envelope::seal(header.profile, &key, sync_key.as_bytes(), &header.sync_key_aad())?;
    Ok(envelope.to_bytes())
}

fn seal_body(header: &VaultHeader, master: &SymmetricKey, store: &VaultStore) -> Result<Envelope> {
    let key = master.derive_subkey(BODY_CONTEXT);
    let plaintext = store.to_bytes()?;
    Envelope::seal(header.profile, &key, &plaintext, &header.body_aad()?)
}

fn seal_duress(
    header: &VaultHeader,
    kdf: &KdfParameters,
    duress_key: &SymmetricKey,
    decoy: &VaultStore,
) -> Result<Vec<u8>> {
    let key = duress_key.derive_subkey(BODY_CONTEXT);
    let plaintext = decoy.to_bytes()?;
    let envelope = Envelope::seal(header.profile, &key, &plaintext, &header.duress_aad(kdf)?)?;
    Ok(envelope.to_bytes())
}

/// Write `bytes` to `path` through a sibling temp file and a rename.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .ok_or_else(|| Error::Validation(format!("Invalid path {}", path.display())))?;
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    fs::write(&tmp_path, bytes).await?;
    if let Err(e) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VaultEntry;
    use keyward_crypto::kdf::ARGON2_MIN_MEMORY_KIB;
    use tempfile::TempDir;

    fn params() -> KdfParameters {
        KdfParameters::primary_with(ARGON2_MIN_MEMORY_KIB, 2, 1).unwrap()
    }

    fn sample() -> (VaultFile, SymmetricKey, VaultStore) {
        let key = SymmetricKey::generate();
        let mut store = VaultStore::new();
        store
            .add_entry(VaultEntry::login("Mail", "alice", "pw"))
            .unwrap();
        let file = VaultFile::create(
            VaultId::new("personal").unwrap(),
            Profile::Local,
            params(),
            &key,
            &store,
        )
        .unwrap();
        (file, key, store)
    }

    #[test]
    fn test_roundtrip_bytes() {
        let (file, key, store) = sample();
        let decoded = VaultFile::from_bytes(&file.to_bytes().unwrap()).unwrap();

        assert!(decoded.verify(&key));
        assert_eq!(decoded.open_body(&key).unwrap(), store);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let (file, _, _) = sample();
        let other = SymmetricKey::generate();
        assert!(!file.verify(&other));
        assert!(matches!(file.open_body(&other), Err(Error::Authentication(_))));
    }

    #[test]
    fn test_header_edit_breaks_body() {
        let (mut file, key, _) = sample();
        file.header.vault_id = VaultId::new("other").unwrap();
        assert!(file.open_body(&key).is_err());
    }

    #[test]
    fn test_duress_slot_independent_of_body() {
        let (mut file, key, store) = sample();
        let duress_key = SymmetricKey::generate();
        let mut decoy = VaultStore::new();
        decoy
            .add_entry(VaultEntry::login("Shop", "decoy", "pw"))
            .unwrap();

        file.set_duress(params(), &duress_key, &decoy).unwrap();
        assert_eq!(file.open_duress(&duress_key).unwrap(), decoy);
        assert_eq!(file.open_body(&key).unwrap(), store);

        let sync_key = file.open_sync_key(&key).unwrap();
        file.rekey(params(), &key, &store, &sync_key).unwrap();
        assert_eq!(file.open_duress(&duress_key).unwrap(), decoy);
        assert!(file.open_duress(&key).is_err());
    }

    #[test]
    fn test_rekey_carries_sync_key() {
        let (mut file, key, store) = sample();
        let sync_key = file.open_sync_key(&key).unwrap();

        let next = SymmetricKey::generate();
        file.rekey(params(), &next, &store, &sync_key).unwrap();

        assert!(file.open_sync_key(&key).is_err());
        let carried = file.open_sync_key(&next).unwrap();
        assert_eq!(carried.as_bytes(), sync_key.as_bytes());
        assert_ne!(sync_key.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_sync_key_differs_per_vault() {
        let (first, first_key, _) = sample();
        let (second, second_key, _) = sample();
        let a = first.open_sync_key(&first_key).unwrap();
        let b = second.open_sync_key(&second_key).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_legacy_recipe_rejected_for_create() {
        let key = SymmetricKey::generate();
        let legacy = KdfParameters::legacy(100_000).unwrap();
        let result = VaultFile::create(
            VaultId::new("v").unwrap(),
            Profile::Local,
            legacy,
            &key,
            &VaultStore::new(),
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_bad_magic() {
        assert!(matches!(
            VaultFile::from_bytes(b"NOPE\x00\x00\x00\x00"),
            Err(Error::Corruption(_))
        ));
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("personal.kwv");
        let (file, key, store) = sample();

        file.write(&path).await.unwrap();
        let read = VaultFile::read(&path).await.unwrap();

        assert_eq!(read.open_body(&key).unwrap(), store);
        assert!(!dir.path().join("personal.kwv.tmp").exists());
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let result = VaultFile::read(&dir.path().join("missing.kwv")).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
