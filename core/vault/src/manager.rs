//! Vault manager for creating and opening vault files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::container::{VaultFile, VAULT_EXTENSION};
use crate::lockout::LockoutStore;
use crate::session::{Session, SessionOptions};
use crate::store::VaultStore;
use keyward_common::{Clock, Error, Result, SensitiveBytes, VaultId};
use keyward_crypto::{derive_key_cancellable, KdfParameters, Profile};

/// Creates vault files and opens sessions over them.
pub struct VaultManager {
    vault_dir: PathBuf,
    lockout_dir: Option<PathBuf>,
    clock: Arc<dyn Clock>,
    options: SessionOptions,
}

impl VaultManager {
    /// Manage vaults stored as `<vault_dir>/<vault_id>.kwv`.
    ///
    /// Lockout counters are kept in `lockout_dir` when given, otherwise in
    /// memory only.
    pub fn new(
        vault_dir: impl Into<PathBuf>,
        lockout_dir: Option<PathBuf>,
        clock: Arc<dyn Clock>,
        options: SessionOptions,
    ) -> Self {
        Self {
            vault_dir: vault_dir.into(),
            lockout_dir,
            clock,
            options,
        }
    }

    /// File path for a vault id.
    pub fn vault_path(&self, vault_id: &VaultId) -> PathBuf {
        self.vault_dir
            .join(format!("{}.{}", vault_id.as_str(), VAULT_EXTENSION))
    }

    /// Whether a vault file exists.
    pub async fn vault_exists(&self, vault_id: &VaultId) -> bool {
        tokio::fs::metadata(self.vault_path(vault_id)).await.is_ok()
    }

    /// Create a new, empty vault.
    ///
    /// # Preconditions
    /// - No vault with this id exists
    /// - `kdf` uses a random salt and a non-legacy algorithm
    ///
    /// # Postconditions
    /// - The vault file is written and a locked session is returned
    ///
    /// # Errors
    /// - `Validation` if the vault exists or the recipe is rejected
    pub async fn create_vault(
        &self,
        vault_id: VaultId,
        passphrase: &SensitiveBytes,
        kdf: KdfParameters,
        profile: Profile,
    ) -> Result<Session> {
        if passphrase.is_empty() {
            return Err(Error::Validation("Passphrase cannot be empty".to_string()));
        }
        kdf.ensure_new_vault()?;

        let path = self.vault_path(&vault_id);
        if tokio::fs::metadata(&path).await.is_ok() {
            return Err(Error::Validation(format!(
                "Vault '{}' already exists",
                vault_id
            )));
        }

        let derived =
            derive_key_cancellable(passphrase.clone(), kdf.clone(), CancellationToken::new())
                .await?;
        let master = derived.to_symmetric_key()?;
        let file = VaultFile::create(vault_id.clone(), profile, kdf, &master, &VaultStore::new())?;
        file.write(&path).await?;
        info!(vault_id = %vault_id, "Vault created");

        self.session_for(path, file).await
    }

    /// Open a locked session over an existing vault.
    ///
    /// # Errors
    /// - `NotFound` if the file does not exist
    /// - `Corruption` if the header cannot be parsed
    pub async fn open_vault(&self, vault_id: &VaultId) -> Result<Session> {
        let path = self.vault_path(vault_id);
        let file = VaultFile::read(&path).await?;
        if file.vault_id() != vault_id {
            return Err(Error::Corruption(format!(
                "Vault file {} belongs to another vault",
                path.display()
            )));
        }
        self.session_for(path, file).await
    }

    /// Open a locked session over a vault file at an arbitrary path.
    pub async fn open_path(&self, path: &Path) -> Result<Session> {
        let file = VaultFile::read(path).await?;
        self.session_for(path.to_path_buf(), file).await
    }

    async fn session_for(&self, path: PathBuf, file: VaultFile) -> Result<Session> {
        let lockout = match &self.lockout_dir {
            Some(dir) => {
                let lockout_path = dir.join(format!("{}.lockout.json", file.vault_id()));
                LockoutStore::open(lockout_path, self.clock.now()).await?
            }
            None => LockoutStore::in_memory(),
        };
        Ok(Session::from_file(
            path,
            file,
            Arc::clone(&self.clock),
            Arc::new(lockout),
            self.options.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;
    use keyward_common::SystemClock;
    use keyward_crypto::kdf::ARGON2_MIN_MEMORY_KIB;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> VaultManager {
        VaultManager::new(
            dir.path().join("vaults"),
            Some(dir.path().join("lockout")),
            Arc::new(SystemClock),
            SessionOptions::default(),
        )
    }

    fn params() -> KdfParameters {
        KdfParameters::primary_with(ARGON2_MIN_MEMORY_KIB, 2, 1).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_open_vault() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let vault_id = VaultId::new("personal").unwrap();
        let passphrase = SensitiveBytes::from_passphrase("secure-password");

        let session = manager
            .create_vault(vault_id.clone(), &passphrase, params(), Profile::Local)
            .await
            .unwrap();
        assert_eq!(session.status(), SessionStatus::Locked);
        assert!(manager.vault_exists(&vault_id).await);

        let reopened = manager.open_vault(&vault_id).await.unwrap();
        reopened.unlock(&passphrase).await.unwrap();
        assert_eq!(reopened.with_store(|s| s.len()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let vault_id = VaultId::new("personal").unwrap();
        let passphrase = SensitiveBytes::from_passphrase("pw");

        manager
            .create_vault(vault_id.clone(), &passphrase, params(), Profile::Local)
            .await
            .unwrap();
        let again = manager
            .create_vault(vault_id, &passphrase, params(), Profile::Local)
            .await;
        assert!(matches!(again, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_corrupt_lockout_window_follows_clock() {
        let dir = TempDir::new().unwrap();
        let start = chrono::Utc::now() - chrono::Duration::days(365);
        let clock = keyward_common::ManualClock::new(start);
        let manager = VaultManager::new(
            dir.path().join("vaults"),
            Some(dir.path().join("lockout")),
            Arc::new(clock.clone()),
            SessionOptions::default(),
        );
        let vault_id = VaultId::new("personal").unwrap();
        let passphrase = SensitiveBytes::from_passphrase("secure-password");
        manager
            .create_vault(vault_id.clone(), &passphrase, params(), Profile::Local)
            .await
            .unwrap();

        std::fs::create_dir_all(dir.path().join("lockout")).unwrap();
        std::fs::write(dir.path().join("lockout").join("personal.lockout.json"), b"{").unwrap();

        let session = manager.open_vault(&vault_id).await.unwrap();
        assert!(matches!(
            session.unlock(&passphrase).await,
            Err(Error::RateLimited { .. })
        ));

        clock.advance(chrono::Duration::hours(4) + chrono::Duration::seconds(1));
        session.unlock(&passphrase).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_missing_vault() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let result = manager.open_vault(&VaultId::new("nope").unwrap()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
