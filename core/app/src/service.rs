//! Command/query facade over the vault engine.
//!
//! Presentation code talks to [`VaultService`] only. Every call names the
//! vault it acts on, re-checks the session through the session's own
//! accessors, and returns owned values, so nothing decrypted outlives the
//! call except what the caller explicitly asked for.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use keyward_common::{Error, Result, SensitiveBytes, VaultId};
use keyward_crypto::Profile;
use keyward_interop::{
    detect_format, export_csv, export_json, export_portable, CsvFlavor, ExportMode, ImportFormat,
    ImportReport,
};
use keyward_storage::SyncVersion;
use keyward_sync::{RetryScheduler, ScheduleOutcome, SyncEngine, SyncOutcome, SyncState};
use keyward_vault::container::VAULT_EXTENSION;
use keyward_vault::{
    ClipboardBackend, DeviceEvent, EntryKind, SecureClipboard, Session, SessionStatus, VaultEntry,
    VaultGroup, VaultManager, VaultStore,
};

use crate::context::AppContext;

/// Listing row for a vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultSummary {
    pub id: VaultId,
    /// `None` while the vault is not open in this service.
    pub status: Option<SessionStatus>,
}

/// Entry listing row without any secret field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySummary {
    pub id: Uuid,
    pub kind: EntryKind,
    pub title: String,
    pub username: String,
    pub urls: Vec<String>,
    pub tags: Vec<String>,
    pub group_id: Option<Uuid>,
    pub favorite: bool,
    pub has_otp: bool,
    pub modified_at: chrono::DateTime<chrono::Utc>,
}

impl From<&VaultEntry> for EntrySummary {
    fn from(entry: &VaultEntry) -> Self {
        Self {
            id: entry.id,
            kind: entry.kind,
            title: entry.title.clone(),
            username: entry.username.clone(),
            urls: entry.urls.clone(),
            tags: entry.tags.clone(),
            group_id: entry.group_id,
            favorite: entry.favorite,
            has_otp: entry.otp_seed.is_some(),
            modified_at: entry.modified_at,
        }
    }
}

/// Field copied by [`VaultService::copy_secret`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretField {
    Username,
    Password,
    OtpSeed,
    Custom(String),
}

/// Output format for [`VaultService::export`].
pub enum ExportFormat {
    Csv(CsvFlavor),
    Json(ExportMode),
    /// Sealed under its own passphrase.
    Portable(SensitiveBytes),
}

struct SyncHandle {
    engine: Arc<SyncEngine>,
    scheduler: RetryScheduler,
}

struct OpenVault {
    session: Arc<Session>,
    watchdog: JoinHandle<()>,
    sync: Option<Arc<SyncHandle>>,
}

/// The application's single entry point.
pub struct VaultService {
    context: Arc<AppContext>,
    manager: VaultManager,
    clipboard: SecureClipboard<dyn ClipboardBackend>,
    vaults: RwLock<HashMap<VaultId, OpenVault>>,
    /// Cancels background work that outlives a session, such as flushing a
    /// staged upload while locked.
    shutdown: CancellationToken,
}

impl VaultService {
    /// Build the service and create its directories.
    ///
    /// # Errors
    /// - `Validation` if the configuration is invalid
    /// - `Io` if the data directories cannot be created
    pub async fn new(context: AppContext) -> Result<Self> {
        let config = &context.config;
        config.validate()?;
        tokio::fs::create_dir_all(config.vault_dir()).await?;
        tokio::fs::create_dir_all(config.state_dir()).await?;

        let manager = VaultManager::new(
            config.vault_dir(),
            Some(config.state_dir()),
            Arc::clone(&context.clock),
            config.session_options()?,
        );
        let clipboard = SecureClipboard::new(Arc::clone(&context.clipboard));
        info!(data_dir = %config.data_dir.display(), "Vault service started");

        Ok(Self {
            context: Arc::new(context),
            manager,
            clipboard,
            vaults: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Create a vault and open it, still locked.
    ///
    /// # Errors
    /// - `Validation` for an invalid id, an existing vault or an empty
    ///   passphrase
    pub async fn create_vault(&self, id: &str, passphrase: &SensitiveBytes) -> Result<VaultId> {
        let vault_id = VaultId::new(id)?;
        let kdf = self.context.config.kdf_parameters()?;
        let session = self
            .manager
            .create_vault(vault_id.clone(), passphrase, kdf, Profile::Local)
            .await?;
        self.register(session).await?;
        Ok(vault_id)
    }

    /// Open an existing vault, locked. Opening an open vault is a no-op.
    ///
    /// # Errors
    /// - `NotFound` if no such vault file exists
    pub async fn open_vault(&self, id: &str) -> Result<VaultId> {
        let vault_id = VaultId::new(id)?;
        if self.vaults.read().await.contains_key(&vault_id) {
            return Ok(vault_id);
        }
        if !self.manager.vault_exists(&vault_id).await {
            return Err(Error::NotFound(format!("Vault '{}'", vault_id)));
        }
        let session = self.manager.open_vault(&vault_id).await?;
        self.register(session).await?;
        Ok(vault_id)
    }

    async fn register(&self, session: Session) -> Result<()> {
        let vault_id = session.vault_id().clone();
        let session = Arc::new(session);
        let sync = match self.context.provider_for(&vault_id)? {
            Some(provider) => {
                let config = &self.context.config.sync;
                let engine = Arc::new(
                    SyncEngine::new(
                        vault_id.clone(),
                        provider,
                        self.context.config.state_dir(),
                        Arc::clone(&self.context.clock),
                        config.engine_config(),
                    )
                    .await?,
                );
                let scheduler = RetryScheduler::new(
                    Arc::clone(&engine),
                    config.pending_retry_attempts,
                    config.pending_retry_interval(),
                );
                Some(Arc::new(SyncHandle { engine, scheduler }))
            }
            None => None,
        };

        let watchdog = session.spawn_watchdog();
        let previous = self.vaults.write().await.insert(
            vault_id.clone(),
            OpenVault {
                session,
                watchdog,
                sync,
            },
        );
        if let Some(previous) = previous {
            close(previous).await;
        }
        debug!(vault_id = %vault_id, "Vault registered");
        Ok(())
    }

    /// Vault files on disk, with the status of those open here.
    pub async fn list_vaults(&self) -> Result<Vec<VaultSummary>> {
        let mut ids = Vec::new();
        let mut dir = tokio::fs::read_dir(self.context.config.vault_dir()).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(VAULT_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(id) = VaultId::new(stem) {
                    ids.push(id);
                }
            }
        }
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));

        let vaults = self.vaults.read().await;
        Ok(ids
            .into_iter()
            .map(|id| {
                let status = vaults.get(&id).map(|v| v.session.status());
                VaultSummary { id, status }
            })
            .collect())
    }

    /// Lock and forget an open vault.
    pub async fn close_vault(&self, vault_id: &VaultId) -> Result<()> {
        let open = self
            .vaults
            .write()
            .await
            .remove(vault_id)
            .ok_or_else(|| not_open(vault_id))?;
        close(open).await;
        info!(vault_id = %vault_id, "Vault closed");
        Ok(())
    }

    /// Lock every vault and stop background work.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.clipboard.cancel_pending();
        let drained: Vec<OpenVault> = self.vaults.write().await.drain().map(|(_, v)| v).collect();
        for open in drained {
            close(open).await;
        }
    }

    async fn session(&self, vault_id: &VaultId) -> Result<Arc<Session>> {
        self.vaults
            .read()
            .await
            .get(vault_id)
            .map(|v| Arc::clone(&v.session))
            .ok_or_else(|| not_open(vault_id))
    }

    /// Session of an unlocked vault, with the inactivity deadline pushed out.
    async fn active(&self, vault_id: &VaultId) -> Result<Arc<Session>> {
        let session = self.session(vault_id).await?;
        session.record_activity().await?;
        Ok(session)
    }

    async fn sync_handle(&self, vault_id: &VaultId) -> Result<Arc<SyncHandle>> {
        self.vaults
            .read()
            .await
            .get(vault_id)
            .ok_or_else(|| not_open(vault_id))?
            .sync
            .clone()
            .ok_or_else(|| Error::Validation(format!("Sync is not configured for '{}'", vault_id)))
    }

    // ---- session lifecycle ----

    /// Unlock with the vault passphrase or its duress passphrase.
    ///
    /// An unlocked vault still checks the passphrase and switches to the
    /// slot it opens.
    ///
    /// # Errors
    /// - `RateLimited` inside a lockout window
    /// - `Authentication` for a wrong passphrase
    pub async fn unlock(&self, vault_id: &VaultId, passphrase: &SensitiveBytes) -> Result<()> {
        self.session(vault_id).await?.unlock(passphrase).await
    }

    /// Switch an unlocked vault to its decoy contents.
    pub async fn present_duress(&self, vault_id: &VaultId, passphrase: &SensitiveBytes) -> Result<()> {
        self.session(vault_id).await?.present_duress(passphrase).await
    }

    /// Lock one vault and cancel its pending sync retries.
    pub async fn lock(&self, vault_id: &VaultId) -> Result<()> {
        let session = self.session(vault_id).await?;
        if let Ok(handle) = self.sync_handle(vault_id).await {
            handle.scheduler.cancel();
        }
        session.lock().await;
        Ok(())
    }

    /// Lock every open vault.
    pub async fn lock_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .vaults
            .read()
            .await
            .values()
            .map(|v| Arc::clone(&v.session))
            .collect();
        for session in sessions {
            session.lock().await;
        }
    }

    /// Forward a platform signal (screen lock, suspend, user switch) to
    /// every open vault.
    pub async fn handle_device_event(&self, event: DeviceEvent) {
        let sessions: Vec<Arc<Session>> = self
            .vaults
            .read()
            .await
            .values()
            .map(|v| Arc::clone(&v.session))
            .collect();
        for session in sessions {
            session.handle_device_event(event).await;
        }
    }

    /// Session status, locking first if the deadline has passed.
    pub async fn status(&self, vault_id: &VaultId) -> Result<SessionStatus> {
        let session = self.session(vault_id).await?;
        session.enforce_expiry().await;
        Ok(session.status())
    }

    /// Push the inactivity deadline out by the configured ttl.
    pub async fn extend_session(&self, vault_id: &VaultId) -> Result<()> {
        self.session(vault_id).await?.extend().await
    }

    /// Change the passphrase of the slot that was unlocked.
    ///
    /// Other devices keep reading the remote copy; the sync key is carried
    /// over.
    ///
    /// # Errors
    /// - `Authentication` if `old` is wrong
    pub async fn change_passphrase(
        &self,
        vault_id: &VaultId,
        old: &SensitiveBytes,
        new: &SensitiveBytes,
    ) -> Result<()> {
        self.active(vault_id).await?.change_passphrase(old, new).await
    }

    /// Install a duress slot that opens `decoy`.
    pub async fn configure_duress(
        &self,
        vault_id: &VaultId,
        duress_passphrase: &SensitiveBytes,
        decoy: VaultStore,
    ) -> Result<()> {
        self.active(vault_id)
            .await?
            .configure_duress(duress_passphrase, decoy)
            .await
    }

    /// Drop the duress slot. Not allowed from the decoy session.
    pub async fn remove_duress(&self, vault_id: &VaultId) -> Result<()> {
        self.active(vault_id).await?.remove_duress().await
    }

    // ---- entries and folders ----

    /// Summaries of every entry, without secrets.
    pub async fn list_entries(&self, vault_id: &VaultId) -> Result<Vec<EntrySummary>> {
        self.active(vault_id)
            .await?
            .with_store(|store| store.entries().map(EntrySummary::from).collect())
            .await
    }

    /// Entries matching `query` in title, username, URL or tags.
    pub async fn search(&self, vault_id: &VaultId, query: &str) -> Result<Vec<EntrySummary>> {
        self.active(vault_id)
            .await?
            .with_store(|store| {
                store
                    .search(query)
                    .into_iter()
                    .map(EntrySummary::from)
                    .collect()
            })
            .await
    }

    /// Entries filed in `group_id`, or unfiled entries for `None`.
    pub async fn entries_in_group(
        &self,
        vault_id: &VaultId,
        group_id: Option<Uuid>,
    ) -> Result<Vec<EntrySummary>> {
        self.active(vault_id)
            .await?
            .with_store(|store| {
                store
                    .entries_in_group(group_id)
                    .into_iter()
                    .map(EntrySummary::from)
                    .collect()
            })
            .await
    }

    /// Full entry including secrets.
    pub async fn get_entry(&self, vault_id: &VaultId, entry_id: Uuid) -> Result<VaultEntry> {
        self.active(vault_id)
            .await?
            .with_store(|store| store.get(&entry_id).cloned())
            .await?
            .ok_or_else(|| Error::NotFound(format!("Entry {}", entry_id)))
    }

    /// Add an entry and save.
    pub async fn add_entry(&self, vault_id: &VaultId, entry: VaultEntry) -> Result<Uuid> {
        let session = self.active(vault_id).await?;
        let id = session.with_store_mut(|store| store.add_entry(entry)).await?;
        session.save().await?;
        debug!(vault_id = %vault_id, entry_id = %id, "Entry added");
        Ok(id)
    }

    /// Edit an entry in place and save.
    pub async fn update_entry<F>(&self, vault_id: &VaultId, entry_id: Uuid, edit: F) -> Result<()>
    where
        F: FnOnce(&mut VaultEntry),
    {
        let session = self.active(vault_id).await?;
        session
            .with_store_mut(|store| store.update_entry(&entry_id, edit))
            .await?;
        session.save().await?;
        debug!(vault_id = %vault_id, entry_id = %entry_id, "Entry updated");
        Ok(())
    }

    /// Delete an entry and save. The deletion reaches other devices on sync.
    pub async fn remove_entry(&self, vault_id: &VaultId, entry_id: Uuid) -> Result<()> {
        let session = self.active(vault_id).await?;
        session
            .with_store_mut(|store| store.remove_entry(&entry_id).map(|_| ()))
            .await?;
        session.save().await?;
        debug!(vault_id = %vault_id, entry_id = %entry_id, "Entry removed");
        Ok(())
    }

    /// All folders.
    pub async fn list_groups(&self, vault_id: &VaultId) -> Result<Vec<VaultGroup>> {
        self.active(vault_id)
            .await?
            .with_store(|store| store.groups().cloned().collect())
            .await
    }

    /// Add a folder and save.
    pub async fn add_group(&self, vault_id: &VaultId, group: VaultGroup) -> Result<Uuid> {
        let session = self.active(vault_id).await?;
        let id = session.with_store_mut(|store| store.add_group(group)).await?;
        session.save().await?;
        Ok(id)
    }

    /// Remove a folder; its entries and subfolders move to its parent. The
    /// deletion reaches other devices on sync.
    pub async fn remove_group(&self, vault_id: &VaultId, group_id: Uuid) -> Result<()> {
        let session = self.active(vault_id).await?;
        session
            .with_store_mut(|store| store.remove_group(&group_id).map(|_| ()))
            .await?;
        session.save().await?;
        Ok(())
    }

    /// Put a secret on the clipboard, cleared after the configured delay.
    ///
    /// The returned handle resolves once the clear fired or was superseded.
    ///
    /// # Errors
    /// - `NotFound` if the entry or field does not exist or is empty
    pub async fn copy_secret(
        &self,
        vault_id: &VaultId,
        entry_id: Uuid,
        field: SecretField,
    ) -> Result<JoinHandle<()>> {
        let value = self
            .active(vault_id)
            .await?
            .with_store(|store| {
                let entry = store.get(&entry_id)?;
                let value = match &field {
                    SecretField::Username => Some(entry.username.as_str()),
                    SecretField::Password => Some(entry.password.as_str()),
                    SecretField::OtpSeed => entry.otp_seed.as_deref(),
                    SecretField::Custom(name) => entry.custom_fields.get(name).map(String::as_str),
                };
                value
                    .filter(|v| !v.is_empty())
                    .map(|v| Zeroizing::new(v.to_string()))
            })
            .await?
            .ok_or_else(|| Error::NotFound(format!("No {:?} on entry {}", field, entry_id)))?;

        debug!(vault_id = %vault_id, entry_id = %entry_id, "Secret copied to clipboard");
        self.clipboard
            .copy_secret(&value, self.context.config.clipboard_ttl())
    }

    // ---- sync ----

    /// Synchronize with the configured remote.
    ///
    /// A sync that ends pending schedules bounded follow-up attempts.
    ///
    /// # Errors
    /// - `Validation` if sync is not configured
    /// - Everything [`SyncEngine::sync`] returns
    pub async fn sync(&self, vault_id: &VaultId) -> Result<SyncOutcome> {
        let handle = self.sync_handle(vault_id).await?;
        let session = self.active(vault_id).await?;
        let outcome = handle.engine.sync(&session).await?;
        if let SyncOutcome::Pending { reason } = &outcome {
            warn!(vault_id = %vault_id, reason = %reason, "Sync pending; scheduling retries");
            drop(handle.scheduler.schedule(session));
        }
        Ok(outcome)
    }

    /// Start bounded follow-up attempts of a pending sync.
    pub async fn schedule_sync_retries(
        &self,
        vault_id: &VaultId,
    ) -> Result<JoinHandle<ScheduleOutcome>> {
        let handle = self.sync_handle(vault_id).await?;
        let session = self.active(vault_id).await?;
        Ok(handle.scheduler.schedule(session))
    }

    /// Upload a staged blob; works while locked.
    pub async fn flush_pending(&self, vault_id: &VaultId) -> Result<Option<SyncVersion>> {
        let handle = self.sync_handle(vault_id).await?;
        handle.engine.flush_pending(&self.shutdown.child_token()).await
    }

    /// Persisted sync state of the vault.
    pub async fn sync_state(&self, vault_id: &VaultId) -> Result<SyncState> {
        Ok(self.sync_handle(vault_id).await?.engine.state())
    }

    // ---- import and export ----

    /// Parse `input` off the async runtime and merge it into the vault.
    ///
    /// `format` is detected from the content when not given.
    ///
    /// # Errors
    /// - Whole-file failures from the importer; per-record problems are in
    ///   the returned report
    pub async fn import(
        &self,
        vault_id: &VaultId,
        input: Vec<u8>,
        format: Option<ImportFormat>,
        passphrase: Option<SensitiveBytes>,
    ) -> Result<ImportReport> {
        let session = self.active(vault_id).await?;
        let format = format.unwrap_or_else(|| detect_format(&input));
        let limits = self.context.config.import.clone();
        debug!(vault_id = %vault_id, %format, bytes = input.len(), "Import started");

        let outcome = tokio::task::spawn_blocking(move || {
            keyward_interop::import(&input, format, passphrase.as_ref(), &limits)
        })
        .await
        .map_err(|e| Error::Crypto(format!("Import task failed: {}", e)))??;

        let mut report = outcome.report;
        let (entries, groups) = (outcome.entries, outcome.groups);
        let added = session
            .with_store_mut(|store| Ok(store.merge_imported(entries, groups)))
            .await?;
        if added > 0 {
            session.save().await?;
        }
        report.imported = added;
        info!(
            vault_id = %vault_id,
            %format,
            imported = report.imported,
            skipped = report.skipped,
            errors = report.errors.len(),
            "Import merged"
        );
        Ok(report)
    }

    /// Export the vault's current contents.
    pub async fn export(&self, vault_id: &VaultId, format: ExportFormat) -> Result<Zeroizing<Vec<u8>>> {
        let snapshot = self
            .active(vault_id)
            .await?
            .with_store(VaultStore::clone)
            .await?;
        let now = self.context.clock.now();

        let bytes = match format {
            ExportFormat::Csv(flavor) => Zeroizing::new(export_csv(&snapshot, flavor)?),
            ExportFormat::Json(mode) => export_json(&snapshot, mode, now)?,
            ExportFormat::Portable(passphrase) => {
                let kdf = self.context.config.kdf_parameters()?;
                let sealed = tokio::task::spawn_blocking(move || {
                    export_portable(&snapshot, &passphrase, &kdf, now)
                })
                .await
                .map_err(|e| Error::Crypto(format!("Export task failed: {}", e)))??;
                Zeroizing::new(sealed)
            }
        };
        info!(vault_id = %vault_id, bytes = bytes.len(), "Vault exported");
        Ok(bytes)
    }
}

fn not_open(vault_id: &VaultId) -> Error {
    Error::NotFound(format!("Vault '{}' is not open", vault_id))
}

async fn close(open: OpenVault) {
    if let Some(sync) = &open.sync {
        sync.scheduler.cancel();
    }
    open.session.lock().await;
    open.session.shutdown();
    open.watchdog.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use keyward_storage::MemoryProvider;
    use keyward_vault::MemoryClipboard;
    use tempfile::TempDir;

    fn pass(value: &str) -> SensitiveBytes {
        SensitiveBytes::from_passphrase(value)
    }

    fn fast_config(temp: &TempDir) -> AppConfig {
        let mut config = AppConfig::with_data_dir(temp.path());
        config.kdf_memory_kib = 19_456;
        config.kdf_time_cost = 2;
        config.kdf_parallelism = 1;
        config
    }

    async fn service(temp: &TempDir) -> (VaultService, Arc<MemoryClipboard>) {
        let clipboard = Arc::new(MemoryClipboard::new());
        let context = AppContext::from_config(fast_config(temp))
            .unwrap()
            .with_clipboard(clipboard.clone());
        (VaultService::new(context).await.unwrap(), clipboard)
    }

    async fn unlocked(service: &VaultService, id: &str) -> VaultId {
        let vault_id = service.create_vault(id, &pass("correct horse")).await.unwrap();
        service.unlock(&vault_id, &pass("correct horse")).await.unwrap();
        vault_id
    }

    #[tokio::test]
    async fn test_create_unlock_and_edit() {
        let temp = TempDir::new().unwrap();
        let (service, _) = service(&temp).await;
        let vault_id = service.create_vault("personal", &pass("correct horse")).await.unwrap();
        assert_eq!(service.status(&vault_id).await.unwrap(), SessionStatus::Locked);
        assert!(matches!(service.list_entries(&vault_id).await, Err(Error::Locked)));

        service.unlock(&vault_id, &pass("correct horse")).await.unwrap();
        let group = service.add_group(&vault_id, VaultGroup::new("Mail")).await.unwrap();
        let entry_id = service
            .add_entry(
                &vault_id,
                VaultEntry::login("Email", "alice", "s3cret").with_url("https://mail.example.com"),
            )
            .await
            .unwrap();
        service
            .update_entry(&vault_id, entry_id, |e| e.group_id = Some(group))
            .await
            .unwrap();

        let found = service.search(&vault_id, "MAIL.example").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].username, "alice");
        assert_eq!(service.entries_in_group(&vault_id, Some(group)).await.unwrap().len(), 1);
        assert_eq!(service.get_entry(&vault_id, entry_id).await.unwrap().password, "s3cret");

        service.remove_group(&vault_id, group).await.unwrap();
        assert_eq!(service.entries_in_group(&vault_id, None).await.unwrap().len(), 1);
        service.remove_entry(&vault_id, entry_id).await.unwrap();
        assert!(service.list_entries(&vault_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let (service, _) = service(&temp).await;
        let vault_id = unlocked(&service, "personal").await;
        service
            .add_entry(&vault_id, VaultEntry::login("Bank", "acct", "pin"))
            .await
            .unwrap();
        service.close_vault(&vault_id).await.unwrap();
        assert!(matches!(service.status(&vault_id).await, Err(Error::NotFound(_))));

        service.open_vault("personal").await.unwrap();
        let err = service.unlock(&vault_id, &pass("wrong")).await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
        service.unlock(&vault_id, &pass("correct horse")).await.unwrap();
        let titles: Vec<String> = service
            .list_entries(&vault_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.title)
            .collect();
        assert_eq!(titles, vec!["Bank".to_string()]);

        let vaults = service.list_vaults().await.unwrap();
        assert_eq!(vaults.len(), 1);
        assert_eq!(vaults[0].status, Some(SessionStatus::Unlocked));
    }

    #[tokio::test]
    async fn test_open_missing_vault() {
        let temp = TempDir::new().unwrap();
        let (service, _) = service(&temp).await;
        assert!(matches!(service.open_vault("nowhere").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_device_event_locks_everything() {
        let temp = TempDir::new().unwrap();
        let (service, _) = service(&temp).await;
        let vault_id = unlocked(&service, "personal").await;
        service.handle_device_event(DeviceEvent::ScreenLocked).await;
        assert_eq!(service.status(&vault_id).await.unwrap(), SessionStatus::Locked);
        assert!(matches!(
            service.get_entry(&vault_id, Uuid::new_v4()).await,
            Err(Error::Locked)
        ));
    }

    #[tokio::test]
    async fn test_copy_secret() {
        let temp = TempDir::new().unwrap();
        let (service, clipboard) = service(&temp).await;
        let vault_id = unlocked(&service, "personal").await;
        let entry_id = service
            .add_entry(&vault_id, VaultEntry::login("Email", "alice", "s3cret"))
            .await
            .unwrap();

        let _clear = service
            .copy_secret(&vault_id, entry_id, SecretField::Password)
            .await
            .unwrap();
        assert_eq!(clipboard.read_text().unwrap().as_deref(), Some("s3cret"));

        let err = service
            .copy_secret(&vault_id, entry_id, SecretField::OtpSeed)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_csv_export_imports_into_another_vault() {
        let temp = TempDir::new().unwrap();
        let (service, _) = service(&temp).await;
        let source = unlocked(&service, "personal").await;
        service
            .add_entry(&source, VaultEntry::login("Email", "alice", "s3cret"))
            .await
            .unwrap();
        service
            .add_entry(&source, VaultEntry::login("Forum", "al", "hunter2"))
            .await
            .unwrap();

        let csv = service
            .export(&source, ExportFormat::Csv(CsvFlavor::Plain))
            .await
            .unwrap();
        let target = unlocked(&service, "work").await;
        let report = service.import(&target, csv.to_vec(), None, None).await.unwrap();
        assert_eq!(report.format, ImportFormat::Csv);
        assert_eq!(report.imported, 2);
        assert!(report.errors.is_empty());
        assert_eq!(service.search(&target, "forum").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_portable_export_needs_its_passphrase() {
        let temp = TempDir::new().unwrap();
        let (service, _) = service(&temp).await;
        let vault_id = unlocked(&service, "personal").await;
        service
            .add_entry(&vault_id, VaultEntry::login("Email", "alice", "s3cret"))
            .await
            .unwrap();
        let sealed = service
            .export(&vault_id, ExportFormat::Portable(pass("export pass")))
            .await
            .unwrap();

        let target = unlocked(&service, "work").await;
        let missing = service.import(&target, sealed.to_vec(), None, None).await;
        assert!(matches!(missing, Err(Error::Validation(_))));
        let report = service
            .import(&target, sealed.to_vec(), None, Some(pass("export pass")))
            .await
            .unwrap();
        assert_eq!(report.format, ImportFormat::Portable);
        assert_eq!(report.imported, 1);
    }

    #[tokio::test]
    async fn test_sync_with_injected_provider() {
        let temp = TempDir::new().unwrap();
        let provider = MemoryProvider::new();
        let context = AppContext::from_config(fast_config(&temp))
            .unwrap()
            .with_provider(Arc::new(provider.clone()));
        let service = VaultService::new(context).await.unwrap();
        let vault_id = unlocked(&service, "personal").await;
        service
            .add_entry(&vault_id, VaultEntry::login("Email", "alice", "s3cret"))
            .await
            .unwrap();

        let outcome = service.sync(&vault_id).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Uploaded { .. }));
        assert_eq!(provider.upload_count(), 1);
        let blob = provider.stored_blob().unwrap();
        assert!(!blob.windows(6).any(|w| w == b"s3cret"));
        assert!(service.flush_pending(&vault_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sync_disabled() {
        let temp = TempDir::new().unwrap();
        let (service, _) = service(&temp).await;
        let vault_id = unlocked(&service, "personal").await;
        assert!(matches!(service.sync(&vault_id).await, Err(Error::Validation(_))));
        assert!(service.sync_state(&vault_id).await.is_err());
    }
}
