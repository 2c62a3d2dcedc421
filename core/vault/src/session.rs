//! Vault session management.
//!
//! A session owns the derived key and the decrypted store for one unlock
//! lifetime. State, key, store and expiry deadline live behind a single
//! async mutex so they can never be observed out of step.
//!
//! Lifecycle:
//!
//! ```text
//! Locked -> Unlocking -> Unlocked | DuressUnlocked -> Locked
//! ```
//!
//! The public [`SessionStatus`] reports `Unlocked` for both unlocked states.
//! Keys are zeroized when the session locks, expires or is dropped.

use async_trait::async_trait;
use chrono::{DateTime, Duration};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::container::VaultFile;
use crate::lockout::LockoutStore;
use crate::store::VaultStore;
use keyward_common::{Clock, Error, Result, SensitiveBytes, VaultId};
use keyward_crypto::{
    constant_time_eq, derive_key_cancellable, DerivedKey, KdfAlgorithm, KdfParameters, SaltOrigin,
    SymmetricKey,
};

/// Internal lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Locked,
    Unlocking,
    Unlocked,
    DuressUnlocked,
}

/// Externally visible session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Locked,
    Unlocking,
    Unlocked,
}

impl From<SessionState> for SessionStatus {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Locked => SessionStatus::Locked,
            SessionState::Unlocking => SessionStatus::Unlocking,
            SessionState::Unlocked | SessionState::DuressUnlocked => SessionStatus::Unlocked,
        }
    }
}

/// Platform signals that force the session to lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    ScreenLocked,
    Suspended,
    UserSwitched,
}

/// Asynchronous confirmation step (biometric prompt, OS dialog, ...).
#[async_trait]
pub trait AuthGate: Send + Sync {
    /// Resolve once the user confirmed, or fail.
    async fn authorize(&self) -> Result<()>;
}

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Inactivity window before the session locks itself.
    pub ttl: Duration,
    /// Recipe costs used when a legacy-algorithm vault is migrated.
    pub migration_kdf: KdfParameters,
    /// How often the watchdog checks the deadline.
    pub watchdog_interval: std::time::Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::seconds(300),
            migration_kdf: KdfParameters::primary(),
            watchdog_interval: std::time::Duration::from_secs(1),
        }
    }
}

/// Material that exists only while unlocked.
struct Active {
    key: SymmetricKey,
    /// Absent for the decoy store, which has no remote copy.
    sync_key: Option<SymmetricKey>,
    store: VaultStore,
    deadline: DateTime<chrono::Utc>,
    duress: bool,
    migration: Option<(KdfParameters, SymmetricKey)>,
    dirty: bool,
}

struct Inner {
    state: SessionState,
    file: VaultFile,
    active: Option<Active>,
}

/// One vault's unlock lifetime.
pub struct Session {
    vault_id: VaultId,
    path: PathBuf,
    inner: Mutex<Inner>,
    lifecycle: std::sync::Mutex<CancellationToken>,
    shutdown: CancellationToken,
    clock: Arc<dyn Clock>,
    lockout: Arc<LockoutStore>,
    options: SessionOptions,
    status_tx: watch::Sender<SessionStatus>,
}

impl Session {
    /// Read the vault file at `path` and return a locked session.
    pub async fn open(
        path: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        lockout: Arc<LockoutStore>,
        options: SessionOptions,
    ) -> Result<Self> {
        let path = path.into();
        let file = VaultFile::read(&path).await?;
        Ok(Self::from_file(path, file, clock, lockout, options))
    }

    /// Build a locked session around an already parsed file.
    pub fn from_file(
        path: PathBuf,
        file: VaultFile,
        clock: Arc<dyn Clock>,
        lockout: Arc<LockoutStore>,
        options: SessionOptions,
    ) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::Locked);
        let lifecycle = CancellationToken::new();
        lifecycle.cancel();

        Self {
            vault_id: file.vault_id().clone(),
            path,
            inner: Mutex::new(Inner {
                state: SessionState::Locked,
                file,
                active: None,
            }),
            lifecycle: std::sync::Mutex::new(lifecycle),
            shutdown: CancellationToken::new(),
            clock,
            lockout,
            options,
            status_tx,
        }
    }

    /// Vault identifier.
    pub fn vault_id(&self) -> &VaultId {
        &self.vault_id
    }

    /// Path of the vault file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current public status.
    pub fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    /// Subscribe to status changes.
    pub fn status_watch(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    /// Token cancelled when this unlock lifetime ends.
    ///
    /// Background work (sync, clipboard clears) should observe it. While
    /// locked the returned token is already cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Unlock with a passphrase.
    ///
    /// # Preconditions
    /// - `passphrase` is not empty
    ///
    /// # Postconditions
    /// - On success the status is `Unlocked` and the deadline is now + ttl
    /// - While already unlocked the passphrase is still verified: the slot it
    ///   opens is served, and an unsaved store of that same slot is kept
    ///
    /// # Errors
    /// - `RateLimited` inside a lockout window (nothing is derived)
    /// - `Authentication` for a wrong passphrase (counted towards lockout
    ///   only while locked)
    /// - `Cancelled` if the session was locked while deriving
    ///
    /// # Security
    /// - When a duress slot exists both slots are always derived
    pub async fn unlock(&self, passphrase: &SensitiveBytes) -> Result<()> {
        if passphrase.is_empty() {
            return Err(Error::Validation("Passphrase cannot be empty".to_string()));
        }

        let mut inner = self.inner.lock().await;
        let unlocked = matches!(
            inner.state,
            SessionState::Unlocked | SessionState::DuressUnlocked
        );
        if unlocked && !self.expire_if_due(&mut inner) {
            return self.unlock_again(&mut inner, passphrase).await;
        }

        self.lockout.check(self.clock.now())?;

        let token = self.renew_lifecycle();
        self.set_state(&mut inner, SessionState::Unlocking);

        let outcome = self.attempt_unlock(&inner.file, passphrase, &token).await;
        match outcome {
            Ok(active) => {
                if let Err(e) = self.lockout.record_success().await {
                    warn!(error = %e, "Failed to persist lockout reset");
                }
                let state = if active.duress {
                    SessionState::DuressUnlocked
                } else {
                    SessionState::Unlocked
                };
                inner.active = Some(active);
                self.set_state(&mut inner, state);
                info!(vault_id = %self.vault_id, "Vault unlocked");
                Ok(())
            }
            Err(e) => {
                token.cancel();
                self.set_state(&mut inner, SessionState::Locked);
                if matches!(e, Error::Authentication(_)) {
                    match self.lockout.record_failure(self.clock.now()).await {
                        Ok(state) => warn!(
                            vault_id = %self.vault_id,
                            failures = state.consecutive_failures,
                            "Unlock failed"
                        ),
                        Err(persist) => warn!(error = %persist, "Failed to persist lockout state"),
                    }
                }
                Err(e)
            }
        }
    }

    async fn unlock_again(&self, inner: &mut Inner, passphrase: &SensitiveBytes) -> Result<()> {
        let token = self.cancellation_token();
        let candidate = self.attempt_unlock(&inner.file, passphrase, &token).await?;

        let current_duress = inner.active.as_ref().map(|a| a.duress).unwrap_or(false);
        if candidate.duress == current_duress {
            if let Some(active) = inner.active.as_mut() {
                active.deadline = candidate.deadline;
            }
            debug!(vault_id = %self.vault_id, "Unlock requested while already unlocked");
            return Ok(());
        }

        // Work started under the other slot must not outlive the switch.
        self.renew_lifecycle();
        let state = if candidate.duress {
            SessionState::DuressUnlocked
        } else {
            SessionState::Unlocked
        };
        if let Some(previous) = inner.active.replace(candidate) {
            if previous.dirty {
                warn!(vault_id = %self.vault_id, "Discarding unsaved changes");
            }
        }
        self.set_state(inner, state);
        info!(vault_id = %self.vault_id, "Vault unlocked");
        Ok(())
    }

    async fn attempt_unlock(
        &self,
        file: &VaultFile,
        passphrase: &SensitiveBytes,
        token: &CancellationToken,
    ) -> Result<Active> {
        let real_params = file.header().kdf.clone();
        let real = derive_key_cancellable(passphrase.clone(), real_params, token.clone());

        let (real, decoy): (DerivedKey, Option<DerivedKey>) = match &file.header().duress {
            Some(slot) => {
                let decoy =
                    derive_key_cancellable(passphrase.clone(), slot.kdf.clone(), token.clone());
                let (real, decoy) = tokio::join!(real, decoy);
                (real?, Some(decoy?))
            }
            None => (real.await?, None),
        };

        let deadline = self.clock.now() + self.options.ttl;

        let real_key = real.to_symmetric_key()?;
        if file.verify(&real_key) {
            let store = file.open_body(&real_key)?;
            let sync_key = file.open_sync_key(&real_key)?;
            let migration = if needs_migration(&file.header().kdf) {
                let params = self.fresh_recipe(&file.header().kdf);
                let derived =
                    derive_key_cancellable(passphrase.clone(), params.clone(), token.clone())
                        .await?;
                debug!(vault_id = %self.vault_id, "Legacy recipe will be replaced on next save");
                Some((params, derived.to_symmetric_key()?))
            } else {
                None
            };
            return Ok(Active {
                key: real_key,
                sync_key: Some(sync_key),
                store,
                deadline,
                duress: false,
                migration,
                dirty: false,
            });
        }

        if let Some(decoy) = decoy {
            let decoy_key = decoy.to_symmetric_key()?;
            if let Ok(store) = file.open_duress(&decoy_key) {
                return Ok(Active {
                    key: decoy_key,
                    sync_key: None,
                    store,
                    deadline,
                    duress: true,
                    migration: None,
                    dirty: false,
                });
            }
        }

        Err(Error::authentication())
    }

    /// Switch an unlocked session to the decoy store.
    ///
    /// The real key is wiped before the decoy is served.
    ///
    /// # Errors
    /// - `Locked` if the session is not unlocked
    /// - `Authentication` if there is no duress slot or the passphrase is wrong
    pub async fn present_duress(&self, passphrase: &SensitiveBytes) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.active_mut(&mut inner)?;

        let slot_kdf = match &inner.file.header().duress {
            Some(slot) => slot.kdf.clone(),
            None => return Err(Error::authentication()),
        };
        let token = self.cancellation_token();
        let derived = derive_key_cancellable(passphrase.clone(), slot_kdf, token).await?;
        let duress_key = derived.to_symmetric_key()?;
        let decoy = inner.file.open_duress(&duress_key)?;

        let deadline = self.clock.now() + self.options.ttl;
        inner.active = Some(Active {
            key: duress_key,
            sync_key: None,
            store: decoy,
            deadline,
            duress: true,
            migration: None,
            dirty: false,
        });
        self.set_state(&mut inner, SessionState::DuressUnlocked);
        Ok(())
    }

    /// Lock immediately, wiping the key and cancelling background work.
    pub async fn lock(&self) {
        self.cancellation_token().cancel();
        let mut inner = self.inner.lock().await;
        self.wipe(&mut inner);
        info!(vault_id = %self.vault_id, "Vault locked");
    }

    /// React to a platform signal.
    pub async fn handle_device_event(&self, event: DeviceEvent) {
        debug!(vault_id = %self.vault_id, event = ?event, "Device event");
        self.lock().await;
    }

    /// Slide the deadline forward by the configured ttl.
    ///
    /// # Errors
    /// - `Locked` if the session is locked or already expired
    pub async fn extend(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let now = self.clock.now();
        let ttl = self.options.ttl;
        let active = self.active_mut(&mut inner)?;
        active.deadline = now + ttl;
        Ok(())
    }

    /// Alias of [`extend`](Self::extend) for user-activity hooks.
    pub async fn record_activity(&self) -> Result<()> {
        self.extend().await
    }

    /// Current expiry deadline, if unlocked.
    pub async fn deadline(&self) -> Option<DateTime<chrono::Utc>> {
        let inner = self.inner.lock().await;
        inner.active.as_ref().map(|a| a.deadline)
    }

    /// Run `f` against the decrypted store.
    ///
    /// # Errors
    /// - `Locked` if locked, or if the deadline passed (the session locks)
    pub async fn with_store<R>(&self, f: impl FnOnce(&VaultStore) -> R) -> Result<R> {
        let mut inner = self.inner.lock().await;
        let active = self.active_mut(&mut inner)?;
        Ok(f(&active.store))
    }

    /// Run a mutation against the decrypted store.
    ///
    /// The change stays in memory until [`save`](Self::save). The session
    /// counts as dirty once the store revision moves.
    pub async fn with_store_mut<R>(
        &self,
        f: impl FnOnce(&mut VaultStore) -> Result<R>,
    ) -> Result<R> {
        let mut inner = self.inner.lock().await;
        let active = self.active_mut(&mut inner)?;
        let before = active.store.revision();
        let result = f(&mut active.store);
        if active.store.revision() != before {
            active.dirty = true;
        }
        result
    }

    /// Run `f` with the vault sync key.
    ///
    /// Returns `Ok(None)` while the decoy store is served; it is never
    /// synchronized.
    ///
    /// # Security
    /// - `f` must not retain the key
    pub async fn with_sync_key<R>(&self, f: impl FnOnce(&SymmetricKey) -> R) -> Result<Option<R>> {
        let mut inner = self.inner.lock().await;
        let active = self.active_mut(&mut inner)?;
        Ok(active.sync_key.as_ref().map(f))
    }

    /// Whether the store has changes not yet written to disk.
    pub async fn is_dirty(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.active.as_ref().map(|a| a.dirty).unwrap_or(false)
    }

    /// Pass through an asynchronous gate, re-checking expiry afterwards.
    ///
    /// # Errors
    /// - `Locked` if the session is locked before the gate, or expired while
    ///   the gate was pending
    /// - `Cancelled` if the session was locked while the gate was pending
    /// - Any error from the gate
    pub async fn authorize_with_gate(&self, gate: &dyn AuthGate) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            self.active_mut(&mut inner)?;
        }

        let token = self.cancellation_token();
        tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            result = gate.authorize() => result?,
        }

        let mut inner = self.inner.lock().await;
        self.active_mut(&mut inner)?;
        Ok(())
    }

    /// Lock if the deadline has passed. Returns whether the session is locked.
    pub async fn enforce_expiry(&self) -> bool {
        let mut inner = self.inner.lock().await;
        self.expire_if_due(&mut inner);
        inner.active.is_none()
    }

    /// Start a task that locks the session when the deadline passes.
    ///
    /// The task stops on [`shutdown`](Self::shutdown) or when the session is
    /// dropped.
    pub fn spawn_watchdog(self: &Arc<Self>) -> JoinHandle<()> {
        let session: Weak<Session> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let interval = self.options.watchdog_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        match session.upgrade() {
                            Some(session) => {
                                session.enforce_expiry().await;
                            }
                            None => break,
                        }
                    }
                }
            }
            debug!("Session watchdog stopped");
        })
    }

    /// Stop the watchdog and cancel background work.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.cancellation_token().cancel();
    }

    /// Re-seal the store and write the vault file atomically.
    ///
    /// In duress mode only the decoy slot is re-sealed. A vault opened with a
    /// legacy recipe is migrated to a random salt here.
    pub async fn save(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.active_mut(&mut inner)?;

        let Inner { file, active, .. } = &mut *inner;
        let active = active.as_mut().ok_or(Error::Locked)?;

        let mut next = file.clone();
        if active.duress {
            next.reseal_duress(&active.key, &active.store)?;
        } else if let Some((params, key)) = &active.migration {
            let sync_key = active.sync_key.as_ref().ok_or(Error::Locked)?;
            next.rekey(params.clone(), key, &active.store, sync_key)?;
        } else {
            next.reseal_body(&active.key, &active.store)?;
        }
        next.write(&self.path).await?;

        *file = next;
        if let Some((_, key)) = active.migration.take() {
            active.key = key;
            info!(vault_id = %self.vault_id, "Vault recipe migrated to random salt");
        }
        active.dirty = false;
        debug!(vault_id = %self.vault_id, "Vault saved");
        Ok(())
    }

    /// Change the passphrase of the slot this session unlocked.
    ///
    /// # Postconditions
    /// - A fresh random salt is used; the file is rewritten atomically
    ///
    /// # Errors
    /// - `Authentication` if `old` does not match
    /// - `Validation` if `new` is empty
    pub async fn change_passphrase(
        &self,
        old: &SensitiveBytes,
        new: &SensitiveBytes,
    ) -> Result<()> {
        if new.is_empty() {
            return Err(Error::Validation("Passphrase cannot be empty".to_string()));
        }

        let mut inner = self.inner.lock().await;
        self.active_mut(&mut inner)?;
        let token = self.cancellation_token();

        let Inner { file, active, .. } = &mut *inner;
        let active = active.as_mut().ok_or(Error::Locked)?;

        let current = if active.duress {
            match &file.header().duress {
                Some(slot) => slot.kdf.clone(),
                None => return Err(Error::Locked),
            }
        } else {
            file.header().kdf.clone()
        };

        let old_key = derive_key_cancellable(old.clone(), current.clone(), token.clone())
            .await?
            .to_symmetric_key()?;
        if !constant_time_eq(old_key.as_bytes(), active.key.as_bytes()) {
            return Err(Error::authentication());
        }

        let params = self.fresh_recipe(&current);
        let new_key = derive_key_cancellable(new.clone(), params.clone(), token)
            .await?
            .to_symmetric_key()?;

        let mut next = file.clone();
        match &active.sync_key {
            Some(sync_key) => next.rekey(params, &new_key, &active.store, sync_key)?,
            None => next.set_duress(params, &new_key, &active.store)?,
        }
        next.write(&self.path).await?;

        *file = next;
        active.key = new_key;
        active.migration = None;
        active.dirty = false;
        info!(vault_id = %self.vault_id, "Passphrase changed");
        Ok(())
    }

    /// Install a duress slot holding `decoy`.
    ///
    /// # Errors
    /// - `Validation` if the duress passphrase opens the real slot, or the
    ///   session itself was opened in duress mode
    pub async fn configure_duress(
        &self,
        duress_passphrase: &SensitiveBytes,
        decoy: VaultStore,
    ) -> Result<()> {
        if duress_passphrase.is_empty() {
            return Err(Error::Validation("Passphrase cannot be empty".to_string()));
        }

        let mut inner = self.inner.lock().await;
        self.active_mut(&mut inner)?;
        let token = self.cancellation_token();

        let Inner { file, active, .. } = &mut *inner;
        let active = active.as_mut().ok_or(Error::Locked)?;
        if active.duress {
            return Err(Error::Validation(
                "Duress slot cannot be configured from this session".to_string(),
            ));
        }

        let collides = derive_key_cancellable(
            duress_passphrase.clone(),
            file.header().kdf.clone(),
            token.clone(),
        )
        .await?
        .to_symmetric_key()?;
        if constant_time_eq(collides.as_bytes(), active.key.as_bytes()) {
            return Err(Error::Validation(
                "Duress passphrase must differ from the vault passphrase".to_string(),
            ));
        }

        let params = self.fresh_recipe(&file.header().kdf);
        let duress_key = derive_key_cancellable(duress_passphrase.clone(), params.clone(), token)
            .await?
            .to_symmetric_key()?;

        let mut next = file.clone();
        next.set_duress(params, &duress_key, &decoy)?;
        next.write(&self.path).await?;
        *file = next;
        info!(vault_id = %self.vault_id, "Duress slot configured");
        Ok(())
    }

    /// Remove the duress slot.
    pub async fn remove_duress(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let duress = self.active_mut(&mut inner)?.duress;
        if duress {
            return Err(Error::Validation(
                "Duress slot cannot be configured from this session".to_string(),
            ));
        }

        let mut next = inner.file.clone();
        next.clear_duress();
        next.write(&self.path).await?;
        inner.file = next;
        Ok(())
    }

    fn fresh_recipe(&self, current: &KdfParameters) -> KdfParameters {
        if current.algorithm == KdfAlgorithm::Legacy {
            self.options.migration_kdf.reseeded()
        } else {
            current.reseeded()
        }
    }

    fn renew_lifecycle(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let mut current = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        current.cancel();
        *current = token.clone();
        token
    }

    fn active_mut<'a>(&self, inner: &'a mut Inner) -> Result<&'a mut Active> {
        if self.expire_if_due(inner) {
            return Err(Error::Locked);
        }
        inner.active.as_mut().ok_or(Error::Locked)
    }

    fn expire_if_due(&self, inner: &mut Inner) -> bool {
        let expired = match &inner.active {
            Some(active) => self.clock.now() >= active.deadline,
            None => return false,
        };
        if expired {
            info!(vault_id = %self.vault_id, "Session expired");
            self.wipe(inner);
        }
        expired
    }

    fn wipe(&self, inner: &mut Inner) {
        self.cancellation_token().cancel();
        if let Some(active) = inner.active.take() {
            if active.dirty {
                warn!(vault_id = %self.vault_id, "Locking with unsaved changes");
            }
        }
        self.set_state(inner, SessionState::Locked);
    }

    fn set_state(&self, inner: &mut Inner, state: SessionState) {
        inner.state = state;
        let status = SessionStatus::from(state);
        self.status_tx.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.cancellation_token().cancel();
    }
}

fn needs_migration(kdf: &KdfParameters) -> bool {
    kdf.algorithm == KdfAlgorithm::Legacy || kdf.salt_origin != SaltOrigin::Random
}
