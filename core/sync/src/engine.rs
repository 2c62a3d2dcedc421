//! Core sync engine.
//!
//! One sync round trip:
//! 1. Seal a snapshot of the store with the cross-platform profile under a
//!    subkey of the vault sync key. The provider only ever sees this
//!    ciphertext.
//! 2. Ask the provider for its version and compare it with the version
//!    recorded at the last successful sync.
//! 3. Unchanged (or empty) remote: upload if the local revision moved.
//! 4. Changed remote: download, open, merge with the resolver, write the
//!    merged store locally, then upload unless the remote already holds it.
//!
//! Transient failures after retries stage the sealed blob locally and mark
//! the vault `PendingSync`; the local vault file is never touched by a
//! failed upload. Every provider call observes the session's cancellation
//! token, so locking the session aborts a running sync.
//!
//! A session serving the decoy store has no sync key. Syncing it reports
//! `UpToDate` without contacting the provider, so the remote copy of the
//! real store is never replaced by the decoy.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use keyward_common::{Clock, Error, Result, VaultId};
use keyward_crypto::{Envelope, Profile, SymmetricKey};
use keyward_storage::{SyncProvider, SyncVersion};
use keyward_vault::{Session, VaultStore, SYNC_CONTEXT};

use crate::conflict::{ConflictReport, ConflictResolver, ConflictStrategy};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::staging::StagingArea;
use crate::state::{SyncState, SyncStatus};

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// Timeout and backoff for each provider call.
    pub retry: RetryConfig,
    /// Conflict resolution strategy.
    pub conflict_strategy: ConflictStrategy,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            conflict_strategy: ConflictStrategy::LastWriteWins,
        }
    }
}

/// Result of one sync call.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// Local and remote already agree; nothing was transferred.
    UpToDate,
    /// The local snapshot was uploaded over an unchanged remote.
    Uploaded { version: SyncVersion },
    /// The remote had changed and was merged in.
    Merged {
        report: ConflictReport,
        /// Whether the local store changed (and was saved).
        local_changed: bool,
        /// Version now recorded as synced; freshly uploaded unless the
        /// remote already held the merged contents.
        version: SyncVersion,
    },
    /// The provider stayed unreachable; a sealed blob is staged locally.
    Pending { reason: String },
}

/// Blob that would be staged if the round trip fails.
struct Outgoing {
    blob: Vec<u8>,
    revision: u64,
}

/// Sync engine for one vault and one provider.
pub struct SyncEngine {
    vault_id: VaultId,
    provider: Arc<dyn SyncProvider>,
    retry: RetryExecutor,
    resolver: ConflictResolver,
    staging: StagingArea,
    state_path: PathBuf,
    state: StdMutex<SyncState>,
    running: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl SyncEngine {
    /// Create an engine keeping its state under `state_dir`.
    ///
    /// # Postconditions
    /// - Previously persisted state and staged blobs are picked up
    ///
    /// # Errors
    /// - `Io` if the state directory cannot be created or read
    pub async fn new(
        vault_id: VaultId,
        provider: Arc<dyn SyncProvider>,
        state_dir: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
        config: SyncEngineConfig,
    ) -> Result<Self> {
        let state_dir = state_dir.as_ref();
        let staging = StagingArea::new(state_dir, vault_id.as_str()).await?;
        let state_path = state_dir.join(format!("{}.sync.json", vault_id.as_str()));
        let state = SyncState::load(&state_path).await?;

        Ok(Self {
            vault_id,
            provider,
            retry: RetryExecutor::new(config.retry),
            resolver: ConflictResolver::new(config.conflict_strategy),
            staging,
            state_path,
            state: StdMutex::new(state),
            running: Mutex::new(()),
            clock,
        })
    }

    /// Provider name.
    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Snapshot of the sync state.
    pub fn state(&self) -> SyncState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Current status.
    pub fn status(&self) -> SyncStatus {
        self.state().status
    }

    /// Whether a sealed blob is waiting for upload.
    pub async fn has_pending(&self) -> bool {
        self.staging.has_pending().await
    }

    /// Synchronize the session's store with the remote copy.
    ///
    /// # Preconditions
    /// - The session is unlocked
    ///
    /// # Postconditions
    /// - On success the remote holds ciphertext of the merged store and the
    ///   synced version is persisted
    /// - A decoy session returns `UpToDate`; provider and state are untouched
    /// - On transient failure the local vault is unchanged by the upload
    ///   attempt, a blob is staged, and `Pending` is returned
    ///
    /// # Errors
    /// - `Locked` if the session is locked
    /// - `Cancelled` if the session locks mid-sync
    /// - `Conflict` under the manual strategy when entries diverged
    /// - `Authentication` if the remote blob cannot be opened with this key
    pub async fn sync(&self, session: &Session) -> Result<SyncOutcome> {
        let _running = self.running.lock().await;

        let cancel = session.cancellation_token();
        let Some(key) = session
            .with_sync_key(|k| k.derive_subkey(SYNC_CONTEXT))
            .await?
        else {
            return Ok(SyncOutcome::UpToDate);
        };
        let aad = sync_aad(&self.vault_id);
        let mut outgoing = session
            .with_store(|store| seal_store(&key, &aad, store))
            .await??;

        let previous = self.update_state(|s| {
            let previous = s.status;
            s.mark_syncing(self.clock.now());
            previous
        });
        self.persist_state().await;
        info!(vault_id = %self.vault_id, provider = self.provider.name(), "Sync started");

        let result = self
            .round_trip(session, &cancel, &key, &aad, &mut outgoing)
            .await;

        match result {
            Ok(outcome) => {
                info!(vault_id = %self.vault_id, "Sync finished");
                Ok(outcome)
            }
            Err(Error::Cancelled) => {
                self.update_state(|s| s.status = restore_status(previous));
                self.persist_state().await;
                info!(vault_id = %self.vault_id, "Sync cancelled");
                Err(Error::Cancelled)
            }
            Err(Error::Conflict { conflicts }) => {
                self.update_state(|s| s.mark_conflicted(conflicts));
                self.persist_state().await;
                Err(Error::Conflict { conflicts })
            }
            Err(e) if e.is_retryable() => {
                error!(vault_id = %self.vault_id, error = %e, "Sync failed; staging upload");
                self.staging
                    .stage(&outgoing.blob, outgoing.revision, self.clock.now())
                    .await?;
                let reason = e.to_string();
                self.update_state(|s| s.mark_pending(reason.clone()));
                self.persist_state().await;
                Ok(SyncOutcome::Pending { reason })
            }
            Err(e) => {
                error!(vault_id = %self.vault_id, error = %e, "Sync failed");
                self.update_state(|s| s.mark_failed(e.to_string()));
                self.persist_state().await;
                Err(e)
            }
        }
    }

    async fn round_trip(
        &self,
        session: &Session,
        cancel: &CancellationToken,
        key: &SymmetricKey,
        aad: &[u8],
        outgoing: &mut Outgoing,
    ) -> Result<SyncOutcome> {
        let remote = self
            .retry
            .execute(cancel, || self.provider.remote_version())
            .await?;
        let state = self.state();

        if state.remote_unchanged(remote.as_ref()) {
            if remote.is_some() && !state.local_changed(outgoing.revision) {
                debug!(vault_id = %self.vault_id, "Already in sync");
                self.staging.clear().await?;
                self.update_state(|s| s.status = SyncStatus::Idle);
                self.persist_state().await;
                return Ok(SyncOutcome::UpToDate);
            }

            let version = self.upload(cancel, &outgoing.blob).await?;
            self.record_synced(version.clone(), outgoing.revision).await?;
            return Ok(SyncOutcome::Uploaded { version });
        }

        debug!(vault_id = %self.vault_id, "Remote changed since last sync; merging");
        let remote_blob = self
            .retry
            .execute(cancel, || self.provider.download())
            .await?;
        let remote_store = open_store(key, aad, &remote_blob)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let resolver = self.resolver;
        let (report, local_changed, remote_current, next) = session
            .with_store_mut(|current| {
                let outcome = resolver.resolve(current, &remote_store)?;
                let local_changed = !outcome.store.same_contents(current);
                let remote_current = outcome.store.same_contents(&remote_store);
                if local_changed {
                    *current = outcome.store;
                }
                let next = seal_store(key, aad, current)?;
                Ok((outcome.report, local_changed, remote_current, next))
            })
            .await?;
        *outgoing = next;

        if report.has_conflicts() {
            warn!(
                vault_id = %self.vault_id,
                entries = report.diverged_entries(),
                fields = report.diverged_fields(),
                "Sync conflicts resolved by last write"
            );
        }

        if local_changed {
            session.save().await?;
        }

        let version = match (remote_current, remote) {
            (true, Some(remote)) => remote,
            _ => self.upload(cancel, &outgoing.blob).await?,
        };
        self.record_synced(version.clone(), outgoing.revision).await?;

        Ok(SyncOutcome::Merged {
            report,
            local_changed,
            version,
        })
    }

    /// Upload a staged blob without unlocking.
    ///
    /// The staged blob is already sealed, so this works while the vault is
    /// locked. It only goes through when the remote is unchanged since the
    /// last sync; otherwise a full [`sync`](Self::sync) is needed to merge.
    ///
    /// # Returns
    /// The uploaded version, or `None` if nothing was uploaded.
    ///
    /// # Errors
    /// - `Cancelled` if `cancel` fires
    /// - Transport errors once retries are exhausted (the blob stays staged)
    pub async fn flush_pending(&self, cancel: &CancellationToken) -> Result<Option<SyncVersion>> {
        let _running = self.running.lock().await;

        let Some((blob, staged)) = self.staging.pending().await? else {
            return Ok(None);
        };

        let remote = self
            .retry
            .execute(cancel, || self.provider.remote_version())
            .await?;
        if !self.state().remote_unchanged(remote.as_ref()) {
            info!(vault_id = %self.vault_id, "Remote changed; staged upload needs a merge");
            return Ok(None);
        }

        let version = self.upload(cancel, &blob).await?;
        self.record_synced(version.clone(), staged.revision).await?;
        info!(vault_id = %self.vault_id, "Staged upload flushed");
        Ok(Some(version))
    }

    async fn upload(&self, cancel: &CancellationToken, blob: &[u8]) -> Result<SyncVersion> {
        let version = self
            .retry
            .execute(cancel, || self.provider.upload(blob.to_vec()))
            .await?;
        debug!(vault_id = %self.vault_id, token = %version.token, "Blob uploaded");
        Ok(version)
    }

    async fn record_synced(&self, version: SyncVersion, revision: u64) -> Result<()> {
        self.staging.clear().await?;
        let now = self.clock.now();
        self.update_state(|s| s.mark_synced(version, revision, now));
        self.persist_state().await;
        Ok(())
    }

    fn update_state<R>(&self, f: impl FnOnce(&mut SyncState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Best effort; a lost state file only costs one extra merge.
    async fn persist_state(&self) {
        let snapshot = self.state();
        if let Err(e) = snapshot.save(&self.state_path).await {
            warn!(path = %self.state_path.display(), error = %e, "Failed to persist sync state");
        }
    }
}

fn restore_status(previous: SyncStatus) -> SyncStatus {
    match previous {
        SyncStatus::Syncing => SyncStatus::Idle,
        other => other,
    }
}

fn sync_aad(vault_id: &VaultId) -> Vec<u8> {
    let mut aad = b"sync:".to_vec();
    aad.extend_from_slice(vault_id.as_str().as_bytes());
    aad
}

fn seal_store(key: &SymmetricKey, aad: &[u8], store: &VaultStore) -> Result<Outgoing> {
    let plaintext = store.to_bytes()?;
    let envelope = Envelope::seal(Profile::CrossPlatform, key, &plaintext, aad)?;
    Ok(Outgoing {
        blob: envelope.to_bytes(),
        revision: store.revision(),
    })
}

fn open_store(key: &SymmetricKey, aad: &[u8], blob: &[u8]) -> Result<VaultStore> {
    let envelope = Envelope::from_bytes(blob).map_err(|_| Error::authentication())?;
    let plaintext = envelope.open(Profile::CrossPlatform, key, aad)?;
    VaultStore::from_bytes(&plaintext)
}
