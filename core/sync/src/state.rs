//! Sync state tracking and persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::warn;

use keyward_common::{Error, Result};
use keyward_storage::SyncVersion;

/// Where a vault stands with respect to its remote copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Nothing in flight.
    #[default]
    Idle,
    /// A sync is running.
    Syncing,
    /// A sealed blob is staged locally waiting for upload.
    PendingSync,
    /// Divergence left for manual resolution.
    Conflicted,
    /// The last sync failed with a non-transient error.
    Failed,
}

/// Persisted sync bookkeeping for one vault.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Remote version at the last successful sync.
    pub last_synced: Option<SyncVersion>,
    /// Local store revision at the last successful sync.
    pub last_synced_revision: Option<u64>,
    pub status: SyncStatus,
    /// Consecutive failed attempts.
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl SyncState {
    /// Create a new empty sync state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark as syncing.
    pub fn mark_syncing(&mut self, now: DateTime<Utc>) {
        self.status = SyncStatus::Syncing;
        self.last_attempt_at = Some(now);
    }

    /// Mark as synced successfully.
    pub fn mark_synced(&mut self, version: SyncVersion, revision: u64, now: DateTime<Utc>) {
        self.last_synced = Some(version);
        self.last_synced_revision = Some(revision);
        self.status = SyncStatus::Idle;
        self.failure_count = 0;
        self.last_error = None;
        self.last_success_at = Some(now);
    }

    /// Mark as waiting for a retry of a staged upload.
    pub fn mark_pending(&mut self, error: impl Into<String>) {
        self.status = SyncStatus::PendingSync;
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_error = Some(error.into());
    }

    /// Mark as conflicted.
    pub fn mark_conflicted(&mut self, conflicts: usize) {
        self.status = SyncStatus::Conflicted;
        self.last_error = Some(format!("{} diverged field(s)", conflicts));
    }

    /// Mark as failed.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = SyncStatus::Failed;
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_error = Some(error.into());
    }

    /// Whether the remote still matches what was last synced.
    pub fn remote_unchanged(&self, remote: Option<&SyncVersion>) -> bool {
        match (self.last_synced.as_ref(), remote) {
            (_, None) => true,
            (Some(known), Some(current)) => known.same_state(current),
            (None, Some(_)) => false,
        }
    }

    /// Whether local edits happened since the last successful sync.
    pub fn local_changed(&self, revision: u64) -> bool {
        self.last_synced_revision != Some(revision)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Load from `path`, starting fresh when the file is missing.
    ///
    /// An unreadable file is logged and replaced by a fresh state; the next
    /// sync then treats the remote as unknown and merges instead of
    /// overwriting it.
    pub async fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path).await {
            Ok(json) => match Self::from_json(&json) {
                Ok(state) => Ok(state),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Discarding unreadable sync state");
                    Ok(Self::new())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to `path` atomically.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, self.to_json()?).await?;
        fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}
