//! Local staging area for uploads that could not reach the remote.
//!
//! Only sealed sync blobs are staged, so the staging directory holds
//! ciphertext exclusively. A staged blob is replaced by the next one and
//! removed once an upload succeeds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use keyward_common::{Error, Result};

/// Bookkeeping for the staged blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedUpload {
    /// Local store revision the blob was sealed from.
    pub revision: u64,
    /// When the blob was staged.
    pub staged_at: DateTime<Utc>,
    /// Size of the blob in bytes.
    pub size: u64,
}

/// Staging area holding at most one pending blob.
#[derive(Debug, Clone)]
pub struct StagingArea {
    blob_path: PathBuf,
    meta_path: PathBuf,
}

impl StagingArea {
    /// Create a staging area for `name` under `base_dir`.
    pub async fn new(base_dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(Error::Validation(format!("Invalid staging name '{}'", name)));
        }
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;

        Ok(Self {
            blob_path: base_dir.join(format!("{}.pending", name)),
            meta_path: base_dir.join(format!("{}.pending.json", name)),
        })
    }

    /// Stage `blob`, replacing any earlier one.
    ///
    /// # Postconditions
    /// - The blob file is complete before its metadata is written, so a
    ///   crash never leaves metadata pointing at a partial blob
    pub async fn stage(&self, blob: &[u8], revision: u64, now: DateTime<Utc>) -> Result<StagedUpload> {
        let staged = StagedUpload {
            revision,
            staged_at: now,
            size: blob.len() as u64,
        };

        let _ = fs::remove_file(&self.meta_path).await;
        let tmp_blob = self.blob_path.with_extension("pending.tmp");
        fs::write(&tmp_blob, blob).await?;
        fs::rename(&tmp_blob, &self.blob_path).await?;

        let tmp_meta = self.meta_path.with_extension("json.tmp");
        fs::write(&tmp_meta, serde_json::to_vec_pretty(&staged)?).await?;
        fs::rename(&tmp_meta, &self.meta_path).await?;

        debug!(revision, size = staged.size, "Sync blob staged");
        Ok(staged)
    }

    /// Staged blob and its bookkeeping, if any.
    pub async fn pending(&self) -> Result<Option<(Vec<u8>, StagedUpload)>> {
        let meta = match fs::read(&self.meta_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let staged: StagedUpload = match serde_json::from_slice(&meta) {
            Ok(staged) => staged,
            Err(e) => {
                warn!(error = %e, "Dropping unreadable staging metadata");
                self.clear().await?;
                return Ok(None);
            }
        };

        let blob = match fs::read(&self.blob_path).await {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Staging metadata without blob; clearing");
                self.clear().await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if blob.len() as u64 != staged.size {
            warn!(expected = staged.size, actual = blob.len(), "Staged blob size mismatch; clearing");
            self.clear().await?;
            return Ok(None);
        }

        Ok(Some((blob, staged)))
    }

    /// Whether a blob is staged.
    pub async fn has_pending(&self) -> bool {
        fs::metadata(&self.meta_path).await.is_ok()
    }

    /// Remove the staged blob.
    pub async fn clear(&self) -> Result<()> {
        for path in [&self.meta_path, &self.blob_path] {
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_stage_and_read_back() {
        let temp = TempDir::new().unwrap();
        let staging = StagingArea::new(temp.path(), "personal").await.unwrap();
        assert!(staging.pending().await.unwrap().is_none());

        staging.stage(b"sealed-1", 4, Utc::now()).await.unwrap();
        let (blob, staged) = staging.pending().await.unwrap().unwrap();
        assert_eq!(blob, b"sealed-1");
        assert_eq!(staged.revision, 4);
        assert!(staging.has_pending().await);
    }

    #[tokio::test]
    async fn test_restage_replaces() {
        let temp = TempDir::new().unwrap();
        let staging = StagingArea::new(temp.path(), "personal").await.unwrap();
        staging.stage(b"old", 1, Utc::now()).await.unwrap();
        staging.stage(b"newer", 2, Utc::now()).await.unwrap();

        let (blob, staged) = staging.pending().await.unwrap().unwrap();
        assert_eq!(blob, b"newer");
        assert_eq!(staged.revision, 2);
    }

    #[tokio::test]
    async fn test_clear() {
        let temp = TempDir::new().unwrap();
        let staging = StagingArea::new(temp.path(), "personal").await.unwrap();
        staging.stage(b"blob", 1, Utc::now()).await.unwrap();
        staging.clear().await.unwrap();
        assert!(!staging.has_pending().await);
        staging.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_truncated_blob_is_discarded() {
        let temp = TempDir::new().unwrap();
        let staging = StagingArea::new(temp.path(), "personal").await.unwrap();
        staging.stage(b"complete blob", 1, Utc::now()).await.unwrap();
        std::fs::write(temp.path().join("personal.pending"), b"compl").unwrap();

        assert!(staging.pending().await.unwrap().is_none());
        assert!(!staging.has_pending().await);
    }
}
