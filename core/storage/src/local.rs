//! Directory-backed sync provider.
//!
//! Suitable for a folder that some other tool mirrors to the cloud. The
//! blob and a small version sidecar are each replaced with a write to a
//! temporary file followed by a rename.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::provider::{content_hash, SyncProvider, SyncVersion};
use keyward_common::{Error, Result};

/// Sync provider storing the blob as a file in a directory.
pub struct DirectoryProvider {
    blob_path: PathBuf,
    version_path: PathBuf,
}

impl DirectoryProvider {
    /// Create a provider storing `<root>/<name>.blob`.
    ///
    /// # Preconditions
    /// - `name` is a plain file stem without separators
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - `Validation` for an empty or path-like name
    /// - `Io` if the directory cannot be created
    pub fn new(root: impl AsRef<Path>, name: &str) -> Result<Self> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(Error::Validation(format!(
                "Invalid sync blob name '{}'",
                name
            )));
        }

        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self {
            blob_path: root.join(format!("{}.blob", name)),
            version_path: root.join(format!("{}.version.json", name)),
        })
    }

    /// Path of the blob file.
    pub fn blob_path(&self) -> &Path {
        &self.blob_path
    }

    /// Version derived from the blob itself when the sidecar is missing or
    /// stale, e.g. because a mirroring tool copied only one of the files.
    async fn version_from_blob(&self) -> Result<Option<SyncVersion>> {
        let blob = match fs::read(&self.blob_path).await {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let modified: DateTime<Utc> = fs::metadata(&self.blob_path)
            .await?
            .modified()
            .map(Into::into)
            .unwrap_or_else(|_| Utc::now());
        let hash = content_hash(&blob);
        Ok(Some(SyncVersion {
            token: format!("sha256:{}", hash),
            modified_at: modified,
            content_hash: hash,
        }))
    }
}

async fn replace_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    fs::write(&tmp_path, bytes).await?;
    if let Err(e) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    Ok(())
}

#[async_trait]
impl SyncProvider for DirectoryProvider {
    fn name(&self) -> &str {
        "directory"
    }

    async fn upload(&self, blob: Vec<u8>) -> Result<SyncVersion> {
        let version = SyncVersion::for_blob(Uuid::new_v4().to_string(), &blob, Utc::now());

        replace_file(&self.blob_path, &blob).await?;
        replace_file(&self.version_path, &serde_json::to_vec_pretty(&version)?).await?;

        debug!(path = %self.blob_path.display(), size = blob.len(), "Sync blob written");
        Ok(version)
    }

    async fn download(&self) -> Result<Vec<u8>> {
        match fs::read(&self.blob_path).await {
            Ok(blob) => Ok(blob),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(format!(
                "No sync blob at {}",
                self.blob_path.display()
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn remote_version(&self) -> Result<Option<SyncVersion>> {
        let sidecar = match fs::read(&self.version_path).await {
            Ok(bytes) => match serde_json::from_slice::<SyncVersion>(&bytes) {
                Ok(version) => Some(version),
                Err(e) => {
                    warn!(path = %self.version_path.display(), error = %e, "Ignoring unreadable version sidecar");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let from_blob = self.version_from_blob().await?;
        match (sidecar, from_blob) {
            (Some(sidecar), Some(actual)) if sidecar.content_hash == actual.content_hash => {
                Ok(Some(sidecar))
            }
            (_, actual) => Ok(actual),
        }
    }
}
