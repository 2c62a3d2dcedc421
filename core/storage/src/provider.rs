//! Sync provider trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use keyward_common::Result;

/// Divergence marker for the remote blob.
///
/// Two versions describe the same remote state when their tokens and
/// content hashes match. The timestamp is informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncVersion {
    /// Provider-assigned revision token (etag, generation number, uuid).
    pub token: String,
    /// When the provider accepted the blob.
    pub modified_at: DateTime<Utc>,
    /// Lowercase hex SHA-256 of the stored ciphertext.
    pub content_hash: String,
}

impl SyncVersion {
    /// Version for `blob` stored under `token` at `modified_at`.
    pub fn for_blob(token: impl Into<String>, blob: &[u8], modified_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            modified_at,
            content_hash: content_hash(blob),
        }
    }

    /// Whether `other` names the same remote state.
    pub fn same_state(&self, other: &SyncVersion) -> bool {
        self.token == other.token && self.content_hash == other.content_hash
    }
}

/// Lowercase hex SHA-256 of `data`.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Remote storage for one vault's sync blob.
///
/// Implementations store opaque ciphertext only and must handle their own
/// authentication and rate limiting. Timeouts and retries are applied by
/// the caller.
#[async_trait]
pub trait SyncProvider: Send + Sync {
    /// Provider name (e.g. "memory", "directory").
    fn name(&self) -> &str;

    /// Replace the remote blob.
    ///
    /// # Preconditions
    /// - `blob` is the complete, already-encrypted payload
    ///
    /// # Postconditions
    /// - The remote blob is replaced atomically
    /// - Returns the version now stored remotely
    ///
    /// # Errors
    /// - `Network` or `Io` on transport failure
    async fn upload(&self, blob: Vec<u8>) -> Result<SyncVersion>;

    /// Fetch the remote blob.
    ///
    /// # Errors
    /// - `NotFound` if nothing was ever uploaded
    /// - `Network` or `Io` on transport failure
    async fn download(&self) -> Result<Vec<u8>>;

    /// Version of the remote blob, or `None` if nothing was ever uploaded.
    async fn remote_version(&self) -> Result<Option<SyncVersion>>;
}
