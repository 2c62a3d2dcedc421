//! In-memory sync provider for testing.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

use crate::provider::{SyncProvider, SyncVersion};
use keyward_common::{Error, Result};

#[derive(Default)]
struct Shared {
    blob: RwLock<Option<(Vec<u8>, SyncVersion)>>,
    failures_remaining: AtomicU32,
    delay_ms: AtomicU64,
    uploads: AtomicU32,
    calls: AtomicU32,
}

/// In-memory sync provider.
///
/// Clones share the same remote slot, so two devices can be simulated by
/// handing each one a clone. Failures and latency can be injected to
/// exercise retry and cancellation paths.
#[derive(Clone, Default)]
pub struct MemoryProvider {
    shared: Arc<Shared>,
}

impl MemoryProvider {
    /// Create a provider with an empty remote slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls with a `Network` error.
    pub fn fail_next(&self, count: u32) {
        self.shared.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Delay every call by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.shared
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of successful uploads so far.
    pub fn upload_count(&self) -> u32 {
        self.shared.uploads.load(Ordering::SeqCst)
    }

    /// Number of calls attempted so far, failed ones included.
    pub fn call_count(&self) -> u32 {
        self.shared.calls.load(Ordering::SeqCst)
    }

    /// Raw stored blob, for asserting that only ciphertext reaches the remote.
    pub fn stored_blob(&self) -> Option<Vec<u8>> {
        self.shared
            .blob
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(blob, _)| blob.clone())
    }

    async fn simulate(&self) -> Result<()> {
        self.shared.calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.shared.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let injected = self
            .shared
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Network("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SyncProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upload(&self, blob: Vec<u8>) -> Result<SyncVersion> {
        self.simulate().await?;

        let version = SyncVersion::for_blob(Uuid::new_v4().to_string(), &blob, Utc::now());
        *self.shared.blob.write().unwrap_or_else(|e| e.into_inner()) =
            Some((blob, version.clone()));
        self.shared.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(version)
    }

    async fn download(&self) -> Result<Vec<u8>> {
        self.simulate().await?;

        self.stored_blob()
            .ok_or_else(|| Error::NotFound("No remote blob".to_string()))
    }

    async fn remote_version(&self) -> Result<Option<SyncVersion>> {
        self.simulate().await?;

        Ok(self
            .shared
            .blob
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(_, version)| version.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_download() {
        let provider = MemoryProvider::new();
        assert!(provider.remote_version().await.unwrap().is_none());

        let version = provider.upload(b"ciphertext".to_vec()).await.unwrap();
        assert_eq!(provider.download().await.unwrap(), b"ciphertext");
        assert_eq!(provider.remote_version().await.unwrap(), Some(version));
    }

    #[tokio::test]
    async fn test_download_empty_is_not_found() {
        let provider = MemoryProvider::new();
        let result = provider.download().await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_clones_share_remote() {
        let a = MemoryProvider::new();
        let b = a.clone();
        a.upload(b"one".to_vec()).await.unwrap();
        assert_eq!(b.download().await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let provider = MemoryProvider::new();
        provider.fail_next(2);

        assert!(matches!(
            provider.upload(b"x".to_vec()).await,
            Err(Error::Network(_))
        ));
        assert!(provider.remote_version().await.is_err());
        assert!(provider.upload(b"x".to_vec()).await.is_ok());
        assert_eq!(provider.upload_count(), 1);
        assert_eq!(provider.call_count(), 3);
    }
}
