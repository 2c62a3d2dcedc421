//! Clipboard copies that clear themselves.
//!
//! The platform clipboard is reached through [`ClipboardBackend`]; this
//! module only owns the scheduling. A copy schedules a clear after its ttl,
//! a newer copy cancels the older clear, and a clear only fires if the
//! clipboard still holds exactly the text that was copied.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

use keyward_common::Result;
use keyward_crypto::constant_time_eq;

/// Platform clipboard access.
pub trait ClipboardBackend: Send + Sync + 'static {
    /// Current text content, if any.
    fn read_text(&self) -> Result<Option<String>>;
    /// Replace the content.
    fn write_text(&self, text: &str) -> Result<()>;
    /// Empty the clipboard.
    fn clear(&self) -> Result<()>;
}

/// Process-local clipboard, for tests and headless use.
#[derive(Debug, Default)]
pub struct MemoryClipboard {
    content: Mutex<Option<String>>,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClipboardBackend for MemoryClipboard {
    fn read_text(&self) -> Result<Option<String>> {
        Ok(self.content.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn write_text(&self, text: &str) -> Result<()> {
        let mut content = self.content.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = content.as_mut() {
            old.zeroize();
        }
        *content = Some(text.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut content = self.content.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = content.as_mut() {
            old.zeroize();
        }
        *content = None;
        Ok(())
    }
}

/// Clipboard wrapper that schedules clears for copied secrets.
pub struct SecureClipboard<B: ClipboardBackend + ?Sized> {
    backend: Arc<B>,
    pending: Mutex<Option<CancellationToken>>,
}

impl<B: ClipboardBackend + ?Sized> SecureClipboard<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            pending: Mutex::new(None),
        }
    }

    /// Underlying backend.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Copy `text` and clear it after `ttl` unless replaced in the meantime.
    ///
    /// Must be called from within a tokio runtime. The returned handle
    /// resolves once the clear has fired or been superseded.
    pub fn copy_secret(&self, text: &str, ttl: Duration) -> Result<JoinHandle<()>> {
        self.backend.write_text(text)?;

        let token = CancellationToken::new();
        if let Some(previous) = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(token.clone())
        {
            previous.cancel();
        }

        let backend = Arc::clone(&self.backend);
        let expected = Zeroizing::new(text.to_string());
        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Scheduled clipboard clear superseded");
                }
                _ = tokio::time::sleep(ttl) => {
                    clear_if_unchanged(&*backend, &expected);
                }
            }
        }))
    }

    /// Cancel the pending clear, leaving the clipboard as it is.
    pub fn cancel_pending(&self) {
        if let Some(token) = self.pending.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }
    }
}

fn clear_if_unchanged<B: ClipboardBackend + ?Sized>(backend: &B, expected: &str) {
    match backend.read_text() {
        Ok(Some(mut current)) => {
            let unchanged = constant_time_eq(current.as_bytes(), expected.as_bytes());
            current.zeroize();
            if !unchanged {
                debug!("Clipboard changed since copy; leaving it alone");
                return;
            }
            match backend.clear() {
                Ok(()) => debug!("Clipboard cleared"),
                Err(e) => warn!(error = %e, "Failed to clear clipboard"),
            }
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Failed to read clipboard"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(30);

    #[tokio::test]
    async fn test_clears_after_ttl() {
        let clipboard = SecureClipboard::new(Arc::new(MemoryClipboard::new()));
        let handle = clipboard.copy_secret("hunter2", SHORT).unwrap();

        assert_eq!(
            clipboard.backend().read_text().unwrap().as_deref(),
            Some("hunter2")
        );
        handle.await.unwrap();
        assert_eq!(clipboard.backend().read_text().unwrap(), None);
    }

    #[tokio::test]
    async fn test_user_copy_is_not_cleared() {
        let clipboard = SecureClipboard::new(Arc::new(MemoryClipboard::new()));
        let handle = clipboard.copy_secret("hunter2", SHORT).unwrap();
        clipboard.backend().write_text("shopping list").unwrap();

        handle.await.unwrap();
        assert_eq!(
            clipboard.backend().read_text().unwrap().as_deref(),
            Some("shopping list")
        );
    }

    #[tokio::test]
    async fn test_new_copy_supersedes_previous_clear() {
        let clipboard = SecureClipboard::new(Arc::new(MemoryClipboard::new()));
        let first = clipboard.copy_secret("first", SHORT).unwrap();
        let second = clipboard
            .copy_secret("second", Duration::from_secs(60))
            .unwrap();

        first.await.unwrap();
        assert_eq!(
            clipboard.backend().read_text().unwrap().as_deref(),
            Some("second")
        );

        clipboard.cancel_pending();
        second.await.unwrap();
        assert_eq!(
            clipboard.backend().read_text().unwrap().as_deref(),
            Some("second")
        );
    }
}
