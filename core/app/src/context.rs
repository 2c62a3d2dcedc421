//! Explicit application context.
//!
//! Everything the service needs from the outside world is gathered here and
//! handed over at construction. There are no process-wide singletons.

use serde_json::Value;
use std::sync::Arc;

use keyward_common::{Clock, Result, SystemClock, VaultId};
use keyward_storage::{ProviderRegistry, SyncProvider};
use keyward_vault::{ClipboardBackend, MemoryClipboard};

use crate::config::AppConfig;

/// Configuration plus the collaborators injected into [`crate::VaultService`].
pub struct AppContext {
    pub config: AppConfig,
    pub clock: Arc<dyn Clock>,
    pub clipboard: Arc<dyn ClipboardBackend>,
    registry: ProviderRegistry,
    provider: Option<Arc<dyn SyncProvider>>,
}

impl AppContext {
    /// Context with the system clock, a process-local clipboard and the
    /// builtin provider registry.
    ///
    /// # Errors
    /// - `Validation` if the configuration is invalid
    pub fn from_config(config: AppConfig) -> Result<Self> {
        Self::with_registry(config, ProviderRegistry::builtin())
    }

    /// Like [`from_config`](Self::from_config) with a caller-supplied registry.
    pub fn with_registry(config: AppConfig, registry: ProviderRegistry) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            clock: Arc::new(SystemClock),
            clipboard: Arc::new(MemoryClipboard::new()),
            registry,
            provider: None,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the clipboard, e.g. with the platform clipboard.
    pub fn with_clipboard(mut self, clipboard: Arc<dyn ClipboardBackend>) -> Self {
        self.clipboard = clipboard;
        self
    }

    /// Use `provider` for every vault instead of the configured one.
    pub fn with_provider(mut self, provider: Arc<dyn SyncProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Remote storage for one vault, or `None` when sync is disabled.
    ///
    /// A provider from the configuration stores each vault under its own
    /// name unless the options already name the blob.
    ///
    /// # Errors
    /// - `NotFound` if the configured provider is not registered
    /// - `Validation` if the provider rejects its options
    pub fn provider_for(&self, vault_id: &VaultId) -> Result<Option<Arc<dyn SyncProvider>>> {
        if let Some(provider) = &self.provider {
            return Ok(Some(Arc::clone(provider)));
        }
        let Some(selected) = &self.config.sync.provider else {
            return Ok(None);
        };
        let mut options = selected.options.clone();
        if let Value::Object(map) = &mut options {
            map.entry("name")
                .or_insert_with(|| Value::String(vault_id.as_str().to_string()));
        }
        self.registry
            .resolve(&selected.name, &options, &[])
            .map(Some)
    }
}
