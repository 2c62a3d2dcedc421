//! Application configuration.
//!
//! Stored as a JSON file; every field has a default so a missing file or a
//! partial one is valid.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::debug;

use keyward_common::{Error, Result};
use keyward_crypto::{KdfAlgorithm, KdfParameters};
use keyward_interop::ImportLimits;
use keyward_sync::{ConflictStrategy, RetryConfig, SyncEngineConfig};
use keyward_vault::SessionOptions;

/// Directory name under the platform data directory.
pub const APP_DIR_NAME: &str = "keyward";

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// Which key derivation new vaults use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KdfChoice {
    /// Argon2id.
    #[default]
    Primary,
    /// scrypt, for platforms where Argon2 is unavailable or too slow.
    Fallback,
}

/// Remote storage selection, resolved through the provider registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Registered provider name, e.g. `directory`.
    pub name: String,
    /// Provider-specific options, passed to its factory as data.
    #[serde(default)]
    pub options: Value,
}

/// Sync tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_secs: u64,
    pub conflict_strategy: ConflictStrategy,
    /// Follow-up attempts after a sync ends pending.
    pub pending_retry_attempts: u32,
    /// Base interval between follow-up attempts.
    pub pending_retry_interval_secs: u64,
    /// No provider means sync is disabled.
    pub provider: Option<ProviderConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            request_timeout_secs: 30,
            conflict_strategy: ConflictStrategy::LastWriteWins,
            pending_retry_attempts: 5,
            pending_retry_interval_secs: 60,
            provider: None,
        }
    }
}

impl SyncConfig {
    /// Engine configuration derived from these settings.
    pub fn engine_config(&self) -> SyncEngineConfig {
        SyncEngineConfig {
            retry: RetryConfig::new(self.max_retries)
                .with_initial_delay(Duration::from_millis(self.initial_backoff_ms))
                .with_max_delay(Duration::from_millis(self.max_backoff_ms))
                .with_request_timeout(Duration::from_secs(self.request_timeout_secs)),
            conflict_strategy: self.conflict_strategy,
        }
    }

    /// Interval between scheduled follow-up attempts.
    pub fn pending_retry_interval(&self) -> Duration {
        Duration::from_secs(self.pending_retry_interval_secs)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root for vault files, lockout counters and sync state.
    pub data_dir: PathBuf,
    /// Inactivity window before an unlocked vault locks itself.
    pub session_ttl_secs: u64,
    /// How long a copied secret stays on the clipboard.
    pub clipboard_clear_secs: u64,
    pub kdf_algorithm: KdfChoice,
    /// Argon2id memory cost for new vaults.
    pub kdf_memory_kib: u32,
    /// Argon2id passes, or log2(N) for scrypt.
    pub kdf_time_cost: u32,
    pub kdf_parallelism: u32,
    pub sync: SyncConfig,
    pub import: ImportLimits,
}

impl Default for AppConfig {
    fn default() -> Self {
        let primary = KdfParameters::primary();
        Self {
            data_dir: default_data_dir(),
            session_ttl_secs: 300,
            clipboard_clear_secs: 30,
            kdf_algorithm: KdfChoice::Primary,
            kdf_memory_kib: primary.memory_cost_kib,
            kdf_time_cost: primary.time_cost,
            kdf_parallelism: primary.parallelism,
            sync: SyncConfig::default(),
            import: ImportLimits::default(),
        }
    }
}

impl AppConfig {
    /// Configuration rooted at `data_dir` with every other field defaulted.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load from a JSON file, falling back to defaults when it is absent.
    ///
    /// # Errors
    /// - `Io` if the file exists but cannot be read
    /// - `Validation` if the contents are malformed or fail [`validate`](Self::validate)
    pub async fn load(path: &Path) -> Result<Self> {
        let config = match fs::read_to_string(path).await {
            Ok(json) => serde_json::from_str::<Self>(&json).map_err(|e| {
                Error::Validation(format!("Invalid configuration {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No configuration file; using defaults");
                Self::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Write as pretty JSON, creating parent directories.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).await?;
        Ok(())
    }

    /// Reject settings that would disable a protection or stall sync.
    ///
    /// # Errors
    /// - `Validation` naming the first offending field
    pub fn validate(&self) -> Result<()> {
        if self.session_ttl_secs == 0 {
            return Err(Error::Validation("session_ttl_secs must be greater than zero".to_string()));
        }
        if self.clipboard_clear_secs == 0 {
            return Err(Error::Validation(
                "clipboard_clear_secs must be greater than zero".to_string(),
            ));
        }
        if self.sync.request_timeout_secs == 0 {
            return Err(Error::Validation(
                "sync.request_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.sync.initial_backoff_ms > self.sync.max_backoff_ms {
            return Err(Error::Validation(
                "sync.initial_backoff_ms cannot exceed sync.max_backoff_ms".to_string(),
            ));
        }
        if self.sync.pending_retry_interval_secs == 0 {
            return Err(Error::Validation(
                "sync.pending_retry_interval_secs must be greater than zero".to_string(),
            ));
        }
        self.import.validate()?;
        self.kdf_parameters().map(|_| ())
    }

    /// Recipe for new vaults, with a fresh random salt.
    ///
    /// # Errors
    /// - `Validation` if the configured costs are below the floors
    pub fn kdf_parameters(&self) -> Result<KdfParameters> {
        let algorithm = match self.kdf_algorithm {
            KdfChoice::Primary => KdfAlgorithm::Primary,
            KdfChoice::Fallback => KdfAlgorithm::Fallback,
        };
        KdfParameters::new(
            algorithm,
            self.kdf_memory_kib,
            self.kdf_time_cost,
            self.kdf_parallelism,
        )
    }

    /// Session tuning for vaults opened with this configuration.
    pub fn session_options(&self) -> Result<SessionOptions> {
        Ok(SessionOptions {
            ttl: chrono::Duration::seconds(self.session_ttl_secs as i64),
            migration_kdf: self.kdf_parameters()?,
            ..SessionOptions::default()
        })
    }

    pub fn clipboard_ttl(&self) -> Duration {
        Duration::from_secs(self.clipboard_clear_secs)
    }

    /// Directory holding `.kwv` vault files.
    pub fn vault_dir(&self) -> PathBuf {
        self.data_dir.join("vaults")
    }

    /// Directory holding lockout counters, sync state and staged uploads.
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let config = AppConfig::load(&temp.path().join("absent.json")).await.unwrap();
        assert_eq!(config.session_ttl_secs, 300);
        assert_eq!(config.clipboard_clear_secs, 30);
        assert_eq!(config.kdf_algorithm, KdfChoice::Primary);
        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.sync.initial_backoff_ms, 500);
        assert_eq!(config.sync.max_backoff_ms, 30_000);
        assert_eq!(config.sync.pending_retry_attempts, 5);
        assert!(config.data_dir.ends_with(APP_DIR_NAME));
    }

    #[tokio::test]
    async fn test_partial_file_keeps_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"session_ttl_secs": 60, "sync": {"conflict_strategy": "manual"}}"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.session_ttl_secs, 60);
        assert_eq!(config.sync.conflict_strategy, ConflictStrategy::Manual);
        assert_eq!(config.sync.request_timeout_secs, 30);
        assert_eq!(config.import, ImportLimits::default());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.json");
        let mut config = AppConfig::with_data_dir(temp.path());
        config.sync.provider = Some(ProviderConfig {
            name: "directory".to_string(),
            options: serde_json::json!({ "root": "/tmp/remote" }),
        });
        config.save(&path).await.unwrap();

        assert_eq!(AppConfig::load(&path).await.unwrap(), config);
    }

    #[tokio::test]
    async fn test_malformed_file_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(AppConfig::load(&path).await, Err(Error::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let mut config = AppConfig::default();
        config.session_ttl_secs = 0;
        assert!(matches!(config.validate(), Err(Error::Validation(_))));

        let mut config = AppConfig::default();
        config.clipboard_clear_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_weak_kdf() {
        let mut config = AppConfig::default();
        config.kdf_memory_kib = 1024;
        assert!(matches!(config.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_fallback_recipe() {
        let mut config = AppConfig::default();
        config.kdf_algorithm = KdfChoice::Fallback;
        config.kdf_time_cost = 15;
        config.kdf_parallelism = 1;
        let params = config.kdf_parameters().unwrap();
        assert_eq!(params.algorithm, KdfAlgorithm::Fallback);
        assert_eq!(params.time_cost, 15);
    }

    #[test]
    fn test_engine_config() {
        let config = SyncConfig::default().engine_config();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(500));
        assert_eq!(config.retry.max_delay, Duration::from_secs(30));
        assert_eq!(config.retry.request_timeout, Duration::from_secs(30));
    }
}
