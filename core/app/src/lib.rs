//! Keyward application layer.
//!
//! Wires the engine crates into one facade for presentation code:
//! - [`AppConfig`]: JSON configuration with defaults for every field
//! - [`AppContext`]: clock, clipboard and sync provider, injected explicitly
//! - [`VaultService`]: vault lifecycle, entries, clipboard, sync, import and
//!   export, all keyed by vault id
//! - [`init_tracing`]: subscriber setup for binaries embedding the engine

pub mod config;
pub mod context;
pub mod service;
pub mod telemetry;

pub use config::{AppConfig, KdfChoice, ProviderConfig, SyncConfig};
pub use context::AppContext;
pub use service::{EntrySummary, ExportFormat, SecretField, VaultService, VaultSummary};
pub use telemetry::init_tracing;
