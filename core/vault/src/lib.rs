//! Vault engine for Keyward.
//!
//! This module provides:
//! - The credential data model and the decrypted in-memory store
//! - The `.kwv` vault file container with optional duress slot
//! - Session lifecycle with expiry, duress handling and persistent lockout
//! - Self-clearing clipboard copies
//!
//! # Architecture
//! The vault crate sits between the cryptographic primitives and the sync and
//! import layers. Decrypted data only ever lives inside a [`Session`].

pub mod clipboard;
pub mod container;
pub mod lockout;
pub mod manager;
pub mod model;
pub mod session;
pub mod store;

pub use clipboard::{ClipboardBackend, MemoryClipboard, SecureClipboard};
pub use container::{VaultFile, VaultHeader, BODY_CONTEXT, SYNC_CONTEXT};
pub use lockout::{LockoutState, LockoutStore};
pub use manager::VaultManager;
pub use model::{EntryKind, PasswordHistoryItem, VaultEntry, VaultGroup};
pub use session::{AuthGate, DeviceEvent, Session, SessionOptions, SessionStatus};
pub use store::VaultStore;
