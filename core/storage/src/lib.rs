//! Remote storage contract for Keyward sync.
//!
//! Providers store one opaque, already-encrypted blob per vault and report
//! a [`SyncVersion`] for it. They never see plaintext or keys.

pub mod local;
pub mod memory;
pub mod provider;
pub mod registry;

pub use local::DirectoryProvider;
pub use memory::MemoryProvider;
pub use provider::{SyncProvider, SyncVersion};
pub use registry::{Capability, ProviderDescriptor, ProviderRegistry};
