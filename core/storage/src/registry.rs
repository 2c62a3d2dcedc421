//! Static provider registry.
//!
//! Providers are registered as plain `fn` factories together with the
//! capabilities they declare. Configuration reaches a factory as data only;
//! a request that needs a capability the provider did not declare is
//! refused before the factory runs.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::local::DirectoryProvider;
use crate::memory::MemoryProvider;
use crate::provider::SyncProvider;
use keyward_common::{Error, Result};

/// Factory building a provider from its configuration.
pub type ProviderFactory = fn(&Value) -> Result<Arc<dyn SyncProvider>>;

/// What a provider may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Capability {
    /// Data survives process restarts.
    Persistent,
    /// Data leaves this machine (directly or via a mirroring tool).
    Remote,
    /// Intended for tests only.
    Ephemeral,
}

/// A registered provider.
#[derive(Clone, Copy)]
pub struct ProviderDescriptor {
    pub name: &'static str,
    pub capabilities: &'static [Capability],
    pub factory: ProviderFactory,
}

impl std::fmt::Debug for ProviderDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderDescriptor")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl ProviderDescriptor {
    /// Whether the provider declared `capability`.
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Registry of provider descriptors keyed by name.
pub struct ProviderRegistry {
    descriptors: BTreeMap<&'static str, ProviderDescriptor>,
}

impl ProviderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            descriptors: BTreeMap::new(),
        }
    }

    /// Registry with the providers built into this crate.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for descriptor in BUILTIN {
            registry.descriptors.insert(descriptor.name, *descriptor);
        }
        registry
    }

    /// Register a provider.
    ///
    /// # Errors
    /// - `Validation` if the name is already registered
    pub fn register(&mut self, descriptor: ProviderDescriptor) -> Result<()> {
        if self.descriptors.contains_key(descriptor.name) {
            return Err(Error::Validation(format!(
                "Provider '{}' is already registered",
                descriptor.name
            )));
        }
        self.descriptors.insert(descriptor.name, descriptor);
        Ok(())
    }

    /// Build a provider by name.
    ///
    /// # Preconditions
    /// - Provider must be registered with every capability in `required`
    ///
    /// # Errors
    /// - `NotFound` if no provider has that name
    /// - `Validation` if a required capability is missing or the
    ///   configuration is rejected by the factory
    pub fn resolve(
        &self,
        name: &str,
        config: &Value,
        required: &[Capability],
    ) -> Result<Arc<dyn SyncProvider>> {
        let descriptor = self
            .descriptors
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Provider '{}' is not registered", name)))?;

        if let Some(missing) = required.iter().find(|c| !descriptor.has(**c)) {
            return Err(Error::Validation(format!(
                "Provider '{}' does not support {:?}",
                name, missing
            )));
        }

        (descriptor.factory)(config)
    }

    /// Registered descriptor by name.
    pub fn descriptor(&self, name: &str) -> Option<&ProviderDescriptor> {
        self.descriptors.get(name)
    }

    /// Names of registered providers, sorted.
    pub fn providers(&self) -> Vec<&'static str> {
        self.descriptors.keys().copied().collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

const BUILTIN: &[ProviderDescriptor] = &[
    ProviderDescriptor {
        name: "memory",
        capabilities: &[Capability::Ephemeral],
        factory: memory_factory,
    },
    ProviderDescriptor {
        name: "directory",
        capabilities: &[Capability::Persistent, Capability::Remote],
        factory: directory_factory,
    },
];

fn memory_factory(_config: &Value) -> Result<Arc<dyn SyncProvider>> {
    Ok(Arc::new(MemoryProvider::new()))
}

fn directory_factory(config: &Value) -> Result<Arc<dyn SyncProvider>> {
    let root = config
        .get("root")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Validation("Directory provider requires 'root'".to_string()))?;
    let name = config
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("vault");
    Ok(Arc::new(DirectoryProvider::new(root, name)?))
}
