//! Common types used throughout Keyward.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use zeroize::Zeroize;

/// Unique identifier for a vault.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VaultId(String);

impl VaultId {
    /// Create a new VaultId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty or contains path separators
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::Validation(
                "VaultId cannot be empty".to_string(),
            ));
        }
        if id.contains('/') || id.contains('\\') {
            return Err(crate::Error::Validation(
                "VaultId cannot contain separators".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Generate a random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VaultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sensitive data wrapper that zeroizes on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SensitiveBytes(Vec<u8>);

impl SensitiveBytes {
    /// Create new sensitive bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Copy a passphrase string into a zeroizing buffer.
    pub fn from_passphrase(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }

    /// Get a reference to the inner bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Get the length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBytes([REDACTED; {} bytes])", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vault_id_creation() {
        let id = VaultId::new("personal").unwrap();
        assert_eq!(id.as_str(), "personal");
    }

    #[test]
    fn test_vault_id_empty_fails() {
        assert!(VaultId::new("").is_err());
        assert!(VaultId::new("   ").is_err());
    }

    #[test]
    fn test_vault_id_separator_fails() {
        assert!(VaultId::new("a/b").is_err());
    }

    #[test]
    fn test_generated_ids_differ() {
        assert_ne!(VaultId::generate(), VaultId::generate());
    }

    #[test]
    fn test_sensitive_bytes_debug_redacts() {
        let secret = SensitiveBytes::from_passphrase("hunter2");
        let rendered = format!("{:?}", secret);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("7 bytes"));
    }

    proptest::proptest! {
        #[test]
        fn prop_vault_id_accepts_plain_names(name in "[a-z0-9][a-z0-9._-]{0,31}") {
            let id = VaultId::new(name.clone()).unwrap();
            proptest::prop_assert_eq!(id.as_str(), name.as_str());
        }

        #[test]
        fn prop_vault_id_rejects_separators(head in "[a-z]{1,8}", tail in "[a-z]{1,8}") {
            let slash = format!("{}/{}", head, tail);
            let backslash = format!("{}\\{}", head, tail);
            proptest::prop_assert!(VaultId::new(slash).is_err());
            proptest::prop_assert!(VaultId::new(backslash).is_err());
        }
    }
}
