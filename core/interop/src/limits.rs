//! Resource bounds applied to untrusted import input.

use serde::{Deserialize, Serialize};

use keyward_common::{Error, Result};

/// Default cap on the raw input size (32 MiB).
pub const DEFAULT_MAX_FILE_BYTES: u64 = 32 * 1024 * 1024;

/// Default cap on decompressed KDBX payloads (128 MiB).
pub const DEFAULT_MAX_DECOMPRESSED_BYTES: u64 = 128 * 1024 * 1024;

/// Default cap on a single text field, in characters.
pub const DEFAULT_MAX_FIELD_LEN: usize = 64 * 1024;

/// Default cap on the number of records accepted from one file.
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// Bounds for one import call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportLimits {
    pub max_file_bytes: u64,
    pub max_decompressed_bytes: u64,
    pub max_field_len: usize,
    pub max_entries: usize,
}

impl Default for ImportLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            max_decompressed_bytes: DEFAULT_MAX_DECOMPRESSED_BYTES,
            max_field_len: DEFAULT_MAX_FIELD_LEN,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl ImportLimits {
    /// Reject zero bounds.
    pub fn validate(&self) -> Result<()> {
        if self.max_file_bytes == 0
            || self.max_decompressed_bytes == 0
            || self.max_field_len == 0
            || self.max_entries == 0
        {
            return Err(Error::Validation(
                "Import limits must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Fail before parsing when `input` exceeds the file cap.
    pub fn check_input(&self, input: &[u8]) -> Result<()> {
        if input.len() as u64 > self.max_file_bytes {
            return Err(Error::Validation(format!(
                "Import file is {} bytes; the limit is {}",
                input.len(),
                self.max_file_bytes
            )));
        }
        Ok(())
    }
}
