//! Import results.

use serde::{Deserialize, Serialize};
use std::fmt;

use keyward_vault::{VaultEntry, VaultGroup};

/// Supported import formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportFormat {
    /// KeePass KDBX 3.1 or 4.x container.
    Kdbx,
    /// Unencrypted Bitwarden-compatible JSON.
    BitwardenJson,
    /// Delimited text with a header row.
    Csv,
    /// Structured JSON written by [`crate::json`].
    KeywardJson,
    /// Passphrase-sealed structured JSON written by [`crate::portable`].
    Portable,
}

impl fmt::Display for ImportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Kdbx => "kdbx",
            Self::BitwardenJson => "bitwarden_json",
            Self::Csv => "csv",
            Self::KeywardJson => "keyward_json",
            Self::Portable => "portable",
        };
        f.write_str(name)
    }
}

/// A record that could not be imported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    /// Line number for delimited text, 1-based item index otherwise.
    pub row: usize,
    pub reason: String,
}

/// Outcome counts for one import call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub format: ImportFormat,
    pub imported: usize,
    pub skipped: usize,
    pub errors: Vec<RowError>,
}

impl ImportReport {
    pub(crate) fn new(format: ImportFormat) -> Self {
        Self {
            format,
            imported: 0,
            skipped: 0,
            errors: Vec::new(),
        }
    }

    pub(crate) fn reject(&mut self, row: usize, reason: impl Into<String>) {
        self.errors.push(RowError {
            row,
            reason: reason.into(),
        });
    }
}

/// Parsed records ready to be merged into a store.
#[derive(Debug)]
pub struct ImportOutcome {
    pub entries: Vec<VaultEntry>,
    pub groups: Vec<VaultGroup>,
    pub report: ImportReport,
}

impl ImportOutcome {
    pub(crate) fn new(entries: Vec<VaultEntry>, groups: Vec<VaultGroup>, mut report: ImportReport) -> Self {
        report.imported = entries.len();
        Self {
            entries,
            groups,
            report,
        }
    }
}
