//! Import and export of foreign credential formats for Keyward.
//!
//! This module provides:
//! - KeePass KDBX 3.1 and 4.x import
//! - Bitwarden-compatible JSON import
//! - Delimited text import and plain or spreadsheet-safe CSV export
//! - Structured JSON export with a redacted mode
//! - Passphrase-sealed portable exports
//!
//! # Security Guarantees
//! - Every input is size-checked before parsing
//! - Free text is stripped of control and bidi-override characters
//! - KDBX failures after the signature check are indistinguishable
//! - A malformed record is reported and skipped; the rest of the file imports

pub mod bitwarden;
pub mod delimited;
pub mod json;
pub mod kdbx;
pub mod limits;
pub mod portable;
mod record;
pub mod report;
pub mod sanitize;

pub use bitwarden::import_bitwarden;
pub use delimited::{export_csv, import_csv, CsvFlavor};
pub use json::{entropy_bits, export_json, import_json, ExportMode};
pub use kdbx::import_kdbx;
pub use limits::ImportLimits;
pub use portable::{export_portable, import_portable};
pub use report::{ImportFormat, ImportOutcome, ImportReport, RowError};

use keyward_common::{Error, Result, SensitiveBytes};

/// Guess the format of `input` from its content.
///
/// Binary formats are recognised by magic; JSON documents by their
/// top-level keys. Anything else is treated as delimited text.
pub fn detect_format(input: &[u8]) -> ImportFormat {
    if kdbx::is_kdbx(input) {
        ImportFormat::Kdbx
    } else if portable::is_portable(input) {
        ImportFormat::Portable
    } else if json::looks_like_export(input) {
        ImportFormat::KeywardJson
    } else if bitwarden::looks_like_bitwarden(input) {
        ImportFormat::BitwardenJson
    } else {
        ImportFormat::Csv
    }
}

/// Import `input` as `format`.
///
/// # Errors
/// - `Validation` if an encrypted format is given no passphrase, in
///   addition to the errors of the format's importer
pub fn import(
    input: &[u8],
    format: ImportFormat,
    passphrase: Option<&SensitiveBytes>,
    limits: &ImportLimits,
) -> Result<ImportOutcome> {
    limits.validate()?;
    let require = || {
        passphrase.ok_or_else(|| {
            Error::Validation(format!("A passphrase is required to import {}", format))
        })
    };
    match format {
        ImportFormat::Kdbx => import_kdbx(input, require()?, limits),
        ImportFormat::Portable => import_portable(input, require()?, limits),
        ImportFormat::BitwardenJson => import_bitwarden(input, limits),
        ImportFormat::KeywardJson => import_json(input, limits),
        ImportFormat::Csv => import_csv(input, limits),
    }
}
