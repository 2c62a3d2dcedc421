//! Structured JSON export and its re-import.
//!
//! Document shape:
//!
//! ```text
//! { format: "keyward-export", version: 1, mode: "full" | "redacted",
//!   exported_at, entry_count, groups: [...], entries: [...] }
//! ```
//!
//! A redacted document omits passwords, OTP seeds, notes, custom fields and
//! password history. Only full documents can be imported.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::info;
use uuid::Uuid;
use zeroize::Zeroizing;

use keyward_common::{Error, Result};
use keyward_vault::model::PASSWORD_HISTORY_LIMIT;
use keyward_vault::{EntryKind, PasswordHistoryItem, VaultEntry, VaultGroup, VaultStore};

use crate::limits::ImportLimits;
use crate::record::fallback_title;
use crate::report::{ImportFormat, ImportOutcome, ImportReport};
use crate::sanitize;

/// Value of the `format` field.
pub const EXPORT_FORMAT: &str = "keyward-export";

/// Current document version.
pub const EXPORT_VERSION: u32 = 1;

/// Whether secrets are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportMode {
    Full,
    Redacted,
}

#[derive(Serialize)]
struct Document<'a> {
    format: &'static str,
    version: u32,
    mode: ExportMode,
    exported_at: DateTime<Utc>,
    entry_count: usize,
    groups: Vec<&'a VaultGroup>,
    entries: Vec<ExportedEntry<'a>>,
}

#[derive(Serialize)]
struct ExportedEntry<'a> {
    id: Uuid,
    kind: EntryKind,
    title: &'a str,
    username: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
    urls: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    otp_seed: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    custom_fields: Option<&'a BTreeMap<String, String>>,
    tags: &'a [String],
    group_id: Option<Uuid>,
    favorite: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    password_history: Option<&'a [PasswordHistoryItem]>,
    entropy_bits: f64,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

impl<'a> ExportedEntry<'a> {
    fn new(entry: &'a VaultEntry, mode: ExportMode) -> Self {
        let full = mode == ExportMode::Full;
        Self {
            id: entry.id,
            kind: entry.kind,
            title: &entry.title,
            username: &entry.username,
            password: full.then_some(entry.password.as_str()),
            urls: &entry.urls,
            notes: full.then_some(entry.notes.as_str()),
            otp_seed: entry.otp_seed.as_deref().filter(|_| full),
            custom_fields: full.then_some(&entry.custom_fields),
            tags: &entry.tags,
            group_id: entry.group_id,
            favorite: entry.favorite,
            password_history: full.then_some(entry.password_history.as_slice()),
            entropy_bits: entropy_bits(&entry.password),
            created_at: entry.created_at,
            modified_at: entry.modified_at,
        }
    }
}

/// Serialize `store` as a structured JSON document.
pub fn export_json(
    store: &VaultStore,
    mode: ExportMode,
    now: DateTime<Utc>,
) -> Result<Zeroizing<Vec<u8>>> {
    let entries: Vec<ExportedEntry<'_>> = store
        .entries()
        .map(|entry| ExportedEntry::new(entry, mode))
        .collect();
    let document = Document {
        format: EXPORT_FORMAT,
        version: EXPORT_VERSION,
        mode,
        exported_at: now,
        entry_count: entries.len(),
        groups: store.groups().collect(),
        entries,
    };
    let bytes = serde_json::to_vec_pretty(&document)?;
    info!(entries = document.entry_count, ?mode, "Exported JSON document");
    Ok(Zeroizing::new(bytes))
}

/// Estimated password strength in bits: length times log2 of the
/// character pools in use, rounded to two decimals.
pub fn entropy_bits(password: &str) -> f64 {
    let (mut lower, mut upper, mut digit, mut symbol, mut other) = (false, false, false, false, false);
    let mut length = 0usize;
    for c in password.chars() {
        length += 1;
        match c {
            'a'..='z' => lower = true,
            'A'..='Z' => upper = true,
            '0'..='9' => digit = true,
            c if c.is_ascii() => symbol = true,
            _ => other = true,
        }
    }
    let pool: u32 = [(lower, 26), (upper, 26), (digit, 10), (symbol, 33), (other, 100)]
        .iter()
        .filter(|(used, _)| *used)
        .map(|(_, size)| size)
        .sum();
    if pool == 0 {
        return 0.0;
    }
    let bits = length as f64 * f64::from(pool).log2();
    (bits * 100.0).round() / 100.0
}

/// Whether `input` looks like a document written by [`export_json`].
pub fn looks_like_export(input: &[u8]) -> bool {
    serde_json::from_slice::<Header>(input)
        .map(|h| h.format == EXPORT_FORMAT)
        .unwrap_or(false)
}

#[derive(Deserialize)]
struct Header {
    format: String,
}

#[derive(Deserialize)]
struct ImportDocument {
    format: String,
    version: u32,
    mode: ExportMode,
    #[serde(default)]
    groups: Vec<ImportedGroup>,
    #[serde(default)]
    entries: Vec<Value>,
}

#[derive(Deserialize)]
struct ImportedGroup {
    id: Uuid,
    name: String,
    #[serde(default)]
    parent_id: Option<Uuid>,
    #[serde(default)]
    color: Option<String>,
}

#[derive(Deserialize)]
struct ImportedEntry {
    id: Uuid,
    kind: EntryKind,
    #[serde(default)]
    title: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    urls: Vec<String>,
    #[serde(default)]
    notes: String,
    #[serde(default)]
    otp_seed: Option<String>,
    #[serde(default)]
    custom_fields: BTreeMap<String, String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    group_id: Option<Uuid>,
    #[serde(default)]
    favorite: bool,
    #[serde(default)]
    password_history: Vec<PasswordHistoryItem>,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

/// Import a full document written by [`export_json`].
///
/// # Errors
/// - `Validation` for an oversized input, foreign format, unknown version or
///   a redacted document
/// - `Corruption` if the document is not valid JSON
pub fn import_json(input: &[u8], limits: &ImportLimits) -> Result<ImportOutcome> {
    import_document(input, limits, ImportFormat::KeywardJson)
}

pub(crate) fn import_document(
    input: &[u8],
    limits: &ImportLimits,
    format: ImportFormat,
) -> Result<ImportOutcome> {
    limits.check_input(input)?;
    let document: ImportDocument = serde_json::from_slice(input)
        .map_err(|e| Error::Corruption(format!("Malformed export document: {}", e)))?;
    if document.format != EXPORT_FORMAT {
        return Err(Error::Validation(format!(
            "Unrecognised export format '{}'",
            document.format
        )));
    }
    if document.version != EXPORT_VERSION {
        return Err(Error::Validation(format!(
            "Unsupported export version {}",
            document.version
        )));
    }
    if document.mode != ExportMode::Full {
        return Err(Error::Validation(
            "Redacted exports contain no secrets and cannot be imported".to_string(),
        ));
    }

    let max = limits.max_field_len;
    let groups: Vec<VaultGroup> = document
        .groups
        .into_iter()
        .filter_map(|g| {
            let name = sanitize::single_line(&g.name, max);
            (!name.is_empty()).then(|| VaultGroup {
                id: g.id,
                name,
                parent_id: g.parent_id,
                color: g.color.map(|c| sanitize::single_line(&c, max)),
            })
        })
        .collect();

    let mut report = ImportReport::new(format);
    let mut entries = Vec::new();
    for (index, raw) in document.entries.into_iter().enumerate() {
        let row = index + 1;
        if entries.len() >= limits.max_entries {
            report.reject(row, "entry limit reached");
            break;
        }
        match serde_json::from_value::<ImportedEntry>(raw) {
            Ok(imported) => match convert(imported, max) {
                Some(entry) => entries.push(entry),
                None => report.reject(row, "entry has no title, URL or username"),
            },
            Err(e) => report.reject(row, format!("malformed entry: {}", e)),
        }
    }

    let outcome = ImportOutcome::new(entries, groups, report);
    info!(
        %format,
        imported = outcome.report.imported,
        errors = outcome.report.errors.len(),
        "Export document imported"
    );
    Ok(outcome)
}

fn convert(imported: ImportedEntry, max: usize) -> Option<VaultEntry> {
    let username = sanitize::single_line(&imported.username, max);
    let urls: Vec<String> = imported
        .urls
        .iter()
        .map(|u| sanitize::single_line(u, max))
        .filter(|u| !u.is_empty())
        .collect();
    let mut title = sanitize::single_line(&imported.title, max);
    if title.is_empty() {
        title = fallback_title(&urls, &username)?;
    }

    let mut entry = VaultEntry::new(imported.kind, title);
    entry.id = imported.id;
    entry.username = username;
    entry.password = sanitize::secret(&imported.password, max);
    entry.urls = urls;
    entry.notes = sanitize::multi_line(&imported.notes, max);
    entry.otp_seed = imported
        .otp_seed
        .as_deref()
        .map(|s| sanitize::secret(s, max))
        .filter(|s| !s.is_empty());
    for (name, value) in &imported.custom_fields {
        let name = sanitize::single_line(name, max);
        if !name.is_empty() {
            entry.custom_fields.insert(name, sanitize::secret(value, max));
        }
    }
    entry.tags = imported
        .tags
        .iter()
        .map(|t| sanitize::single_line(t, max))
        .filter(|t| !t.is_empty())
        .collect();
    entry.group_id = imported.group_id;
    entry.favorite = imported.favorite;
    entry.password_history = imported
        .password_history
        .iter()
        .take(PASSWORD_HISTORY_LIMIT)
        .map(|item| PasswordHistoryItem {
            password: sanitize::secret(&item.password, max),
            retired_at: item.retired_at,
        })
        .collect();
    entry.created_at = imported.created_at;
    entry.modified_at = imported.modified_at;
    Some(entry)
}
