//! Unencrypted Bitwarden-compatible JSON import.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use keyward_common::{Error, Result};
use keyward_vault::{EntryKind, VaultEntry};

use crate::limits::ImportLimits;
use crate::record::{fallback_title, FolderIndex};
use crate::report::{ImportFormat, ImportOutcome, ImportReport};
use crate::sanitize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Export {
    #[serde(default)]
    encrypted: bool,
    #[serde(default)]
    folders: Vec<Folder>,
    #[serde(default)]
    items: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct Folder {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Item {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    folder_id: Option<String>,
    #[serde(default)]
    favorite: bool,
    #[serde(default)]
    login: Option<Login>,
    #[serde(default)]
    card: Option<Card>,
    #[serde(default)]
    identity: Option<Identity>,
    #[serde(default)]
    fields: Vec<Field>,
    #[serde(default)]
    creation_date: Option<String>,
    #[serde(default)]
    revision_date: Option<String>,
}

#[derive(Default, Deserialize)]
struct Login {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    totp: Option<String>,
    #[serde(default)]
    uris: Vec<LoginUri>,
}

#[derive(Deserialize)]
struct LoginUri {
    #[serde(default)]
    uri: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Card {
    #[serde(default)]
    cardholder_name: Option<String>,
    #[serde(default)]
    brand: Option<String>,
    #[serde(default)]
    number: Option<String>,
    #[serde(default)]
    exp_month: Option<String>,
    #[serde(default)]
    exp_year: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Identity {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    middle_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    company: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    address1: Option<String>,
    #[serde(default)]
    address2: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    postal_code: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    ssn: Option<String>,
    #[serde(default)]
    passport_number: Option<String>,
    #[serde(default)]
    license_number: Option<String>,
}

#[derive(Deserialize)]
struct Field {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    value: Option<String>,
    /// 0 text, 1 hidden, 2 boolean, 3 linked.
    #[serde(rename = "type", default)]
    kind: u8,
}

/// Whether `input` looks like a Bitwarden JSON export.
pub fn looks_like_bitwarden(input: &[u8]) -> bool {
    serde_json::from_slice::<Value>(input)
        .ok()
        .and_then(|v| v.as_object().map(|o| o.contains_key("items") && !o.contains_key("format")))
        .unwrap_or(false)
}

/// Import an unencrypted Bitwarden-compatible JSON export.
///
/// # Errors
/// - `Validation` if the input is too large, encrypted, or lacks `items`
/// - `Corruption` if the document is not valid JSON
pub fn import_bitwarden(input: &[u8], limits: &ImportLimits) -> Result<ImportOutcome> {
    limits.check_input(input)?;
    let export: Export = serde_json::from_slice(input)
        .map_err(|e| Error::Corruption(format!("Malformed JSON export: {}", e)))?;
    if export.encrypted {
        return Err(Error::Validation(
            "Encrypted JSON exports are not supported; export unencrypted instead".to_string(),
        ));
    }
    let items = export
        .items
        .ok_or_else(|| Error::Validation("JSON export has no items".to_string()))?;

    let max = limits.max_field_len;
    let mut folders = FolderIndex::default();
    for folder in &export.folders {
        let name = sanitize::single_line(&folder.name, max);
        if !name.is_empty() {
            folders.ensure(&folder.id, &name);
        }
    }

    let mut report = ImportReport::new(ImportFormat::BitwardenJson);
    let mut entries = Vec::new();
    for (index, raw) in items.into_iter().enumerate() {
        let row = index + 1;
        if entries.len() >= limits.max_entries {
            report.reject(row, "entry limit reached");
            break;
        }
        let item: Item = match serde_json::from_value(raw) {
            Ok(item) => item,
            Err(e) => {
                report.reject(row, format!("malformed item: {}", e));
                continue;
            }
        };
        match convert(item, limits, &folders) {
            Ok(entry) => entries.push(entry),
            Err(reason) => report.reject(row, reason),
        }
    }

    let outcome = ImportOutcome::new(entries, folders.into_groups(), report);
    info!(
        imported = outcome.report.imported,
        errors = outcome.report.errors.len(),
        "JSON import finished"
    );
    Ok(outcome)
}

fn text(value: &Option<String>, max: usize) -> String {
    sanitize::single_line(value.as_deref().unwrap_or_default(), max)
}

fn secret(value: &Option<String>, max: usize) -> String {
    sanitize::secret(value.as_deref().unwrap_or_default(), max)
}

fn parse_date(value: &Option<String>) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.as_deref()?)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn convert(
    item: Item,
    limits: &ImportLimits,
    folders: &FolderIndex,
) -> std::result::Result<VaultEntry, String> {
    let max = limits.max_field_len;
    let kind = match item.kind {
        1 => EntryKind::Login,
        2 => EntryKind::Note,
        3 => EntryKind::Card,
        4 => EntryKind::Identity,
        other => return Err(format!("unsupported item type {}", other)),
    };

    let login = item.login.unwrap_or_default();
    let username = text(&login.username, max);
    let urls: Vec<String> = login
        .uris
        .iter()
        .map(|u| text(&u.uri, max))
        .filter(|u| !u.is_empty())
        .collect();

    let mut title = text(&item.name, max);
    if title.is_empty() {
        title = fallback_title(&urls, &username).ok_or_else(|| "item has no name".to_string())?;
    }

    let mut entry = VaultEntry::new(kind, title);
    entry.username = username;
    entry.password = secret(&login.password, max);
    entry.urls = urls;
    entry.notes = sanitize::multi_line(item.notes.as_deref().unwrap_or_default(), max);
    entry.favorite = item.favorite;
    entry.group_id = item.folder_id.as_deref().and_then(|id| folders.get(id));

    let totp = secret(&login.totp, max);
    if !totp.is_empty() {
        entry.otp_seed = Some(totp);
    }

    if let Some(card) = &item.card {
        let expiry = match (text(&card.exp_month, max), text(&card.exp_year, max)) {
            (month, year) if !month.is_empty() && !year.is_empty() => format!("{}/{}", month, year),
            (month, year) => format!("{}{}", month, year),
        };
        for (name, value) in [
            ("cardholder", text(&card.cardholder_name, max)),
            ("brand", text(&card.brand, max)),
            ("number", secret(&card.number, max)),
            ("expiry", expiry),
            ("code", secret(&card.code, max)),
        ] {
            if !value.is_empty() {
                entry.custom_fields.insert(name.to_string(), value);
            }
        }
    }

    if let Some(identity) = &item.identity {
        for (name, value) in [
            ("title", text(&identity.title, max)),
            ("first_name", text(&identity.first_name, max)),
            ("middle_name", text(&identity.middle_name, max)),
            ("last_name", text(&identity.last_name, max)),
            ("username", text(&identity.username, max)),
            ("company", text(&identity.company, max)),
            ("email", text(&identity.email, max)),
            ("phone", text(&identity.phone, max)),
            ("address1", text(&identity.address1, max)),
            ("address2", text(&identity.address2, max)),
            ("city", text(&identity.city, max)),
            ("state", text(&identity.state, max)),
            ("postal_code", text(&identity.postal_code, max)),
            ("country", text(&identity.country, max)),
            ("ssn", secret(&identity.ssn, max)),
            ("passport_number", secret(&identity.passport_number, max)),
            ("license_number", secret(&identity.license_number, max)),
        ] {
            if !value.is_empty() {
                entry.custom_fields.insert(name.to_string(), value);
            }
        }
    }

    for (index, field) in item.fields.iter().enumerate() {
        let mut name = text(&field.name, max);
        if name.is_empty() {
            name = format!("field {}", index + 1);
        }
        let value = if field.kind == 1 {
            secret(&field.value, max)
        } else {
            sanitize::multi_line(field.value.as_deref().unwrap_or_default(), max)
        };
        let mut key = name.clone();
        let mut suffix = 2;
        while entry.custom_fields.contains_key(&key) {
            key = format!("{} ({})", name, suffix);
            suffix += 1;
        }
        entry.custom_fields.insert(key, value);
    }

    if let Some(created) = parse_date(&item.creation_date) {
        entry.created_at = created;
    }
    entry.modified_at = parse_date(&item.revision_date).unwrap_or(entry.created_at);
    Ok(entry)
}
