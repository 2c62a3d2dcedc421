//! Delimited text import and CSV export.
//!
//! Import reads a header row, guesses which column holds which field from
//! common header names, and then takes every following row on its own. A
//! malformed row is reported and skipped; it never aborts the import.

use csv::{ByteRecord, ReaderBuilder, Terminator, WriterBuilder};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use keyward_common::{Error, Result};
use keyward_vault::{EntryKind, VaultEntry, VaultStore};

use crate::limits::ImportLimits;
use crate::record::{fallback_title, split_tags, split_urls, FolderIndex};
use crate::report::{ImportFormat, ImportOutcome, ImportReport};
use crate::sanitize;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Indexes into [`EXPORT_HEADER`] that hold secrets.
const SECRET_COLUMNS: [usize; 2] = [2, 5];

/// Column order of exported files.
pub const EXPORT_HEADER: [&str; 8] = [
    "title", "username", "password", "url", "notes", "totp", "folder", "tags",
];

/// Entry field a column maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Column {
    Title,
    Username,
    Password,
    Url,
    Notes,
    Totp,
    Folder,
    Tags,
}

impl Column {
    fn from_header(name: &str) -> Option<Self> {
        let normalized: String = name
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect();
        let column = match normalized.as_str() {
            "title" | "name" | "account" | "site" | "entry" | "itemname" | "service" => Self::Title,
            "username" | "user" | "login" | "loginusername" | "email" | "emailaddress" => {
                Self::Username
            }
            "password" | "pass" | "pwd" | "loginpassword" | "secret" => Self::Password,
            "url" | "uri" | "urls" | "website" | "webaddress" | "loginuri" | "address" => Self::Url,
            "notes" | "note" | "comment" | "comments" | "extra" => Self::Notes,
            "totp" | "otp" | "logintotp" | "otpauth" | "2fa" | "onetimepassword" => Self::Totp,
            "folder" | "group" | "category" | "grouping" | "path" => Self::Folder,
            "tags" | "tag" | "labels" => Self::Tags,
            _ => return None,
        };
        Some(column)
    }
}

/// Pick the delimiter occurring most often outside quotes on the first line.
fn detect_delimiter(input: &[u8]) -> u8 {
    let mut counts = [(b',', 0usize), (b';', 0), (b'\t', 0)];
    let mut quoted = false;
    for &byte in input {
        match byte {
            b'"' => quoted = !quoted,
            b'\n' | b'\r' if !quoted => break,
            _ if quoted => {}
            _ => {
                for (delimiter, count) in counts.iter_mut() {
                    if byte == *delimiter {
                        *count += 1;
                    }
                }
            }
        }
    }
    // Earlier candidates win ties, so ',' is the default.
    counts
        .iter()
        .fold((b',', 0), |best, &(d, n)| if n > best.1 { (d, n) } else { best })
        .0
}

/// Import delimited text with a header row.
///
/// # Errors
/// - `Validation` if the input is too large, has no header row, or no header
///   names a known field
pub fn import_csv(input: &[u8], limits: &ImportLimits) -> Result<ImportOutcome> {
    limits.check_input(input)?;
    let input = input.strip_prefix(UTF8_BOM).unwrap_or(input);
    let delimiter = detect_delimiter(input);

    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(input);

    let mut header = ByteRecord::new();
    if !reader.read_byte_record(&mut header).map_err(csv_error)? {
        return Err(Error::Validation("CSV input has no header row".to_string()));
    }
    let mut columns: HashMap<Column, usize> = HashMap::new();
    for (index, name) in header.iter().enumerate() {
        if let Some(column) = Column::from_header(&String::from_utf8_lossy(name)) {
            columns.entry(column).or_insert(index);
        }
    }
    if !columns.contains_key(&Column::Title)
        && !columns.contains_key(&Column::Username)
        && !columns.contains_key(&Column::Password)
        && !columns.contains_key(&Column::Url)
    {
        return Err(Error::Validation(
            "CSV header names no title, username, password or URL column".to_string(),
        ));
    }
    debug!(delimiter = %(delimiter as char).escape_default(), columns = columns.len(), "CSV header recognised");

    let mut report = ImportReport::new(ImportFormat::Csv);
    let mut folders = FolderIndex::default();
    let mut entries: Vec<VaultEntry> = Vec::new();
    let mut record = ByteRecord::new();

    loop {
        let row = reader.position().line() as usize;
        match reader.read_byte_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {}
            Err(e) => {
                report.reject(row, format!("unreadable row: {}", e));
                continue;
            }
        }
        let row = record.position().map_or(row, |p| p.line() as usize);

        if record.iter().all(|field| field.iter().all(u8::is_ascii_whitespace)) {
            report.skipped += 1;
            continue;
        }
        if record.len() != header.len() {
            report.reject(
                row,
                format!("expected {} fields, found {}", header.len(), record.len()),
            );
            continue;
        }
        if entries.len() >= limits.max_entries {
            report.reject(row, "entry limit reached");
            break;
        }
        match parse_row(&record, &columns, limits, &mut folders) {
            Ok(entry) => entries.push(entry),
            Err(reason) => report.reject(row, reason),
        }
    }

    let outcome = ImportOutcome::new(entries, folders.into_groups(), report);
    info!(
        imported = outcome.report.imported,
        skipped = outcome.report.skipped,
        errors = outcome.report.errors.len(),
        "CSV import finished"
    );
    Ok(outcome)
}

fn parse_row(
    record: &ByteRecord,
    columns: &HashMap<Column, usize>,
    limits: &ImportLimits,
    folders: &mut FolderIndex,
) -> std::result::Result<VaultEntry, String> {
    let mut cells: HashMap<Column, &str> = HashMap::new();
    for (column, index) in columns {
        let raw = record.get(*index).unwrap_or_default();
        let text = std::str::from_utf8(raw).map_err(|_| "row is not valid UTF-8".to_string())?;
        cells.insert(*column, text);
    }
    let cell = |column: Column| cells.get(&column).copied().unwrap_or_default();
    let max = limits.max_field_len;

    let username = sanitize::single_line(cell(Column::Username), max);
    let password = sanitize::secret(cell(Column::Password), max);
    let urls = split_urls(cell(Column::Url), limits);
    let mut title = sanitize::single_line(cell(Column::Title), max);
    if title.is_empty() {
        title = fallback_title(&urls, &username)
            .ok_or_else(|| "row has no title, URL or username".to_string())?;
    }

    let kind = if username.is_empty() && password.is_empty() && urls.is_empty() {
        EntryKind::Note
    } else {
        EntryKind::Login
    };
    let mut entry = VaultEntry::new(kind, title);
    entry.username = username;
    entry.password = password;
    entry.urls = urls;
    entry.notes = sanitize::multi_line(cell(Column::Notes), max);
    entry.tags = split_tags(cell(Column::Tags), limits);

    let otp = sanitize::secret(cell(Column::Totp).trim(), max);
    if !otp.is_empty() {
        entry.otp_seed = Some(otp);
    }
    let folder = sanitize::single_line(cell(Column::Folder), max);
    if !folder.is_empty() {
        entry.group_id = Some(folders.ensure(&folder, &folder));
    }
    Ok(entry)
}

fn csv_error(e: csv::Error) -> Error {
    Error::Serialization(format!("CSV error: {}", e))
}

/// CSV dialect for export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsvFlavor {
    /// LF line endings, cells written as-is.
    Plain,
    /// UTF-8 BOM, CRLF line endings, formula-like cells neutralised.
    /// Password and TOTP cells are written as-is so they re-import intact.
    Spreadsheet,
}

/// Prefix cells a spreadsheet would evaluate as a formula.
fn neutralise(cell: &str) -> String {
    match cell.chars().next() {
        Some('=' | '+' | '-' | '@' | '\t' | '\r') => format!("'{}", cell),
        _ => cell.to_string(),
    }
}

/// Export every entry of `store` as CSV with [`EXPORT_HEADER`] columns.
pub fn export_csv(store: &VaultStore, flavor: CsvFlavor) -> Result<Vec<u8>> {
    let terminator = match flavor {
        CsvFlavor::Plain => Terminator::Any(b'\n'),
        CsvFlavor::Spreadsheet => Terminator::CRLF,
    };
    let mut out = Vec::new();
    if flavor == CsvFlavor::Spreadsheet {
        out.extend_from_slice(UTF8_BOM);
    }
    let mut writer = WriterBuilder::new().terminator(terminator).from_writer(out);
    writer.write_record(EXPORT_HEADER).map_err(csv_error)?;

    let folder_names: HashMap<Uuid, &str> =
        store.groups().map(|g| (g.id, g.name.as_str())).collect();

    for entry in store.entries() {
        let folder = entry
            .group_id
            .and_then(|id| folder_names.get(&id).copied())
            .unwrap_or_default();
        let cells = [
            entry.title.clone(),
            entry.username.clone(),
            entry.password.clone(),
            entry.urls.join(" "),
            entry.notes.clone(),
            entry.otp_seed.clone().unwrap_or_default(),
            folder.to_string(),
            entry.tags.join(","),
        ];
        let record: Vec<String> = match flavor {
            CsvFlavor::Plain => cells.to_vec(),
            CsvFlavor::Spreadsheet => cells
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    if SECRET_COLUMNS.contains(&i) {
                        c.clone()
                    } else {
                        neutralise(c)
                    }
                })
                .collect(),
        };
        writer.write_record(&record).map_err(csv_error)?;
    }

    let out = writer
        .into_inner()
        .map_err(|e| Error::Serialization(format!("CSV error: {}", e)))?;
    info!(entries = store.len(), ?flavor, "CSV export written");
    Ok(out)
}
