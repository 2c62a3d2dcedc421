//! Mapping of the decrypted KeePass tree onto vault entries and folders.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use keyward_vault::model::PASSWORD_HISTORY_LIMIT;
use keyward_vault::{EntryKind, PasswordHistoryItem, VaultEntry, VaultGroup};

use crate::limits::ImportLimits;
use crate::record::fallback_title;
use crate::report::{ImportFormat, ImportOutcome, ImportReport};
use crate::sanitize;

use super::xml::Node;

/// Seconds from 0001-01-01T00:00:00Z to the Unix epoch.
const KDBX_EPOCH_OFFSET: i64 = 62_135_596_800;

/// String keys mapped onto dedicated entry fields.
const STANDARD_KEYS: [&str; 5] = ["Title", "UserName", "Password", "URL", "Notes"];

/// String keys holding an OTP seed or `otpauth://` URI.
const OTP_KEYS: [&str; 2] = ["otp", "TOTP Seed"];

pub(crate) fn to_outcome(document: &Node, limits: &ImportLimits) -> ImportOutcome {
    let mut collector = Collector {
        limits,
        recycle_bin: recycle_bin_id(document),
        entries: Vec::new(),
        groups: Vec::new(),
        report: ImportReport::new(ImportFormat::Kdbx),
        row: 0,
    };

    if let Some(root) = document.child("Root").and_then(|r| r.child("Group")) {
        collector.walk(root, None);
    }

    ImportOutcome::new(collector.entries, collector.groups, collector.report)
}

fn recycle_bin_id(document: &Node) -> Option<Uuid> {
    let meta = document.child("Meta")?;
    if meta
        .child_text("RecycleBinEnabled")
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("false"))
    {
        return None;
    }
    parse_uuid(meta.child_text("RecycleBinUUID")?).filter(|id| !id.is_nil())
}

fn parse_uuid(text: &str) -> Option<Uuid> {
    let bytes = BASE64.decode(text.trim()).ok()?;
    Uuid::from_slice(&bytes).ok()
}

/// Parse a KDBX timestamp: ISO 8601 in 3.x, base64 seconds since year 1
/// in 4.x.
fn parse_time(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    let bytes: [u8; 8] = BASE64.decode(text).ok()?.try_into().ok()?;
    let seconds = i64::from_le_bytes(bytes).checked_sub(KDBX_EPOCH_OFFSET)?;
    DateTime::from_timestamp(seconds, 0)
}

fn count_entries(group: &Node) -> usize {
    group.children_named("Entry").count()
        + group
            .children_named("Group")
            .map(count_entries)
            .sum::<usize>()
}

struct Collector<'a> {
    limits: &'a ImportLimits,
    recycle_bin: Option<Uuid>,
    entries: Vec<VaultEntry>,
    groups: Vec<VaultGroup>,
    report: ImportReport,
    row: usize,
}

impl Collector<'_> {
    /// Import the entries of `group`, then recurse into its subgroups.
    /// `folder` is `None` for the database root.
    fn walk(&mut self, group: &Node, folder: Option<Uuid>) {
        for entry in group.children_named("Entry") {
            self.row += 1;
            self.entry(entry, folder);
        }

        for child in group.children_named("Group") {
            let id = child
                .child_text("UUID")
                .and_then(parse_uuid)
                .unwrap_or_else(Uuid::new_v4);
            if Some(id) == self.recycle_bin {
                let skipped = count_entries(child);
                debug!(skipped, "Skipping recycle bin");
                self.row += skipped;
                self.report.skipped += skipped;
                continue;
            }

            let mut name =
                sanitize::single_line(child.child_text("Name").unwrap_or_default(), self.limits.max_field_len);
            if name.is_empty() {
                name = "Untitled folder".to_string();
            }
            let mut vault_group = match folder {
                Some(parent) => VaultGroup::child_of(name, parent),
                None => VaultGroup::new(name),
            };
            vault_group.id = id;
            self.groups.push(vault_group);
            self.walk(child, Some(id));
        }
    }

    fn entry(&mut self, node: &Node, folder: Option<Uuid>) {
        if self.entries.len() >= self.limits.max_entries {
            self.report.reject(self.row, "entry limit reached");
            return;
        }
        let Some(id) = node.child_text("UUID").and_then(parse_uuid) else {
            self.report.reject(self.row, "entry has no valid UUID");
            return;
        };

        let max = self.limits.max_field_len;
        let strings: Vec<(&str, &Node)> = node
            .children_named("String")
            .filter_map(|s| Some((s.child_text("Key")?, s.child("Value")?)))
            .collect();
        let field = |key: &str| {
            strings
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.text())
                .unwrap_or_default()
        };

        let title = sanitize::single_line(field("Title"), max);
        let username = sanitize::single_line(field("UserName"), max);
        let password = sanitize::secret(field("Password"), max);
        let urls: Vec<String> = Some(sanitize::single_line(field("URL"), max))
            .filter(|u| !u.is_empty())
            .into_iter()
            .collect();
        let notes = sanitize::multi_line(field("Notes"), max);

        if title.is_empty() && username.is_empty() && password.is_empty() && urls.is_empty() && notes.is_empty() {
            self.report.skipped += 1;
            return;
        }
        let title = if title.is_empty() {
            fallback_title(&urls, &username).unwrap_or_else(|| "Untitled".to_string())
        } else {
            title
        };
        let kind = if username.is_empty() && password.is_empty() && urls.is_empty() {
            EntryKind::Note
        } else {
            EntryKind::Login
        };

        let mut entry = VaultEntry::new(kind, title);
        entry.id = id;
        entry.username = username;
        entry.password = password;
        entry.urls = urls;
        entry.notes = notes;
        entry.group_id = folder;

        for (key, value) in &strings {
            if STANDARD_KEYS.contains(key) {
                continue;
            }
            if OTP_KEYS.contains(key) {
                let seed = sanitize::secret(value.text().trim(), max);
                if !seed.is_empty() {
                    entry.otp_seed = Some(seed);
                }
                continue;
            }
            let name = sanitize::single_line(key, max);
            if name.is_empty() {
                continue;
            }
            let value = if value.protected {
                sanitize::secret(value.text(), max)
            } else {
                sanitize::multi_line(value.text(), max)
            };
            entry.custom_fields.insert(name, value);
        }

        if let Some(tags) = node.child_text("Tags") {
            entry.tags = crate::record::split_tags(tags, self.limits);
        }

        let times = node.child("Times");
        let time = |name: &str| times.and_then(|t| t.child_text(name)).and_then(parse_time);
        if let Some(created) = time("CreationTime") {
            entry.created_at = created;
        }
        entry.modified_at = time("LastModificationTime").unwrap_or(entry.created_at);

        entry.password_history = history(node, &entry.password, max);
        self.entries.push(entry);
    }
}

/// Older passwords from `<History>`, newest first, without repeats.
fn history(node: &Node, current: &str, max: usize) -> Vec<PasswordHistoryItem> {
    let Some(history) = node.child("History") else {
        return Vec::new();
    };

    let mut items: Vec<PasswordHistoryItem> = Vec::new();
    for old in history.children_named("Entry") {
        let password = old
            .children_named("String")
            .find(|s| s.child_text("Key") == Some("Password"))
            .and_then(|s| s.child_text("Value"))
            .map(|p| sanitize::secret(p, max))
            .unwrap_or_default();
        let retired_at = old
            .child("Times")
            .and_then(|t| t.child_text("LastModificationTime"))
            .and_then(parse_time)
            .unwrap_or_else(Utc::now);
        items.push(PasswordHistoryItem {
            password,
            retired_at,
        });
    }

    items.sort_by(|a, b| b.retired_at.cmp(&a.retired_at));
    let mut kept: Vec<PasswordHistoryItem> = Vec::new();
    for item in items {
        if item.password.is_empty()
            || item.password == current
            || kept.iter().any(|k| k.password == item.password)
        {
            continue;
        }
        kept.push(item);
        if kept.len() == PASSWORD_HISTORY_LIMIT {
            break;
        }
    }
    kept
}
