//! Credential records and folders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;
use zeroize::Zeroize;

/// Number of retired passwords kept per entry.
pub const PASSWORD_HISTORY_LIMIT: usize = 20;

/// Kind of credential record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Login,
    Note,
    Card,
    Identity,
}

/// A password that was replaced.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordHistoryItem {
    pub password: String,
    pub retired_at: DateTime<Utc>,
}

impl std::fmt::Debug for PasswordHistoryItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordHistoryItem")
            .field("retired_at", &self.retired_at)
            .finish_non_exhaustive()
    }
}

/// One credential record.
///
/// Secret fields are wiped when the entry is dropped.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultEntry {
    pub id: Uuid,
    pub kind: EntryKind,
    pub title: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub otp_seed: Option<String>,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub group_id: Option<Uuid>,
    #[serde(default)]
    pub favorite: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub password_history: Vec<PasswordHistoryItem>,
}

impl VaultEntry {
    /// Create an empty entry with a fresh id.
    pub fn new(kind: EntryKind, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            title: title.into(),
            username: String::new(),
            password: String::new(),
            urls: Vec::new(),
            notes: String::new(),
            otp_seed: None,
            custom_fields: BTreeMap::new(),
            tags: Vec::new(),
            group_id: None,
            favorite: false,
            created_at: now,
            modified_at: now,
            password_history: Vec::new(),
        }
    }

    /// Shorthand for a login record.
    pub fn login(
        title: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let mut entry = Self::new(EntryKind::Login, title);
        entry.username = username.into();
        entry.password = password.into();
        entry
    }

    /// Add a URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.urls.push(url.into());
        self
    }

    /// Set the notes.
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    /// Place the entry in a folder.
    pub fn with_group(mut self, group_id: Uuid) -> Self {
        self.group_id = Some(group_id);
        self
    }

    /// Record `previous` as retired if it differs from the current password.
    pub(crate) fn retire_password(&mut self, previous: &str, at: DateTime<Utc>) {
        if previous.is_empty() || previous == self.password {
            return;
        }
        self.password_history.insert(
            0,
            PasswordHistoryItem {
                password: previous.to_string(),
                retired_at: at,
            },
        );
        while self.password_history.len() > PASSWORD_HISTORY_LIMIT {
            if let Some(mut dropped) = self.password_history.pop() {
                dropped.password.zeroize();
            }
        }
    }

    /// Names of the user-visible fields that differ between two versions.
    ///
    /// Timestamps and password history are bookkeeping and not compared.
    pub fn diff_fields(&self, other: &VaultEntry) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.kind != other.kind {
            fields.push("kind");
        }
        if self.title != other.title {
            fields.push("title");
        }
        if self.username != other.username {
            fields.push("username");
        }
        if self.password != other.password {
            fields.push("password");
        }
        if self.urls != other.urls {
            fields.push("urls");
        }
        if self.notes != other.notes {
            fields.push("notes");
        }
        if self.otp_seed != other.otp_seed {
            fields.push("otp_seed");
        }
        if self.custom_fields != other.custom_fields {
            fields.push("custom_fields");
        }
        if self.tags != other.tags {
            fields.push("tags");
        }
        if self.group_id != other.group_id {
            fields.push("group_id");
        }
        if self.favorite != other.favorite {
            fields.push("favorite");
        }
        fields
    }

    /// Case-insensitive match against title, username, URLs and tags.
    pub fn matches(&self, needle_lower: &str) -> bool {
        self.title.to_lowercase().contains(needle_lower)
            || self.username.to_lowercase().contains(needle_lower)
            || self
                .urls
                .iter()
                .any(|u| u.to_lowercase().contains(needle_lower))
            || self
                .tags
                .iter()
                .any(|t| t.to_lowercase().contains(needle_lower))
    }
}

impl Drop for VaultEntry {
    fn drop(&mut self) {
        self.password.zeroize();
        if let Some(seed) = self.otp_seed.as_mut() {
            seed.zeroize();
        }
        for item in self.password_history.iter_mut() {
            item.password.zeroize();
        }
        for value in self.custom_fields.values_mut() {
            value.zeroize();
        }
    }
}

impl std::fmt::Debug for VaultEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultEntry")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("modified_at", &self.modified_at)
            .finish_non_exhaustive()
    }
}

/// Folder grouping entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultGroup {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub color: Option<String>,
}

impl VaultGroup {
    /// Create a top-level folder.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            parent_id: None,
            color: None,
        }
    }

    /// Create a nested folder.
    pub fn child_of(name: impl Into<String>, parent_id: Uuid) -> Self {
        Self {
            parent_id: Some(parent_id),
            ..Self::new(name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_fields_reports_each_change() {
        let original = VaultEntry::login("Mail", "alice", "pw1").with_url("https://mail.test");
        let mut changed = original.clone();
        changed.username = "bob".to_string();
        changed.password = "pw2".to_string();
        changed.notes = "note".to_string();
        changed.modified_at = Utc::now();

        assert_eq!(
            original.diff_fields(&changed),
            vec!["username", "password", "notes"]
        );
        assert!(original.diff_fields(&original.clone()).is_empty());
    }

    #[test]
    fn test_password_history_is_capped() {
        let mut entry = VaultEntry::login("Site", "u", "p0");
        for i in 1..=25 {
            let previous = entry.password.clone();
            entry.password = format!("p{}", i);
            entry.retire_password(&previous, Utc::now());
        }
        assert_eq!(entry.password_history.len(), PASSWORD_HISTORY_LIMIT);
        assert_eq!(entry.password_history[0].password, "p24");
    }

    #[test]
    fn test_debug_hides_secrets() {
        let entry = VaultEntry::login("Bank", "alice", "hunter2");
        let rendered = format!("{:?}", entry);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("alice"));
    }

    #[test]
    fn test_matches_is_case_insensitive() {
        let mut entry = VaultEntry::login("GitHub", "octo", "pw").with_url("https://github.com");
        entry.tags.push("Work".to_string());
        assert!(entry.matches("github"));
        assert!(entry.matches("work"));
        assert!(!entry.matches("gitlab"));
    }
}
