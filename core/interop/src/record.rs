//! Helpers shared by the importers for turning foreign records into entries.

use std::collections::HashMap;
use uuid::Uuid;

use keyward_vault::VaultGroup;

use crate::limits::ImportLimits;
use crate::sanitize;

/// Title for a record that has none: the URL host, then the username.
pub(crate) fn fallback_title(urls: &[String], username: &str) -> Option<String> {
    urls.iter()
        .find_map(|url| host_of(url))
        .or_else(|| (!username.is_empty()).then(|| username.to_string()))
}

fn host_of(url: &str) -> Option<String> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = authority.rsplit('@').next().unwrap_or_default();
    let host = host.split(':').next().unwrap_or_default();
    (!host.is_empty()).then(|| host.to_string())
}

/// Split a tag list on `,` or `;`.
pub(crate) fn split_tags(raw: &str, limits: &ImportLimits) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for tag in raw.split([',', ';']) {
        let tag = sanitize::single_line(tag, limits.max_field_len);
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

/// Split a URL cell on whitespace.
pub(crate) fn split_urls(raw: &str, limits: &ImportLimits) -> Vec<String> {
    raw.split_whitespace()
        .map(|url| sanitize::single_line(url, limits.max_field_len))
        .filter(|url| !url.is_empty())
        .collect()
}

/// Folders created during one import, keyed by the source's identifier.
#[derive(Debug, Default)]
pub(crate) struct FolderIndex {
    groups: Vec<VaultGroup>,
    by_key: HashMap<String, Uuid>,
}

impl FolderIndex {
    /// Folder for `key`, created with `name` on first use.
    pub(crate) fn ensure(&mut self, key: &str, name: &str) -> Uuid {
        if let Some(id) = self.by_key.get(key) {
            return *id;
        }
        let group = VaultGroup::new(name);
        let id = group.id;
        self.groups.push(group);
        self.by_key.insert(key.to_string(), id);
        id
    }

    /// Folder previously registered under `key`.
    pub(crate) fn get(&self, key: &str) -> Option<Uuid> {
        self.by_key.get(key).copied()
    }

    pub(crate) fn into_groups(self) -> Vec<VaultGroup> {
        self.groups
    }
}
