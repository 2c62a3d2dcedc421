//! In-memory decrypted vault contents.
//!
//! A `VaultStore` only ever exists inside an unlocked session or while a
//! sync merge or import is being assembled. It is serialized to JSON and
//! sealed into an envelope before touching disk or the network.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::model::{VaultEntry, VaultGroup};
use keyward_common::{Error, Result};

/// Decrypted entries, folders and deletion markers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultStore {
    #[serde(default)]
    entries: BTreeMap<Uuid, VaultEntry>,
    #[serde(default)]
    groups: BTreeMap<Uuid, VaultGroup>,
    #[serde(default)]
    tombstones: BTreeMap<Uuid, DateTime<Utc>>,
    #[serde(default)]
    group_tombstones: BTreeMap<Uuid, DateTime<Utc>>,
    #[serde(default)]
    revision: u64,
}

impl VaultStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assemble a store from parts, e.g. the result of a merge.
    pub fn from_parts(
        entries: impl IntoIterator<Item = VaultEntry>,
        groups: impl IntoIterator<Item = VaultGroup>,
        tombstones: BTreeMap<Uuid, DateTime<Utc>>,
        revision: u64,
    ) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.id, e)).collect(),
            groups: groups.into_iter().map(|g| (g.id, g)).collect(),
            tombstones,
            group_tombstones: BTreeMap::new(),
            revision,
        }
    }

    /// Attach folder deletion markers, e.g. after a merge.
    pub fn with_group_tombstones(mut self, group_tombstones: BTreeMap<Uuid, DateTime<Utc>>) -> Self {
        self.group_tombstones = group_tombstones;
        self
    }

    /// Mutation counter; increases on every change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store has no live entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate live entries in id order.
    pub fn entries(&self) -> impl Iterator<Item = &VaultEntry> {
        self.entries.values()
    }

    /// Iterate folders in id order.
    pub fn groups(&self) -> impl Iterator<Item = &VaultGroup> {
        self.groups.values()
    }

    /// Deletion markers keyed by entry id.
    pub fn tombstones(&self) -> &BTreeMap<Uuid, DateTime<Utc>> {
        &self.tombstones
    }

    /// Deletion markers keyed by folder id. A deleted folder id is never
    /// reused.
    pub fn group_tombstones(&self) -> &BTreeMap<Uuid, DateTime<Utc>> {
        &self.group_tombstones
    }

    /// Look up an entry.
    pub fn get(&self, id: &Uuid) -> Option<&VaultEntry> {
        self.entries.get(id)
    }

    /// Look up a folder.
    pub fn group(&self, id: &Uuid) -> Option<&VaultGroup> {
        self.groups.get(id)
    }

    /// Add a new entry.
    ///
    /// # Errors
    /// - `Validation` if the id is already present or the title is blank
    pub fn add_entry(&mut self, entry: VaultEntry) -> Result<Uuid> {
        if entry.title.trim().is_empty() {
            return Err(Error::Validation("Entry title cannot be empty".to_string()));
        }
        if self.entries.contains_key(&entry.id) {
            return Err(Error::Validation(format!(
                "Entry {} already exists",
                entry.id
            )));
        }
        if let Some(group_id) = entry.group_id {
            if !self.groups.contains_key(&group_id) {
                return Err(Error::Validation(format!("Unknown folder {}", group_id)));
            }
        }
        let id = entry.id;
        self.tombstones.remove(&id);
        self.entries.insert(id, entry);
        self.revision += 1;
        Ok(id)
    }

    /// Modify an entry in place.
    ///
    /// The modification timestamp is refreshed and a changed password is
    /// pushed onto the entry's history.
    ///
    /// # Errors
    /// - `NotFound` if no entry has this id
    pub fn update_entry<F>(&mut self, id: &Uuid, edit: F) -> Result<()>
    where
        F: FnOnce(&mut VaultEntry),
    {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Entry {}", id)))?;

        let previous = Zeroizing::new(entry.password.clone());
        edit(entry);
        entry.id = *id;

        let now = Utc::now();
        entry.retire_password(&previous, now);
        entry.modified_at = now;
        self.revision += 1;
        Ok(())
    }

    /// Delete an entry, leaving a tombstone for sync.
    ///
    /// # Errors
    /// - `NotFound` if no entry has this id
    pub fn remove_entry(&mut self, id: &Uuid) -> Result<VaultEntry> {
        let entry = self
            .entries
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("Entry {}", id)))?;
        self.tombstones.insert(*id, Utc::now());
        self.revision += 1;
        Ok(entry)
    }

    /// Add a folder.
    ///
    /// # Errors
    /// - `Validation` for a blank name, unknown parent or deleted id
    pub fn add_group(&mut self, group: VaultGroup) -> Result<Uuid> {
        if group.name.trim().is_empty() {
            return Err(Error::Validation("Folder name cannot be empty".to_string()));
        }
        if self.group_tombstones.contains_key(&group.id) {
            return Err(Error::Validation(format!("Folder {} was deleted", group.id)));
        }
        if let Some(parent) = group.parent_id {
            if !self.groups.contains_key(&parent) {
                return Err(Error::Validation(format!("Unknown parent folder {}", parent)));
            }
        }
        let id = group.id;
        self.groups.insert(id, group);
        self.revision += 1;
        Ok(id)
    }

    /// Remove a folder, leaving a tombstone for sync. Entries and subfolders
    /// move to its parent; moved entries count as modified.
    pub fn remove_group(&mut self, id: &Uuid) -> Result<VaultGroup> {
        let group = self
            .groups
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("Folder {}", id)))?;

        let now = Utc::now();
        for child in self.groups.values_mut() {
            if child.parent_id == Some(*id) {
                child.parent_id = group.parent_id;
            }
        }
        for entry in self.entries.values_mut() {
            if entry.group_id == Some(*id) {
                entry.group_id = group.parent_id;
                entry.modified_at = now;
            }
        }
        self.group_tombstones.insert(*id, now);
        self.revision += 1;
        Ok(group)
    }

    /// Entries in a folder (`None` for unfiled entries).
    pub fn entries_in_group(&self, group_id: Option<Uuid>) -> Vec<&VaultEntry> {
        self.entries
            .values()
            .filter(|e| e.group_id == group_id)
            .collect()
    }

    /// Entries whose title, username, URL or tag contains `query`.
    pub fn search(&self, query: &str) -> Vec<&VaultEntry> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.entries.values().collect();
        }
        self.entries.values().filter(|e| e.matches(&needle)).collect()
    }

    /// Merge imported records, returning how many entries were added.
    ///
    /// Folder references that do not resolve are cleared rather than
    /// rejecting the entry.
    pub fn merge_imported(
        &mut self,
        entries: impl IntoIterator<Item = VaultEntry>,
        groups: impl IntoIterator<Item = VaultGroup>,
    ) -> usize {
        for group in groups {
            if !self.group_tombstones.contains_key(&group.id) {
                self.groups.entry(group.id).or_insert(group);
            }
        }

        let mut added = 0;
        for mut entry in entries {
            if let Some(group_id) = entry.group_id {
                if !self.groups.contains_key(&group_id) {
                    entry.group_id = None;
                }
            }
            if self.entries.contains_key(&entry.id) {
                entry.id = Uuid::new_v4();
            }
            self.tombstones.remove(&entry.id);
            self.entries.insert(entry.id, entry);
            added += 1;
        }
        if added > 0 {
            self.revision += 1;
        }
        added
    }

    /// Whether both stores hold the same entries, folders and tombstones.
    ///
    /// Revisions are local counters and are not compared.
    pub fn same_contents(&self, other: &VaultStore) -> bool {
        self.entries == other.entries
            && self.groups == other.groups
            && self.tombstones == other.tombstones
            && self.group_tombstones == other.group_tombstones
    }

    /// Serialize for sealing.
    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>> {
        serde_json::to_vec(self)
            .map(Zeroizing::new)
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize after opening an envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Corruption(format!("Vault body: {}", e)))
    }
}
