//! Conflict detection and resolution.
//!
//! Merging is last-write-wins per entry, decided by `modified_at`. When both
//! sides carry the same timestamp the remote copy wins, since it is the
//! state other devices already converged on. Deletions are carried as
//! tombstones: a tombstone removes every copy modified at or before the
//! deletion, and an edit made after the deletion brings the entry back.
//! Folders have their own tombstones; a deleted folder never comes back,
//! and anything still filed under it moves to its nearest surviving parent.
//!
//! The resolver always counts what actually diverged. An entry present on
//! both sides with differing user-visible fields is one diverged entry and
//! contributes each differing field to the field count.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};
use uuid::Uuid;

use keyward_common::{Error, Result};
use keyward_vault::{VaultEntry, VaultGroup, VaultStore};

/// How diverged entries are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Newest `modified_at` wins per entry.
    #[default]
    LastWriteWins,
    /// Report divergence and let the user decide.
    Manual,
}

/// Which copy survived a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Local,
    Remote,
}

/// One entry edited on both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryConflict {
    pub entry_id: Uuid,
    /// Names of the fields whose values differ.
    pub fields: Vec<String>,
    pub local_modified: DateTime<Utc>,
    pub remote_modified: DateTime<Utc>,
    pub winner: Side,
}

/// What a merge found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    /// Entries present on both sides with differing fields.
    pub conflicts: Vec<EntryConflict>,
    /// Entries only the remote had.
    pub added_from_remote: usize,
    /// Entries removed because the other side deleted them.
    pub deleted_by_tombstone: usize,
}

impl ConflictReport {
    /// Number of entries that diverged.
    pub fn diverged_entries(&self) -> usize {
        self.conflicts.len()
    }

    /// Number of fields that diverged, summed over entries.
    pub fn diverged_fields(&self) -> usize {
        self.conflicts.iter().map(|c| c.fields.len()).sum()
    }

    /// Whether any entry diverged.
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Merged store plus what the merge found.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub store: VaultStore,
    pub report: ConflictReport,
}

/// Conflict detector and resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    /// Create a new conflict resolver.
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self { strategy }
    }

    /// Get the resolution strategy.
    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Compare two stores without merging.
    pub fn detect(&self, local: &VaultStore, remote: &VaultStore) -> ConflictReport {
        self.merge(local, remote).report
    }

    /// Merge according to the strategy.
    ///
    /// # Errors
    /// - `Conflict` with the diverged field count when the strategy is
    ///   `Manual` and at least one entry diverged
    pub fn resolve(&self, local: &VaultStore, remote: &VaultStore) -> Result<MergeOutcome> {
        let outcome = self.merge(local, remote);
        if self.strategy == ConflictStrategy::Manual && outcome.report.has_conflicts() {
            info!(
                entries = outcome.report.diverged_entries(),
                fields = outcome.report.diverged_fields(),
                "Sync divergence left for manual resolution"
            );
            return Err(Error::Conflict {
                conflicts: outcome.report.diverged_fields(),
            });
        }
        Ok(outcome)
    }

    /// Last-write-wins merge of two stores.
    pub fn merge(&self, local: &VaultStore, remote: &VaultStore) -> MergeOutcome {
        let tombstones = merge_tombstones(local.tombstones(), remote.tombstones());
        let mut report = ConflictReport::default();
        let mut merged: Vec<VaultEntry> = Vec::new();

        let ids: BTreeSet<Uuid> = local
            .entries()
            .map(|e| e.id)
            .chain(remote.entries().map(|e| e.id))
            .collect();

        for id in ids {
            let candidate = match (local.get(&id), remote.get(&id)) {
                (Some(mine), Some(theirs)) => {
                    let fields = mine.diff_fields(theirs);
                    let winner = if mine.modified_at > theirs.modified_at {
                        Side::Local
                    } else {
                        Side::Remote
                    };
                    if !fields.is_empty() {
                        debug!(entry_id = %id, fields = fields.len(), ?winner, "Entry diverged");
                        report.conflicts.push(EntryConflict {
                            entry_id: id,
                            fields: fields.iter().map(|f| f.to_string()).collect(),
                            local_modified: mine.modified_at,
                            remote_modified: theirs.modified_at,
                            winner,
                        });
                    }
                    match winner {
                        Side::Local => mine,
                        Side::Remote => theirs,
                    }
                }
                (Some(mine), None) => mine,
                (None, Some(theirs)) => {
                    if !deleted_after(&tombstones, theirs) {
                        report.added_from_remote += 1;
                    }
                    theirs
                }
                (None, None) => continue,
            };

            if deleted_after(&tombstones, candidate) {
                report.deleted_by_tombstone += 1;
                continue;
            }
            merged.push(candidate.clone());
        }

        let mut tombstones = tombstones;
        for entry in &merged {
            tombstones.remove(&entry.id);
        }

        let group_tombstones =
            merge_tombstones(local.group_tombstones(), remote.group_tombstones());
        let groups = merge_groups(local, remote, &group_tombstones, &mut merged);
        let revision = local.revision().max(remote.revision()) + 1;

        MergeOutcome {
            store: VaultStore::from_parts(merged, groups, tombstones, revision)
                .with_group_tombstones(group_tombstones),
            report,
        }
    }
}

fn merge_tombstones(
    local: &BTreeMap<Uuid, DateTime<Utc>>,
    remote: &BTreeMap<Uuid, DateTime<Utc>>,
) -> BTreeMap<Uuid, DateTime<Utc>> {
    let mut merged = local.clone();
    for (id, deleted_at) in remote {
        merged
            .entry(*id)
            .and_modify(|existing| *existing = (*existing).max(*deleted_at))
            .or_insert(*deleted_at);
    }
    merged
}

fn deleted_after(tombstones: &BTreeMap<Uuid, DateTime<Utc>>, entry: &VaultEntry) -> bool {
    tombstones
        .get(&entry.id)
        .is_some_and(|deleted_at| *deleted_at >= entry.modified_at)
}

/// Union by id minus deleted folders; the local copy of a folder wins.
///
/// Entries and subfolders pointing at a deleted or unknown folder are
/// re-filed under the nearest surviving ancestor.
fn merge_groups(
    local: &VaultStore,
    remote: &VaultStore,
    deleted: &BTreeMap<Uuid, DateTime<Utc>>,
    entries: &mut [VaultEntry],
) -> Vec<VaultGroup> {
    let mut all: BTreeMap<Uuid, VaultGroup> = BTreeMap::new();
    for group in remote.groups() {
        all.insert(group.id, group.clone());
    }
    for group in local.groups() {
        all.insert(group.id, group.clone());
    }

    let surviving = |start: Option<Uuid>| -> Option<Uuid> {
        let mut current = start;
        // Bounded walk; a parent cycle ends at the top level.
        for _ in 0..=all.len() {
            let id = current?;
            if !deleted.contains_key(&id) {
                return all.contains_key(&id).then_some(id);
            }
            current = all.get(&id).and_then(|g| g.parent_id);
        }
        None
    };

    let parents: BTreeMap<Uuid, Option<Uuid>> = all
        .values()
        .map(|g| (g.id, surviving(g.parent_id)))
        .collect();
    for entry in entries.iter_mut() {
        entry.group_id = surviving(entry.group_id);
    }

    all.into_values()
        .filter(|g| !deleted.contains_key(&g.id))
        .map(|mut g| {
            g.parent_id = parents.get(&g.id).copied().flatten();
            g
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store_with(entries: Vec<VaultEntry>) -> VaultStore {
        VaultStore::from_parts(entries, Vec::new(), BTreeMap::new(), 1)
    }

    fn base_entry() -> VaultEntry {
        let mut entry = VaultEntry::login("Mail", "alice", "pw-1");
        entry.modified_at = Utc::now() - Duration::hours(1);
        entry
    }

    #[test]
    fn test_three_edited_fields_are_counted() {
        let base = base_entry();

        let mut local_copy = base.clone();
        local_copy.username = "alice@example.com".to_string();
        local_copy.modified_at = base.modified_at + Duration::minutes(1);

        let mut remote_copy = base.clone();
        remote_copy.password = "pw-2".to_string();
        remote_copy.notes = "rotated".to_string();
        remote_copy.modified_at = base.modified_at + Duration::minutes(2);

        let local = store_with(vec![local_copy]);
        let remote = store_with(vec![remote_copy.clone()]);

        let outcome = ConflictResolver::default().merge(&local, &remote);
        assert_eq!(outcome.report.diverged_entries(), 1);
        assert_eq!(outcome.report.diverged_fields(), 3);
        assert_eq!(outcome.report.conflicts[0].winner, Side::Remote);
        assert_eq!(outcome.store.get(&base.id), Some(&remote_copy));
    }

    #[test]
    fn test_identical_stores_have_no_conflicts() {
        let entry = base_entry();
        let local = store_with(vec![entry.clone()]);
        let remote = store_with(vec![entry]);

        let report = ConflictResolver::default().detect(&local, &remote);
        assert_eq!(report.diverged_entries(), 0);
        assert_eq!(report.diverged_fields(), 0);
    }

    #[test]
    fn test_newer_local_wins() {
        let base = base_entry();
        let mut local_copy = base.clone();
        local_copy.title = "Work mail".to_string();
        local_copy.modified_at = base.modified_at + Duration::minutes(5);

        let local = store_with(vec![local_copy]);
        let remote = store_with(vec![base.clone()]);

        let outcome = ConflictResolver::default().merge(&local, &remote);
        assert_eq!(outcome.store.get(&base.id).unwrap().title, "Work mail");
        assert_eq!(outcome.report.diverged_fields(), 1);
    }

    #[test]
    fn test_union_of_disjoint_entries() {
        let local = store_with(vec![VaultEntry::login("A", "a", "1")]);
        let remote = store_with(vec![
            VaultEntry::login("B", "b", "2"),
            VaultEntry::login("C", "c", "3"),
        ]);

        let outcome = ConflictResolver::default().merge(&local, &remote);
        assert_eq!(outcome.store.len(), 3);
        assert_eq!(outcome.report.added_from_remote, 2);
        assert!(!outcome.report.has_conflicts());
    }

    #[test]
    fn test_tombstone_is_not_resurrected() {
        let entry = base_entry();
        let mut local = store_with(vec![entry.clone()]);
        local.remove_entry(&entry.id).unwrap();
        let remote = store_with(vec![entry.clone()]);

        let outcome = ConflictResolver::default().merge(&local, &remote);
        assert!(outcome.store.get(&entry.id).is_none());
        assert_eq!(outcome.report.deleted_by_tombstone, 1);
        assert!(outcome.store.tombstones().contains_key(&entry.id));
    }

    #[test]
    fn test_edit_after_delete_survives() {
        let entry = base_entry();
        let mut tombstones = BTreeMap::new();
        tombstones.insert(entry.id, entry.modified_at);
        let local = VaultStore::from_parts(Vec::new(), Vec::new(), tombstones, 2);

        let mut edited = entry.clone();
        edited.modified_at = entry.modified_at + Duration::minutes(10);
        let remote = store_with(vec![edited]);

        let outcome = ConflictResolver::default().merge(&local, &remote);
        assert!(outcome.store.get(&entry.id).is_some());
        assert!(!outcome.store.tombstones().contains_key(&entry.id));
    }

    #[test]
    fn test_manual_strategy_reports_conflict() {
        let base = base_entry();
        let mut local_copy = base.clone();
        local_copy.username = "bob".to_string();
        let mut remote_copy = base.clone();
        remote_copy.password = "other".to_string();

        let resolver = ConflictResolver::new(ConflictStrategy::Manual);
        let result = resolver.resolve(&store_with(vec![local_copy]), &store_with(vec![remote_copy]));
        assert!(matches!(result, Err(Error::Conflict { conflicts: 2 })));
    }

    #[test]
    fn test_deleted_folder_stays_deleted() {
        let folder = VaultGroup::new("Work");
        let mut entry = base_entry().with_group(folder.id);
        entry.modified_at = Utc::now() - Duration::hours(1);

        let remote =
            VaultStore::from_parts(vec![entry.clone()], vec![folder.clone()], BTreeMap::new(), 1);
        let mut local = remote.clone();
        local.remove_group(&folder.id).unwrap();

        let outcome = ConflictResolver::default().merge(&local, &remote);
        assert_eq!(outcome.store.groups().count(), 0);
        assert_eq!(outcome.store.get(&entry.id).unwrap().group_id, None);
        assert!(outcome.store.group_tombstones().contains_key(&folder.id));

        // The device that still had the folder converges too.
        let back = ConflictResolver::default().merge(&remote, &outcome.store);
        assert_eq!(back.store.groups().count(), 0);
        assert!(back.store.same_contents(&outcome.store));
    }

    #[test]
    fn test_entry_filed_remotely_under_deleted_folder_moves_up() {
        let parent = VaultGroup::new("Work");
        let child = VaultGroup::child_of("Servers", parent.id);
        let base = VaultStore::from_parts(
            Vec::new(),
            vec![parent.clone(), child.clone()],
            BTreeMap::new(),
            1,
        );

        let mut local = base.clone();
        local.remove_group(&child.id).unwrap();
        let mut remote = base.clone();
        let filed = remote
            .add_entry(VaultEntry::login("ssh", "root", "pw").with_group(child.id))
            .unwrap();

        let outcome = ConflictResolver::default().merge(&local, &remote);
        assert_eq!(outcome.store.groups().count(), 1);
        assert_eq!(outcome.store.get(&filed).unwrap().group_id, Some(parent.id));
    }

    #[test]
    fn test_merged_revision_advances() {
        let local = VaultStore::from_parts(Vec::new(), Vec::new(), BTreeMap::new(), 4);
        let remote = VaultStore::from_parts(Vec::new(), Vec::new(), BTreeMap::new(), 9);
        let outcome = ConflictResolver::default().merge(&local, &remote);
        assert_eq!(outcome.store.revision(), 10);
    }
}
