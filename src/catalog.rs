/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The backup catalog: the tree of backed-up files and directories, keyed by path id.
//!
//! The whole tree, together with its monotonically increasing revision, is the *index* that the
//! [index synchronizer](crate::index_sync) replicates to every supplier. It round-trips through
//! JSON and is persisted in the node's [`KVStore`](crate::pluggables::KVStore) under
//! [`paths::CATALOG_INDEX`](crate::pluggables::paths).
//!
//! Destructive changes driven by supplier reports are gated on the in-sync predicate: the index
//! must have been synchronized with suppliers at least once and the revision must be positive.
//! Before that, a supplier failing to mention an item proves nothing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::pluggables::{paths, KVGet, KVStore};
use crate::types::basic::{BlockNumber, Revision};
use crate::types::packet_id::{BackupId, GlobalId, PathId, Version};

/// The reserved path id under which the catalog index file itself appears in supplier reports.
pub const INDEX_PATH_ID: &str = "0";

/// The file name suppliers report for the catalog index file.
pub const INDEX_FILE_NAME: &str = ".index";

/// Kinds of backup versions. Only full backups exist; the enum is the extension point for
/// incremental ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionKind {
    Full,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemType {
    File,
    Dir,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub kind: VersionKind,
    pub max_block: BlockNumber,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub path_id: PathId,
    pub name: String,
    pub item_type: ItemType,
    pub size: u64,
    /// The global id of the key the item's backups are encrypted with.
    pub key_id: String,
    pub versions: BTreeMap<Version, VersionInfo>,
}

/// The serialized shape of the index file: items plus revision.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    revision: Revision,
    items: Vec<CatalogItem>,
}

struct CatalogInner {
    items: BTreeMap<PathId, CatalogItem>,
    revision: Revision,
    /// Set after the first successful synchronization with suppliers.
    synchronized_once: bool,
}

/// Process-wide catalog handle. Cloning shares the underlying tree.
#[derive(Clone)]
pub struct Catalog {
    inner: Arc<Mutex<CatalogInner>>,
}

impl Catalog {
    pub fn new() -> Catalog {
        Catalog {
            inner: Arc::new(Mutex::new(CatalogInner {
                items: BTreeMap::new(),
                revision: Revision::new(0),
                synchronized_once: false,
            })),
        }
    }

    /// Restores the catalog from the key-value store, or starts empty.
    pub fn load<K: KVGet>(kv: &K) -> Catalog {
        let catalog = Catalog::new();
        if let Some(bytes) = kv.get(&paths::CATALOG_INDEX) {
            if catalog.absorb_json(&bytes).is_none() {
                log::warn!("stored catalog index is unreadable, starting empty");
            }
        }
        catalog
    }

    pub fn save<K: KVStore>(&self, kv: &mut K) {
        kv.set(&paths::CATALOG_INDEX, &self.to_json());
    }

    pub fn revision(&self) -> Revision {
        self.inner.lock().unwrap().revision
    }

    /// The in-sync predicate gating destructive catalog changes.
    pub fn in_sync(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.synchronized_once && inner.revision.int() > 0
    }

    pub fn mark_synchronized(&self) {
        self.inner.lock().unwrap().synchronized_once = true;
    }

    pub fn get(&self, path_id: &PathId) -> Option<CatalogItem> {
        self.inner.lock().unwrap().items.get(path_id).cloned()
    }

    pub fn has(&self, path_id: &PathId) -> bool {
        self.inner.lock().unwrap().items.contains_key(path_id)
    }

    pub fn items(&self) -> Vec<CatalogItem> {
        self.inner.lock().unwrap().items.values().cloned().collect()
    }

    /// Every (customer-less) backup id in the catalog: one per (path, version) pair.
    pub fn backup_ids(&self) -> Vec<BackupId> {
        let inner = self.inner.lock().unwrap();
        inner
            .items
            .values()
            .flat_map(|item| {
                item.versions.keys().map(|version| {
                    BackupId::new(None, item.path_id.clone(), version.clone())
                })
            })
            .collect()
    }

    /// Inserts or replaces an item and bumps the revision.
    pub fn upsert(&self, item: CatalogItem) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.insert(item.path_id.clone(), item);
        inner.revision = inner.revision.next();
    }

    /// Auto-creates a file entry (with missing parent directories) from a supplier report.
    /// No-op on an existing path.
    pub fn create_file(&self, path_id: PathId, name: &str, size: u64, key_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.items.contains_key(&path_id) {
            return;
        }
        for parent in path_id.parents() {
            inner.items.entry(parent.clone()).or_insert(CatalogItem {
                path_id: parent,
                name: String::new(),
                item_type: ItemType::Dir,
                size: 0,
                key_id: key_id.to_string(),
                versions: BTreeMap::new(),
            });
        }
        inner.items.insert(
            path_id.clone(),
            CatalogItem {
                path_id,
                name: name.to_string(),
                item_type: ItemType::File,
                size,
                key_id: key_id.to_string(),
                versions: BTreeMap::new(),
            },
        );
        inner.revision = inner.revision.next();
    }

    pub fn create_dir(&self, path_id: PathId, name: &str, key_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.items.contains_key(&path_id) {
            return;
        }
        inner.items.insert(
            path_id.clone(),
            CatalogItem {
                path_id,
                name: name.to_string(),
                item_type: ItemType::Dir,
                size: 0,
                key_id: key_id.to_string(),
                versions: BTreeMap::new(),
            },
        );
        inner.revision = inner.revision.next();
    }

    /// Records (or refreshes) one version of an item. The item must exist.
    pub fn set_version(&self, path_id: &PathId, version: Version, info: VersionInfo) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(item) = inner.items.get_mut(path_id) else {
            return false;
        };
        let changed = item.versions.insert(version, info) != Some(info);
        if changed {
            inner.revision = inner.revision.next();
        }
        changed
    }

    /// Removes an item and its whole subtree. Returns the removed path ids.
    pub fn remove_subtree(&self, path_id: &PathId) -> Vec<PathId> {
        let mut inner = self.inner.lock().unwrap();
        let prefix = format!("{}/", path_id);
        let doomed: Vec<PathId> = inner
            .items
            .keys()
            .filter(|candidate| {
                *candidate == path_id || candidate.as_str().starts_with(&prefix)
            })
            .cloned()
            .collect();
        for path in &doomed {
            inner.items.remove(path);
        }
        if !doomed.is_empty() {
            inner.revision = inner.revision.next();
        }
        doomed
    }

    /// Drops all but the newest `keep` versions of every item. Returns the pruned backups,
    /// oldest first.
    pub fn prune_versions(&self, keep: usize) -> Vec<BackupId> {
        let mut inner = self.inner.lock().unwrap();
        let mut pruned = Vec::new();
        for item in inner.items.values_mut() {
            if item.versions.len() <= keep {
                continue;
            }
            let mut versions: Vec<Version> = item.versions.keys().cloned().collect();
            versions.sort_by(|a, b| a.timestamp_digits().cmp(b.timestamp_digits()));
            let doomed_count = versions.len() - keep;
            for version in versions.into_iter().take(doomed_count) {
                item.versions.remove(&version);
                pruned.push(BackupId::new(None, item.path_id.clone(), version));
            }
        }
        if !pruned.is_empty() {
            inner.revision = inner.revision.next();
        }
        pruned
    }

    pub fn to_json(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let file = CatalogFile {
            revision: inner.revision,
            items: inner.items.values().cloned().collect(),
        };
        serde_json::to_vec(&file).expect("serializing the catalog in memory cannot fail")
    }

    /// Replaces the whole tree with a decoded index file. Returns the absorbed revision, or
    /// `None` if the bytes do not decode.
    pub fn absorb_json(&self, bytes: &[u8]) -> Option<Revision> {
        let file: CatalogFile = serde_json::from_slice(bytes).ok()?;
        let mut inner = self.inner.lock().unwrap();
        inner.items = file
            .items
            .into_iter()
            .map(|item| (item.path_id.clone(), item))
            .collect();
        inner.revision = file.revision;
        Some(file.revision)
    }

    /// The backup id under which the index file itself is stored at suppliers.
    pub fn index_backup_id(customer: &GlobalId, version: Version) -> BackupId {
        BackupId::new(
            Some(customer.clone()),
            INDEX_PATH_ID.parse().expect("the reserved index path id is canonical"),
            version,
        )
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(text: &str) -> PathId {
        text.parse().unwrap()
    }

    fn version(text: &str) -> Version {
        text.parse().unwrap()
    }

    fn info(max_block: u32, size: u64) -> VersionInfo {
        VersionInfo {
            kind: VersionKind::Full,
            max_block: BlockNumber::new(max_block),
            size,
        }
    }

    #[test]
    fn create_dir_is_idempotent() {
        let catalog = Catalog::new();
        catalog.create_dir(path("0/1"), "photos", "master$alice@idhost.org");
        assert_eq!(catalog.get(&path("0/1")).unwrap().item_type, ItemType::Dir);
        let before = catalog.revision();
        catalog.create_dir(path("0/1"), "photos", "master$alice@idhost.org");
        assert_eq!(catalog.revision(), before);
    }

    #[test]
    fn create_file_builds_parents_and_bumps_revision() {
        let catalog = Catalog::new();
        catalog.create_file(path("0/1/2"), "notes.txt", 100, "master$alice@idhost.org");
        assert_eq!(catalog.revision(), Revision::new(1));
        assert!(catalog.has(&path("0")));
        assert!(catalog.has(&path("0/1")));
        let item = catalog.get(&path("0/1/2")).unwrap();
        assert_eq!(item.item_type, ItemType::File);
        assert_eq!(item.size, 100);

        // Idempotent on existing paths.
        catalog.create_file(path("0/1/2"), "notes.txt", 100, "master$alice@idhost.org");
        assert_eq!(catalog.revision(), Revision::new(1));
    }

    #[test]
    fn json_roundtrip_preserves_items_and_revision() {
        let catalog = Catalog::new();
        catalog.create_file(path("0/1"), "a", 10, "master$alice@idhost.org");
        catalog.set_version(&path("0/1"), version("F20240101120000PM"), info(3, 1024));
        let bytes = catalog.to_json();

        let restored = Catalog::new();
        let revision = restored.absorb_json(&bytes).unwrap();
        assert_eq!(revision, catalog.revision());
        assert_eq!(restored.items(), catalog.items());
    }

    #[test]
    fn in_sync_needs_both_synchronization_and_revision() {
        let catalog = Catalog::new();
        assert!(!catalog.in_sync());
        catalog.mark_synchronized();
        assert!(!catalog.in_sync());
        catalog.create_file(path("0/1"), "a", 1, "master$alice@idhost.org");
        assert!(catalog.in_sync());
    }

    #[test]
    fn prune_keeps_newest_versions() {
        let catalog = Catalog::new();
        catalog.create_file(path("0/1"), "a", 1, "master$alice@idhost.org");
        catalog.set_version(&path("0/1"), version("F20220101000000AM"), info(1, 10));
        catalog.set_version(&path("0/1"), version("F20230101000000AM"), info(2, 20));
        catalog.set_version(&path("0/1"), version("F20240101000000AM"), info(3, 30));

        let pruned = catalog.prune_versions(2);
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].version, version("F20220101000000AM"));
        let item = catalog.get(&path("0/1")).unwrap();
        assert_eq!(item.versions.len(), 2);
        assert!(!item.versions.contains_key(&version("F20220101000000AM")));
    }

    #[test]
    fn remove_subtree_removes_descendants() {
        let catalog = Catalog::new();
        catalog.create_file(path("0/1/2"), "a", 1, "master$alice@idhost.org");
        catalog.create_file(path("0/1/3"), "b", 1, "master$alice@idhost.org");
        catalog.create_file(path("0/4"), "c", 1, "master$alice@idhost.org");

        let removed = catalog.remove_subtree(&path("0/1"));
        assert_eq!(removed.len(), 3);
        assert!(!catalog.has(&path("0/1/2")));
        assert!(catalog.has(&path("0/4")));
    }
}
