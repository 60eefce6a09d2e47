/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Parsing and application of a supplier's raw list-files report.
//!
//! The report is newline-delimited text. Each line starts with a one-letter prefix:
//!
//! ```text
//! Q<query>                                         reserved selector
//! K<key_alias>                                     begin a key scope
//! D<path_id>                                       directory record
//! F<path_id> <size>                                file record
//! V<backup_id> <supplier> <min>-<max> <size> [missing Data:i,j Parity:k]   version record
//! ```
//!
//! Entering a `K` scope resets the remote matrix cells this supplier contributed within that
//! scope. A scope whose key alias is not locally registered is rejected with a warning and its
//! lines are skipped without touching the catalog. Version records whose supplier number does
//! not match the reporting supplier are skipped.
//!
//! Catalog mutations are gated on [`Catalog::in_sync`]. Before the first synchronization the
//! local index may be an empty placeholder for a copy still to be restored from the suppliers,
//! so reported paths unknown to the catalog are neither created locally nor scheduled for
//! deletion on the supplier. The `.index` file entry is the one exception: its reported size
//! is always recorded.

use std::collections::BTreeSet;

use crate::backup::matrix::BackupMatrix;
use crate::catalog::{Catalog, VersionInfo, VersionKind, INDEX_FILE_NAME, INDEX_PATH_ID};
use crate::types::basic::{BlockNumber, SupplierPos};
use crate::types::packet_id::{BackupId, DataOrParity, PathId, DEFAULT_KEY_ALIAS};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ListFilesLine {
    Query(String),
    KeyScope(String),
    Dir(PathId),
    File { path_id: PathId, size: u64 },
    IndexFile { size: u64 },
    Version {
        backup_id: BackupId,
        supplier: SupplierPos,
        min_block: BlockNumber,
        max_block: BlockNumber,
        size: u64,
        missing: Vec<(DataOrParity, BlockNumber)>,
    },
}

/// What applying one report decided: backups that need rebuilding because the supplier is
/// missing pieces, and supplier-side paths that are obsolete per the in-sync catalog.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListFilesOutcome {
    pub rebuild: Vec<BackupId>,
    pub delete_on_supplier: Vec<PathId>,
}

pub(crate) fn parse_line(line: &str) -> Option<ListFilesLine> {
    let line = line.trim_end();
    if line.is_empty() {
        return None;
    }
    let (prefix, rest) = line.split_at(1);
    match prefix {
        "Q" => Some(ListFilesLine::Query(rest.to_string())),
        "K" => Some(ListFilesLine::KeyScope(rest.to_string())),
        "D" => rest.parse().ok().map(ListFilesLine::Dir),
        "F" => parse_file_line(rest),
        "V" => parse_version_line(rest),
        _ => None,
    }
}

fn parse_file_line(rest: &str) -> Option<ListFilesLine> {
    let (path_part, size_part) = rest.rsplit_once(' ')?;
    let size: u64 = size_part.parse().ok()?;
    if path_part == INDEX_FILE_NAME {
        return Some(ListFilesLine::IndexFile { size });
    }
    let path_id = path_part.parse().ok()?;
    Some(ListFilesLine::File { path_id, size })
}

fn parse_version_line(rest: &str) -> Option<ListFilesLine> {
    let mut fields = rest.split(' ');
    let backup_id: BackupId = fields.next()?.parse().ok()?;
    let supplier = SupplierPos::new(fields.next()?.parse().ok()?);
    let (min_part, max_part) = fields.next()?.split_once('-')?;
    let min_block = BlockNumber::new(min_part.parse().ok()?);
    let max_block = BlockNumber::new(max_part.parse().ok()?);
    let size: u64 = fields.next()?.parse().ok()?;

    let mut missing = Vec::new();
    let tail: Vec<&str> = fields.collect();
    if !tail.is_empty() {
        if tail[0] != "missing" {
            return None;
        }
        for chunk in &tail[1..] {
            let (kind_part, blocks_part) = chunk.split_once(':')?;
            let kind: DataOrParity = kind_part.parse().ok()?;
            for block in blocks_part.split(',').filter(|text| !text.is_empty()) {
                missing.push((kind, BlockNumber::new(block.parse().ok()?)));
            }
        }
    }
    Some(ListFilesLine::Version {
        backup_id,
        supplier,
        min_block,
        max_block,
        size,
        missing,
    })
}

/// The key id items created inside a `K` scope get: the scope's alias over the default key's
/// customer.
fn scoped_key_id(scope_alias: &str, default_key_id: &str) -> String {
    if scope_alias == DEFAULT_KEY_ALIAS {
        return default_key_id.to_string();
    }
    match default_key_id.split_once('$') {
        Some((_, customer)) => format!("{}${}", scope_alias, customer),
        None => default_key_id.to_string(),
    }
}

/// `ProcessRawListFiles`: applies one supplier's report to the catalog and the remote matrix.
pub fn process_raw_list_files(
    supplier: SupplierPos,
    text: &str,
    catalog: &Catalog,
    matrix: &BackupMatrix,
    registered_key_aliases: &[String],
    default_key_id: &str,
) -> ListFilesOutcome {
    let mut outcome = ListFilesOutcome::default();
    let mut rebuild: BTreeSet<BackupId> = BTreeSet::new();
    // Until the first K line the scope is the default alias.
    let mut scope_alias = DEFAULT_KEY_ALIAS.to_string();
    let mut scope_rejected = false;

    for raw_line in text.lines() {
        let Some(line) = parse_line(raw_line) else {
            if !raw_line.trim().is_empty() {
                log::warn!(
                    "skipping malformed list-files line from supplier {}: {}",
                    supplier,
                    raw_line
                );
            }
            continue;
        };
        match line {
            ListFilesLine::Query(_) => (),
            ListFilesLine::KeyScope(alias) => {
                scope_rejected = !registered_key_aliases.contains(&alias);
                if scope_rejected {
                    log::warn!(
                        "supplier {} reports key scope {} with no locally registered key, \
                         rejecting the scope",
                        supplier,
                        alias
                    );
                } else {
                    matrix.reset_supplier_scope(supplier, &alias);
                }
                scope_alias = alias;
            }
            _ if scope_rejected => (),
            ListFilesLine::Dir(path_id) => {
                if catalog.has(&path_id) {
                    continue;
                }
                if catalog.in_sync() {
                    // The catalog is authoritative: the supplier holds an obsolete directory.
                    outcome.delete_on_supplier.push(path_id);
                }
                // Not synchronized yet: the record may belong to an index copy still to be
                // restored, leave both sides alone.
            }
            ListFilesLine::File { path_id, size } => {
                if catalog.in_sync() {
                    let key_id = scoped_key_id(&scope_alias, default_key_id);
                    catalog.create_file(path_id, "", size, &key_id);
                }
            }
            ListFilesLine::IndexFile { size } => {
                // The index file entry is always (re)created with the reported size.
                let path_id: PathId = INDEX_PATH_ID
                    .parse()
                    .expect("the reserved index path id is canonical");
                if let Some(mut item) = catalog.get(&path_id) {
                    if item.size != size {
                        item.size = size;
                        catalog.upsert(item);
                    }
                } else {
                    catalog.create_file(path_id, INDEX_FILE_NAME, size, default_key_id);
                }
            }
            ListFilesLine::Version {
                backup_id,
                supplier: reported_supplier,
                min_block,
                max_block,
                size,
                missing,
            } => {
                if reported_supplier != supplier {
                    log::warn!(
                        "supplier {} reported a version record for supplier {}, skipping: {}",
                        supplier,
                        reported_supplier,
                        backup_id
                    );
                    continue;
                }
                if catalog.in_sync() {
                    let key_id = scoped_key_id(&scope_alias, default_key_id);
                    catalog.create_file(backup_id.path_id.clone(), "", size, &key_id);
                    catalog.set_version(
                        &backup_id.path_id,
                        backup_id.version.clone(),
                        VersionInfo {
                            kind: VersionKind::Full,
                            max_block,
                            size,
                        },
                    );
                } else if !catalog.has(&backup_id.path_id) {
                    // Same as the file case: the path may still come back with the index.
                    continue;
                }
                for block_int in min_block.int()..=max_block.int() {
                    let block = BlockNumber::new(block_int);
                    for kind in [DataOrParity::Data, DataOrParity::Parity] {
                        let lost = missing.contains(&(kind, block));
                        matrix.remote_file_report(&backup_id, block, supplier, kind, !lost);
                    }
                }
                if !missing.is_empty() {
                    rebuild.insert(backup_id);
                }
            }
        }
    }
    outcome.rebuild = rebuild.into_iter().collect();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::matrix::BackupMatrix;
    use crate::types::basic::Revision;

    const KEY_ID: &str = "master$alice@idhost.org";

    fn aliases() -> Vec<String> {
        vec!["master".to_string()]
    }

    fn in_sync_catalog() -> Catalog {
        let catalog = Catalog::new();
        catalog.create_file("9/9".parse().unwrap(), "seed", 1, KEY_ID);
        catalog.mark_synchronized();
        catalog
    }

    #[test]
    fn version_line_grammar() {
        let line = parse_line("V0/1/2/F20240101120000PM 0 0-3 1024 missing Data:1,2 Parity:0").unwrap();
        let ListFilesLine::Version {
            backup_id,
            supplier,
            min_block,
            max_block,
            size,
            missing,
        } = line
        else {
            panic!("expected a version line");
        };
        assert_eq!(backup_id.to_string(), "0/1/2/F20240101120000PM");
        assert_eq!(supplier, SupplierPos::new(0));
        assert_eq!(min_block, BlockNumber::new(0));
        assert_eq!(max_block, BlockNumber::new(3));
        assert_eq!(size, 1024);
        assert_eq!(
            missing,
            vec![
                (DataOrParity::Data, BlockNumber::new(1)),
                (DataOrParity::Data, BlockNumber::new(2)),
                (DataOrParity::Parity, BlockNumber::new(0)),
            ]
        );
    }

    #[test]
    fn supplier_report_reconciles_catalog_and_matrix() {
        let catalog = in_sync_catalog();
        let matrix = BackupMatrix::new(2);
        let report = "Kmaster\nF0/1/2 100\nV0/1/2/F20240101120000PM 0 0-3 1024";
        let outcome = process_raw_list_files(
            SupplierPos::new(0),
            report,
            &catalog,
            &matrix,
            &aliases(),
            KEY_ID,
        );
        assert!(outcome.rebuild.is_empty());
        assert!(outcome.delete_on_supplier.is_empty());

        let item = catalog.get(&"0/1/2".parse().unwrap()).unwrap();
        assert_eq!(item.size, 100);
        let version_info = item
            .versions
            .get(&"F20240101120000PM".parse().unwrap())
            .unwrap();
        assert_eq!(version_info.max_block, BlockNumber::new(3));
        assert_eq!(version_info.size, 1024);

        let bid: BackupId = "0/1/2/F20240101120000PM".parse().unwrap();
        assert!(matrix.scan_missing_blocks(&bid).is_empty());
        assert_eq!(matrix.max_block_number(&bid), Some(BlockNumber::new(3)));
    }

    #[test]
    fn missing_pieces_trigger_rebuild() {
        let catalog = in_sync_catalog();
        let matrix = BackupMatrix::new(1);
        let report = "Kmaster\nV0/1/F20240101120000PM 0 0-2 512 missing Parity:1";
        let outcome = process_raw_list_files(
            SupplierPos::new(0),
            report,
            &catalog,
            &matrix,
            &aliases(),
            KEY_ID,
        );
        let bid: BackupId = "0/1/F20240101120000PM".parse().unwrap();
        assert_eq!(outcome.rebuild, vec![bid.clone()]);
        assert_eq!(matrix.scan_missing_blocks(&bid), vec![BlockNumber::new(1)]);
    }

    #[test]
    fn unregistered_key_scope_is_rejected_without_catalog_changes() {
        let catalog = in_sync_catalog();
        let matrix = BackupMatrix::new(1);
        let revision_before = catalog.revision();
        let report = "Kshare_abc\nF0/5 10\nV0/5/F20240101120000PM 0 0-0 10";
        let outcome = process_raw_list_files(
            SupplierPos::new(0),
            report,
            &catalog,
            &matrix,
            &aliases(),
            KEY_ID,
        );
        assert_eq!(outcome, ListFilesOutcome::default());
        assert_eq!(catalog.revision(), revision_before);
        assert!(!catalog.has(&"0/5".parse().unwrap()));
    }

    #[test]
    fn unknown_dir_is_deleted_only_when_in_sync() {
        let matrix = BackupMatrix::new(1);

        let out_of_sync = Catalog::new();
        let outcome = process_raw_list_files(
            SupplierPos::new(0),
            "D0/7",
            &out_of_sync,
            &matrix,
            &aliases(),
            KEY_ID,
        );
        assert!(outcome.delete_on_supplier.is_empty());
        assert!(!out_of_sync.has(&"0/7".parse().unwrap()));

        let synced = in_sync_catalog();
        let outcome = process_raw_list_files(
            SupplierPos::new(0),
            "D0/7",
            &synced,
            &matrix,
            &aliases(),
            KEY_ID,
        );
        assert_eq!(outcome.delete_on_supplier, vec!["0/7".parse().unwrap()]);
        assert!(!synced.has(&"0/7".parse().unwrap()));
    }

    #[test]
    fn report_before_first_synchronization_leaves_the_catalog_untouched() {
        let catalog = Catalog::new();
        assert!(!catalog.in_sync());
        let matrix = BackupMatrix::new(1);
        let report = "Kmaster\nD0/1\nF0/5 10\nV0/5/F20240101120000PM 0 0-0 10";
        let outcome = process_raw_list_files(
            SupplierPos::new(0),
            report,
            &catalog,
            &matrix,
            &aliases(),
            KEY_ID,
        );
        assert_eq!(outcome, ListFilesOutcome::default());
        assert!(!catalog.has(&"0/1".parse().unwrap()));
        assert!(!catalog.has(&"0/5".parse().unwrap()));
        assert_eq!(catalog.revision(), Revision::new(0));
        let bid: BackupId = "0/5/F20240101120000PM".parse().unwrap();
        assert_eq!(matrix.max_block_number(&bid), None);
    }

    #[test]
    fn known_backup_is_tracked_before_first_synchronization() {
        let catalog = Catalog::new();
        catalog.create_file("0/1".parse().unwrap(), "seed", 1, KEY_ID);
        assert!(!catalog.in_sync());
        let matrix = BackupMatrix::new(1);
        let report = "Kmaster\nV0/1/F20240101120000PM 0 0-2 512";
        process_raw_list_files(
            SupplierPos::new(0),
            report,
            &catalog,
            &matrix,
            &aliases(),
            KEY_ID,
        );
        // The remote matrix fills in, but the version record stays out of the catalog until
        // the index is synchronized.
        let bid: BackupId = "0/1/F20240101120000PM".parse().unwrap();
        assert_eq!(matrix.max_block_number(&bid), Some(BlockNumber::new(2)));
        let item = catalog.get(&"0/1".parse().unwrap()).unwrap();
        assert!(item.versions.is_empty());
    }

    #[test]
    fn mismatched_supplier_number_is_skipped() {
        let catalog = in_sync_catalog();
        let matrix = BackupMatrix::new(2);
        let report = "Kmaster\nV0/1/F20240101120000PM 1 0-0 10";
        let outcome = process_raw_list_files(
            SupplierPos::new(0),
            report,
            &catalog,
            &matrix,
            &aliases(),
            KEY_ID,
        );
        assert!(outcome.rebuild.is_empty());
        let bid: BackupId = "0/1/F20240101120000PM".parse().unwrap();
        assert_eq!(matrix.max_block_number(&bid), None);
    }

    #[test]
    fn index_file_entry_always_takes_reported_size() {
        let catalog = in_sync_catalog();
        let matrix = BackupMatrix::new(1);
        process_raw_list_files(
            SupplierPos::new(0),
            "F.index 4242",
            &catalog,
            &matrix,
            &aliases(),
            KEY_ID,
        );
        let index_path: PathId = INDEX_PATH_ID.parse().unwrap();
        assert_eq!(catalog.get(&index_path).unwrap().size, 4242);

        // Re-reported with a new size: refreshed in place.
        process_raw_list_files(
            SupplierPos::new(0),
            "F.index 5000",
            &catalog,
            &matrix,
            &aliases(),
            KEY_ID,
        );
        assert_eq!(catalog.get(&index_path).unwrap().size, 5000);
        assert!(catalog.revision() > Revision::new(0));
    }
}
