/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The backup presence matrix: which pieces of which block of which backup exist locally and on
//! each of the N configured suppliers.
//!
//! Two parallel matrices are kept per backup: `remote` (what suppliers confirmed) and `local`
//! (what the fragment store holds), each `block → {Data: [N], Parity: [N]}` with cells in
//! {missing, unknown, present}. `max_block_numbers` tracks the highest block seen per backup.
//! The scans over these matrices drive every scheduling decision of the backup subsystem.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::types::basic::{BlockNumber, SupplierPos};
use crate::types::packet_id::{BackupId, DataOrParity, PacketId};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Presence {
    Missing,
    #[default]
    Unknown,
    Present,
}

#[derive(Clone, Debug)]
struct BlockPresence {
    data: Vec<Presence>,
    parity: Vec<Presence>,
}

impl BlockPresence {
    fn new(suppliers_count: usize) -> BlockPresence {
        BlockPresence {
            data: vec![Presence::Unknown; suppliers_count],
            parity: vec![Presence::Unknown; suppliers_count],
        }
    }

    fn cells(&self, kind: DataOrParity) -> &Vec<Presence> {
        match kind {
            DataOrParity::Data => &self.data,
            DataOrParity::Parity => &self.parity,
        }
    }

    fn cells_mut(&mut self, kind: DataOrParity) -> &mut Vec<Presence> {
        match kind {
            DataOrParity::Data => &mut self.data,
            DataOrParity::Parity => &mut self.parity,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct BackupPresence {
    remote: BTreeMap<BlockNumber, BlockPresence>,
    local: BTreeMap<BlockNumber, BlockPresence>,
    max_block: BlockNumber,
}

struct MatrixInner {
    suppliers_count: usize,
    backups: HashMap<BackupId, BackupPresence>,
}

/// Process-wide matrix handle. Cloning shares the underlying state.
#[derive(Clone)]
pub struct BackupMatrix {
    inner: Arc<Mutex<MatrixInner>>,
}

impl BackupMatrix {
    pub fn new(suppliers_count: usize) -> BackupMatrix {
        BackupMatrix {
            inner: Arc::new(Mutex::new(MatrixInner {
                suppliers_count,
                backups: HashMap::new(),
            })),
        }
    }

    pub fn suppliers_count(&self) -> usize {
        self.inner.lock().unwrap().suppliers_count
    }

    pub fn backup_ids(&self) -> Vec<BackupId> {
        self.inner.lock().unwrap().backups.keys().cloned().collect()
    }

    pub fn max_block_number(&self, backup_id: &BackupId) -> Option<BlockNumber> {
        self.inner
            .lock()
            .unwrap()
            .backups
            .get(backup_id)
            .map(|presence| presence.max_block)
    }

    /// `RemoteFileReport`: records a supplier's confirmation (or denial) of one piece.
    pub fn remote_file_report(
        &self,
        backup_id: &BackupId,
        block: BlockNumber,
        supplier: SupplierPos,
        kind: DataOrParity,
        ok: bool,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let suppliers_count = inner.suppliers_count;
        if supplier.index() >= suppliers_count {
            log::warn!(
                "remote file report for {} names supplier {} outside the fleet of {}",
                backup_id,
                supplier,
                suppliers_count
            );
            return;
        }
        let presence = inner.backups.entry(backup_id.clone()).or_default();
        presence.max_block = presence.max_block.max(block);
        let cells = presence
            .remote
            .entry(block)
            .or_insert_with(|| BlockPresence::new(suppliers_count))
            .cells_mut(kind);
        cells[supplier.index()] = if ok {
            Presence::Present
        } else {
            Presence::Missing
        };
    }

    /// `LocalFileReport`: records whether the fragment store holds one piece.
    pub fn local_file_report(&self, packet_id: &PacketId, present: bool) {
        let mut inner = self.inner.lock().unwrap();
        let suppliers_count = inner.suppliers_count;
        if packet_id.supplier.index() >= suppliers_count {
            return;
        }
        let presence = inner.backups.entry(packet_id.backup_id.clone()).or_default();
        presence.max_block = presence.max_block.max(packet_id.block);
        let cells = presence
            .local
            .entry(packet_id.block)
            .or_insert_with(|| BlockPresence::new(suppliers_count))
            .cells_mut(packet_id.kind);
        cells[packet_id.supplier.index()] = if present {
            Presence::Present
        } else {
            Presence::Missing
        };
    }

    /// Resets one supplier's remote column to unknown for every backup under `key_alias`.
    /// Called when a fresh list-files report opens that supplier's key scope.
    pub fn reset_supplier_scope(&self, supplier: SupplierPos, key_alias: &str) {
        let mut inner = self.inner.lock().unwrap();
        if supplier.index() >= inner.suppliers_count {
            return;
        }
        for (backup_id, presence) in inner.backups.iter_mut() {
            let alias = backup_id
                .customer
                .as_ref()
                .map(|customer| customer.key_alias())
                .unwrap_or(crate::types::packet_id::DEFAULT_KEY_ALIAS);
            if alias != key_alias {
                continue;
            }
            for cells in presence.remote.values_mut() {
                cells.data[supplier.index()] = Presence::Unknown;
                cells.parity[supplier.index()] = Presence::Unknown;
            }
        }
    }

    /// Drops every cell of one supplier's remote column, across all backups. Used when the
    /// supplier is fired.
    pub fn reset_supplier(&self, supplier: SupplierPos) {
        let mut inner = self.inner.lock().unwrap();
        if supplier.index() >= inner.suppliers_count {
            return;
        }
        for presence in inner.backups.values_mut() {
            for cells in presence.remote.values_mut() {
                cells.data[supplier.index()] = Presence::Unknown;
                cells.parity[supplier.index()] = Presence::Unknown;
            }
        }
    }

    pub fn forget_backup(&self, backup_id: &BackupId) {
        self.inner.lock().unwrap().backups.remove(backup_id);
    }

    /// `ScanMissingBlocks`: block numbers where some supplier is known to lack a Data or
    /// Parity piece.
    pub fn scan_missing_blocks(&self, backup_id: &BackupId) -> Vec<BlockNumber> {
        let inner = self.inner.lock().unwrap();
        let Some(presence) = inner.backups.get(backup_id) else {
            return Vec::new();
        };
        let mut result = Vec::new();
        for block_int in 0..=presence.max_block.int() {
            let block = BlockNumber::new(block_int);
            let missing = match presence.remote.get(&block) {
                Some(cells) => {
                    cells.data.iter().any(|cell| *cell == Presence::Missing)
                        || cells.parity.iter().any(|cell| *cell == Presence::Missing)
                }
                // A block no supplier ever reported is not provably missing.
                None => false,
            };
            if missing {
                result.push(block);
            }
        }
        result
    }

    /// `ScanBlocksToSend`: per supplier, the packet ids present locally but not confirmed
    /// remotely, in block order, at most `limit` per supplier.
    pub fn scan_blocks_to_send(
        &self,
        backup_id: &BackupId,
        limit: usize,
    ) -> BTreeMap<SupplierPos, Vec<PacketId>> {
        let inner = self.inner.lock().unwrap();
        let mut result: BTreeMap<SupplierPos, Vec<PacketId>> = BTreeMap::new();
        let Some(presence) = inner.backups.get(backup_id) else {
            return result;
        };
        for (block, local_cells) in &presence.local {
            let remote_cells = presence.remote.get(block);
            for kind in [DataOrParity::Data, DataOrParity::Parity] {
                for supplier_index in 0..inner.suppliers_count {
                    if local_cells.cells(kind)[supplier_index] != Presence::Present {
                        continue;
                    }
                    let confirmed = remote_cells
                        .map(|cells| cells.cells(kind)[supplier_index] == Presence::Present)
                        .unwrap_or(false);
                    if confirmed {
                        continue;
                    }
                    let supplier = SupplierPos::new(supplier_index as u32);
                    let queued = result.entry(supplier).or_default();
                    if queued.len() >= limit {
                        continue;
                    }
                    queued.push(PacketId::make(backup_id.clone(), *block, supplier, kind));
                }
            }
        }
        result
    }

    /// `ScanBlocksToRemove`: local packet ids safe to delete because every supplier confirmed
    /// its copy of the block. With `check_all`, a piece qualifies only when every piece of its
    /// block is confirmed at every supplier; otherwise its own remote cell is enough.
    pub fn scan_blocks_to_remove(&self, backup_id: &BackupId, check_all: bool) -> Vec<PacketId> {
        let inner = self.inner.lock().unwrap();
        let Some(presence) = inner.backups.get(backup_id) else {
            return Vec::new();
        };
        let mut result = Vec::new();
        for (block, local_cells) in &presence.local {
            let Some(remote_cells) = presence.remote.get(block) else {
                continue;
            };
            let block_fully_confirmed = remote_cells
                .data
                .iter()
                .chain(remote_cells.parity.iter())
                .all(|cell| *cell == Presence::Present);
            for kind in [DataOrParity::Data, DataOrParity::Parity] {
                for supplier_index in 0..inner.suppliers_count {
                    if local_cells.cells(kind)[supplier_index] != Presence::Present {
                        continue;
                    }
                    let safe = if check_all {
                        block_fully_confirmed
                    } else {
                        remote_cells.cells(kind)[supplier_index] == Presence::Present
                    };
                    if safe {
                        result.push(PacketId::make(
                            backup_id.clone(),
                            *block,
                            SupplierPos::new(supplier_index as u32),
                            kind,
                        ));
                    }
                }
            }
        }
        result
    }
}
