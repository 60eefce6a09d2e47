/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait definitions for the storage providers supplied by the library user: a small key-value
//! store for node metadata ([`KVStore`]) and a store for local backup fragments
//! ([`FragmentStore`]).
//!
//! The key-value store persists single cells (a group's last consumed sequence id, the catalog
//! index file, a supplier's latest raw list-files); keys are namespaced by the prefixes in
//! [`paths`]. The on-disk layout behind either trait is the provider's business.

use crate::types::packet_id::{BackupId, PacketId};

pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
}

pub trait KVStore: KVGet + Clone + Send + 'static {
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

/// Storage for the local copies of backup fragments, keyed by packet id.
pub trait FragmentStore: Clone + Send + 'static {
    fn has(&self, packet_id: &PacketId) -> bool;
    fn put(&mut self, packet_id: &PacketId, data: &[u8]);
    fn get(&self, packet_id: &PacketId) -> Option<Vec<u8>>;
    fn delete(&mut self, packet_id: &PacketId);
    /// Every locally stored piece of `backup_id`.
    fn list(&self, backup_id: &BackupId) -> Vec<PacketId>;
}

pub(crate) mod paths {
    /// `gm/seq/<group_key_id>` → borsh `SequenceId`: last consumed sequence id of a group.
    pub(crate) const GROUP_LAST_SEQUENCE_ID: [u8; 7] = *b"gm/seq/";

    /// `catalog/index` → JSON catalog file (items + revision).
    pub(crate) const CATALOG_INDEX: [u8; 13] = *b"catalog/index";

    /// `suppliers/listfiles/<idurl>` → latest raw list-files text from that supplier.
    pub(crate) const SUPPLIER_LIST_FILES: [u8; 20] = *b"suppliers/listfiles/";

    /// `metadata/localidentity` → borsh `IdentityDocument` of this node.
    pub(crate) const LOCAL_IDENTITY: [u8; 22] = *b"metadata/localidentity";

    /// `metadata/indexkey` → the 32 raw bytes of the catalog index encryption key.
    pub(crate) const INDEX_KEY: [u8; 17] = *b"metadata/indexkey";

    pub(crate) fn combine(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(prefix.len() + suffix.len());
        key.extend_from_slice(prefix);
        key.extend_from_slice(suffix);
        key
    }
}
