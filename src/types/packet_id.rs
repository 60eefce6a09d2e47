/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The hierarchical packet-ID grammar.
//!
//! A full packet ID names one erasure-coded piece of one block of one version of one backup:
//!
//! ```text
//! packet-id = [key-alias "$"] customer-id ":" path-id "/" version "/" block "-" supplier "-" kind
//! ```
//!
//! For example `master$alice@idhost.org:0/0/1/0/F20131120053803PM/1234-63-Data`. The key alias
//! defaults to `"master"`; the customer part is optional in the short form. Versions are full
//! backups only: `F` followed by a timestamp and an `AM`/`PM` marker (incremental backups are a
//! future extension of this grammar).

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::types::basic::{BlockNumber, SupplierPos};

pub const DEFAULT_KEY_ALIAS: &str = "master";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PacketIdError {
    EmptyPathId,
    MalformedPathId,
    MalformedVersion,
    MalformedBlock,
    MalformedSupplier,
    MalformedKind,
    MissingVersion,
    MissingFileName,
    MalformedGlobalId,
}

impl Display for PacketIdError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let text = match self {
            PacketIdError::EmptyPathId => "empty path id",
            PacketIdError::MalformedPathId => "malformed path id",
            PacketIdError::MalformedVersion => "malformed version name",
            PacketIdError::MalformedBlock => "malformed block number",
            PacketIdError::MalformedSupplier => "malformed supplier number",
            PacketIdError::MalformedKind => "file name is neither Data nor Parity",
            PacketIdError::MissingVersion => "version part is missing",
            PacketIdError::MissingFileName => "block file name is missing",
            PacketIdError::MalformedGlobalId => "malformed customer global id",
        };
        f.write_str(text)
    }
}

/// Whether a piece carries payload data or erasure-coding parity.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize, Serialize, Deserialize,
)]
pub enum DataOrParity {
    Data,
    Parity,
}

impl DataOrParity {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataOrParity::Data => "Data",
            DataOrParity::Parity => "Parity",
        }
    }
}

impl Display for DataOrParity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataOrParity {
    type Err = PacketIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Data" => Ok(DataOrParity::Data),
            "Parity" => Ok(DataOrParity::Parity),
            _ => Err(PacketIdError::MalformedKind),
        }
    }
}

/// A path inside the backup catalog tree: decimal components separated by `/`, e.g. `0/0/1/2`.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize, Serialize, Deserialize,
)]
pub struct PathId(String);

impl PathId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The path ids of every ancestor, shortest first, excluding `self`.
    pub fn parents(&self) -> Vec<PathId> {
        let mut result = Vec::new();
        let mut upto = String::new();
        let parts: Vec<&str> = self.0.split('/').collect();
        for part in &parts[..parts.len() - 1] {
            if !upto.is_empty() {
                upto.push('/');
            }
            upto.push_str(part);
            result.push(PathId(upto.clone()));
        }
        result
    }
}

impl Display for PathId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PathId {
    type Err = PacketIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(PacketIdError::EmptyPathId);
        }
        let all_valid = s
            .split('/')
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()));
        if !all_valid {
            return Err(PacketIdError::MalformedPathId);
        }
        Ok(PathId(s.to_string()))
    }
}

/// A backup version name: `F` + digits + (`AM`|`PM`) + optional digits, e.g.
/// `F20131120053803PM`. Only full backups exist today.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize, Serialize, Deserialize,
)]
pub struct Version(String);

impl Version {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Sort key: the timestamp digits after the leading `F`. Version names are built from
    /// zero-padded wall-clock timestamps, so lexicographic comparison of the digits orders
    /// versions by creation time.
    pub fn timestamp_digits(&self) -> &str {
        let inner = &self.0[1..];
        let end = inner.find(|c: char| !c.is_ascii_digit()).unwrap_or(inner.len());
        &inner[..end]
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Version {
    type Err = PacketIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if is_canonical_version(s) {
            Ok(Version(s.to_string()))
        } else {
            Err(PacketIdError::MalformedVersion)
        }
    }
}

/// Checks a version name against `^F\d+(AM|PM)\d*$`.
pub fn is_canonical_version(name: &str) -> bool {
    let Some(rest) = name.strip_prefix('F') else {
        return false;
    };
    let digits_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    if digits_end == 0 {
        return false;
    }
    let marker = &rest[digits_end..];
    let Some(tail) = marker.strip_prefix("AM").or_else(|| marker.strip_prefix("PM")) else {
        return false;
    };
    tail.bytes().all(|b| b.is_ascii_digit())
}

/// A customer global id: `<key_alias>$<customer_id>`, e.g. `master$alice@idhost.org`.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize, Serialize, Deserialize,
)]
pub struct GlobalId {
    key_alias: String,
    customer: String,
}

impl GlobalId {
    /// Builds a global id, normalizing an absent key alias to `"master"`.
    pub fn new(key_alias: Option<&str>, customer: &str) -> Self {
        GlobalId {
            key_alias: key_alias.unwrap_or(DEFAULT_KEY_ALIAS).to_string(),
            customer: customer.to_string(),
        }
    }

    pub fn key_alias(&self) -> &str {
        &self.key_alias
    }

    pub fn customer(&self) -> &str {
        &self.customer
    }
}

impl Display for GlobalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}${}", self.key_alias, self.customer)
    }
}

impl FromStr for GlobalId {
    type Err = PacketIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.contains(':') {
            return Err(PacketIdError::MalformedGlobalId);
        }
        match s.split_once('$') {
            Some((alias, customer)) => {
                if alias.is_empty() || customer.is_empty() {
                    return Err(PacketIdError::MalformedGlobalId);
                }
                Ok(GlobalId::new(Some(alias), customer))
            }
            None => Ok(GlobalId::new(None, s)),
        }
    }
}

/// A backup id: `[<global_id>:]<path_id>/<version>`.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize, Serialize, Deserialize,
)]
pub struct BackupId {
    pub customer: Option<GlobalId>,
    pub path_id: PathId,
    pub version: Version,
}

impl BackupId {
    pub fn new(customer: Option<GlobalId>, path_id: PathId, version: Version) -> Self {
        BackupId {
            customer,
            path_id,
            version,
        }
    }
}

impl Display for BackupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.customer {
            Some(customer) => write!(f, "{}:{}/{}", customer, self.path_id, self.version),
            None => write!(f, "{}/{}", self.path_id, self.version),
        }
    }
}

impl FromStr for BackupId {
    type Err = PacketIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (customer, rest) = match s.split_once(':') {
            Some((customer_part, rest)) => (Some(customer_part.parse::<GlobalId>()?), rest),
            None => (None, s),
        };
        let (path_part, version_part) =
            rest.rsplit_once('/').ok_or(PacketIdError::MissingVersion)?;
        Ok(BackupId {
            customer,
            path_id: path_part.parse()?,
            version: version_part.parse()?,
        })
    }
}

/// A full packet id: `<backup_id>/<block>-<supplier>-<Data|Parity>`.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize, Serialize, Deserialize,
)]
pub struct PacketId {
    pub backup_id: BackupId,
    pub block: BlockNumber,
    pub supplier: SupplierPos,
    pub kind: DataOrParity,
}

impl PacketId {
    /// The `MakePacketID` operation.
    pub fn make(
        backup_id: BackupId,
        block: BlockNumber,
        supplier: SupplierPos,
        kind: DataOrParity,
    ) -> Self {
        PacketId {
            backup_id,
            block,
            supplier,
            kind,
        }
    }

    /// The `Split` operation: parses the textual form back into its parts.
    pub fn split(text: &str) -> Result<PacketId, PacketIdError> {
        text.parse()
    }

    /// The `Valid` predicate.
    pub fn valid(text: &str) -> bool {
        text.parse::<PacketId>().is_ok()
    }

    /// The `<block>-<supplier>-<kind>` file name of this piece.
    pub fn file_name(&self) -> String {
        format!("{}-{}-{}", self.block, self.supplier, self.kind)
    }
}

impl Display for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.backup_id, self.file_name())
    }
}

impl FromStr for PacketId {
    type Err = PacketIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (backup_part, file_part) =
            s.rsplit_once('/').ok_or(PacketIdError::MissingFileName)?;
        let mut pieces = file_part.split('-');
        let block_part = pieces.next().ok_or(PacketIdError::MissingFileName)?;
        let supplier_part = pieces.next().ok_or(PacketIdError::MalformedSupplier)?;
        let kind_part = pieces.next().ok_or(PacketIdError::MalformedKind)?;
        if pieces.next().is_some() {
            return Err(PacketIdError::MissingFileName);
        }
        Ok(PacketId {
            backup_id: backup_part.parse()?,
            block: BlockNumber::new(
                block_part
                    .parse::<u32>()
                    .map_err(|_| PacketIdError::MalformedBlock)?,
            ),
            supplier: SupplierPos::new(
                supplier_part
                    .parse::<u32>()
                    .map_err(|_| PacketIdError::MalformedSupplier)?,
            ),
            kind: kind_part.parse()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backup_id(text: &str) -> BackupId {
        text.parse().unwrap()
    }

    #[test]
    fn make_then_split_roundtrips() {
        let cases = [
            ("master$alice@idhost.org:0/0/1/0/F20131120053803PM", 1234u32, 63u32, DataOrParity::Data),
            ("0/0/1/0/F20131120053803PM", 0, 0, DataOrParity::Parity),
            ("share_abc$bob@srv.net:0/5/F20240101120000AM7", 7, 2, DataOrParity::Data),
        ];
        for (bid, block, supplier, kind) in cases {
            let made = PacketId::make(
                backup_id(bid),
                BlockNumber::new(block),
                SupplierPos::new(supplier),
                kind,
            );
            let reparsed = PacketId::split(&made.to_string()).unwrap();
            assert_eq!(reparsed, made);
            assert_eq!(reparsed.block, BlockNumber::new(block));
            assert_eq!(reparsed.supplier, SupplierPos::new(supplier));
            assert_eq!(reparsed.kind, kind);
        }
    }

    #[test]
    fn valid_accepts_canonical_and_rejects_garbage() {
        assert!(PacketId::valid(
            "master$alice@idhost.org:0/0/1/0/F20131120053803PM/1234-63-Data"
        ));
        assert!(PacketId::valid("0/0/1/0/F20131120053803PM/0-0-Parity"));
        assert!(!PacketId::valid(""));
        assert!(!PacketId::valid("0/0/1/0/F20131120053803PM"));
        assert!(!PacketId::valid("0/0/1/0/F20131120053803PM/12-3-Chunk"));
        assert!(!PacketId::valid("0/0/1/0/G20131120053803PM/12-3-Data"));
        assert!(!PacketId::valid("0/x/1/0/F20131120053803PM/12-3-Data"));
    }

    #[test]
    fn version_grammar() {
        assert!(is_canonical_version("F20131120053803PM"));
        assert!(is_canonical_version("F20240101120000AM7"));
        assert!(!is_canonical_version("F"));
        assert!(!is_canonical_version("20131120053803PM"));
        assert!(!is_canonical_version("FPM"));
        assert!(!is_canonical_version("F2013AMx"));
    }

    #[test]
    fn key_alias_defaults_to_master() {
        let gid: GlobalId = "alice@idhost.org".parse().unwrap();
        assert_eq!(gid.key_alias(), "master");
        assert_eq!(gid.to_string(), "master$alice@idhost.org");
    }

    #[test]
    fn version_ordering_follows_timestamp() {
        let older: Version = "F20230101000000AM".parse().unwrap();
        let newer: Version = "F20240101000000AM".parse().unwrap();
        assert!(older.timestamp_digits() < newer.timestamp_digits());
    }

    #[test]
    fn path_id_parents() {
        let path: PathId = "0/3/7".parse().unwrap();
        let parents: Vec<String> = path.parents().iter().map(|p| p.to_string()).collect();
        assert_eq!(parents, vec!["0".to_string(), "0/3".to_string()]);
    }
}
