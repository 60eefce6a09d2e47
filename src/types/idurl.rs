/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Identity URLs and the rotation registry.
//!
//! An [`IdUrl`] names the location of a peer's signed identity document. Peers may rotate: the
//! same public key re-published at a different IDURL is still the same identity. [`IdUrl`]
//! itself keeps plain string equality and hashing so it can be used as a stable map key; the
//! rotation-aware questions ("are these two IDURLs the same identity?", "what is the latest
//! IDURL for this one?") are answered by the [`IdUrlRegistry`], which the identity cache keeps
//! up to date as documents arrive.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Mutex};

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::types::basic::VerifyingKeyBytes;

/// The URL at which a peer publishes its identity document. Equality and hashing are plain
/// string comparisons; use [`IdUrlRegistry::same`] where rotated aliases must compare equal.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize, Serialize, Deserialize,
)]
pub struct IdUrl(String);

impl IdUrl {
    pub fn new(text: &str) -> Self {
        IdUrl(text.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `user@host` form used in global ids, e.g. `http://idhost.org/alice.xml` →
    /// `alice@idhost.org`.
    pub fn to_global_form(&self) -> String {
        let stripped = self
            .0
            .strip_prefix("http://")
            .or_else(|| self.0.strip_prefix("https://"))
            .unwrap_or(&self.0);
        match stripped.split_once('/') {
            Some((host, file)) => {
                let name = file.strip_suffix(".xml").unwrap_or(file);
                format!("{}@{}", name, host)
            }
            None => stripped.to_string(),
        }
    }
}

impl Display for IdUrl {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct RegistryInner {
    /// Every IDURL ever bound, mapped to the public key that signed its document.
    key_of: HashMap<IdUrl, VerifyingKeyBytes>,
    /// Forward index: public key → the IDURL with the highest revision seen so far.
    latest_of: HashMap<VerifyingKeyBytes, IdUrl>,
}

/// Process-wide record of which public key stands behind which IDURL.
///
/// Cloning is cheap and shares the underlying state.
#[derive(Clone)]
pub struct IdUrlRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl IdUrlRegistry {
    pub fn new() -> Self {
        IdUrlRegistry {
            inner: Arc::new(Mutex::new(RegistryInner {
                key_of: HashMap::new(),
                latest_of: HashMap::new(),
            })),
        }
    }

    /// Records that `idurl`'s document is signed by `key`, and that `idurl` is the newest
    /// location known for that key. Returns the previous latest IDURL if this binding rotated
    /// the identity to a new location.
    pub fn bind(&self, idurl: &IdUrl, key: VerifyingKeyBytes) -> Option<IdUrl> {
        let mut inner = self.inner.lock().unwrap();
        inner.key_of.insert(idurl.clone(), key);
        let previous = inner.latest_of.insert(key, idurl.clone());
        previous.filter(|prev| prev != idurl)
    }

    /// Records that `idurl` also serves the identity behind `key`, without making it that
    /// identity's latest location.
    pub fn bind_alias(&self, idurl: &IdUrl, key: VerifyingKeyBytes) {
        self.inner.lock().unwrap().key_of.insert(idurl.clone(), key);
    }

    /// The public key bound to `idurl`, if any document from it was ever accepted.
    pub fn key_of(&self, idurl: &IdUrl) -> Option<VerifyingKeyBytes> {
        self.inner.lock().unwrap().key_of.get(idurl).copied()
    }

    /// The newest IDURL known for the identity behind `idurl`. Falls back to `idurl` itself
    /// when the identity was never bound.
    pub fn latest(&self, idurl: &IdUrl) -> IdUrl {
        let inner = self.inner.lock().unwrap();
        inner
            .key_of
            .get(idurl)
            .and_then(|key| inner.latest_of.get(key))
            .cloned()
            .unwrap_or_else(|| idurl.clone())
    }

    /// Rotation-aware identity comparison: true iff the two IDURLs are textually equal or are
    /// bound to the same public key.
    pub fn same(&self, a: &IdUrl, b: &IdUrl) -> bool {
        if a == b {
            return true;
        }
        let inner = self.inner.lock().unwrap();
        match (inner.key_of.get(a), inner.key_of.get(b)) {
            (Some(key_a), Some(key_b)) => key_a == key_b,
            _ => false,
        }
    }

    /// Drops every binding for `idurl` (explicit forget).
    pub fn forget(&self, idurl: &IdUrl) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(key) = inner.key_of.remove(idurl) {
            let latest_is_this = inner.latest_of.get(&key) == Some(idurl);
            if latest_is_this {
                inner.latest_of.remove(&key);
            }
        }
    }
}

impl Default for IdUrlRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> VerifyingKeyBytes {
        VerifyingKeyBytes::new([byte; 32])
    }

    #[test]
    fn binding_rotates_latest() {
        let registry = IdUrlRegistry::new();
        let old = IdUrl::new("http://srv1/p.xml");
        let new = IdUrl::new("http://srv2/p.xml");

        assert!(registry.bind(&old, key(1)).is_none());
        assert_eq!(registry.latest(&old), old);

        let rotated_from = registry.bind(&new, key(1));
        assert_eq!(rotated_from, Some(old.clone()));
        assert_eq!(registry.latest(&old), new);
        assert!(registry.same(&old, &new));
    }

    #[test]
    fn different_keys_are_different_identities() {
        let registry = IdUrlRegistry::new();
        let a = IdUrl::new("http://srv1/a.xml");
        let b = IdUrl::new("http://srv1/b.xml");
        registry.bind(&a, key(1));
        registry.bind(&b, key(2));
        assert!(!registry.same(&a, &b));
        assert_eq!(registry.latest(&a), a);
    }

    #[test]
    fn global_form() {
        assert_eq!(
            IdUrl::new("http://idhost.org/alice.xml").to_global_form(),
            "alice@idhost.org"
        );
    }
}
