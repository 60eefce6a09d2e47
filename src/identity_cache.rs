/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The process-wide identity cache.
//!
//! The cache memoizes validated peer identity documents, coalesces concurrent fetches of the
//! same IDURL into one in-flight request, falls back to a document's alternate `sources[]` when
//! its primary URL is unreachable, and detects rotation: when an accepted document's public key
//! is already bound to a different IDURL, every index (including the override map) is rewritten
//! in place so that the old and the new IDURL resolve to the same, newest document.
//!
//! The override map exists for proxy routers that need to shadow an identity without
//! propagating it: an overridden copy wins all lookups but is kept distinct from the organic
//! cached copy, and is dropped with [`IdentityCache::remove_override`] without disturbing the
//! organic one.
//!
//! Fetching the document bytes is the provider's business, through [`IdentitySource`]; the
//! cache owns validation, revision gating and rotation bookkeeping.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::events::{Event, IdentityRotatedEvent};
use crate::messages::{SignedMessage, SignedPacket};
use crate::types::basic::VerifyingKeyBytes;
use crate::types::identity::{IdentityDocument, IdentityError};
use crate::types::idurl::{IdUrl, IdUrlRegistry};

/// Fetches identity documents from their IDURLs. Implementations wrap whatever transport the
/// deployment uses (plain HTTP in production, a scripted map in tests).
pub trait IdentitySource: Send + Sync + 'static {
    fn fetch(&self, idurl: &IdUrl, timeout: Duration) -> Result<IdentityDocument, FetchError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchError {
    Timeout,
    Unreachable,
    /// The fetched bytes did not validate. Never cached.
    BadIdentity(IdentityError),
    /// The primary URL and every alternate source failed.
    AllSourcesFailed,
}

impl Display for FetchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Timeout => f.write_str("identity fetch timed out"),
            FetchError::Unreachable => f.write_str("identity source unreachable"),
            FetchError::BadIdentity(err) => write!(f, "bad identity: {}", err),
            FetchError::AllSourcesFailed => f.write_str("all identity sources failed"),
        }
    }
}

struct CacheInner {
    cached: HashMap<IdUrl, IdentityDocument>,
    overridden: HashMap<IdUrl, IdentityDocument>,
    /// Every IDURL a public key has ever been seen at; rewritten together on rotation.
    aliases: HashMap<VerifyingKeyBytes, HashSet<IdUrl>>,
    in_flight: HashMap<IdUrl, Vec<Sender<Result<IdentityDocument, FetchError>>>>,
}

#[derive(Clone)]
pub struct IdentityCache {
    inner: Arc<Mutex<CacheInner>>,
    source: Arc<dyn IdentitySource>,
    registry: IdUrlRegistry,
    event_publisher: Option<Sender<Event>>,
}

impl IdentityCache {
    pub fn new(
        source: Arc<dyn IdentitySource>,
        registry: IdUrlRegistry,
        event_publisher: Option<Sender<Event>>,
    ) -> IdentityCache {
        IdentityCache {
            inner: Arc::new(Mutex::new(CacheInner {
                cached: HashMap::new(),
                overridden: HashMap::new(),
                aliases: HashMap::new(),
                in_flight: HashMap::new(),
            })),
            source,
            registry,
            event_publisher,
        }
    }

    pub fn registry(&self) -> &IdUrlRegistry {
        &self.registry
    }

    /// `Get`: the cached document, if any. Overrides win all lookups.
    pub fn get(&self, idurl: &IdUrl) -> Option<IdentityDocument> {
        let inner = self.inner.lock().unwrap();
        if let Some(doc) = inner.overridden.get(idurl) {
            return Some(doc.clone());
        }
        inner.cached.get(idurl).cloned()
    }

    pub fn has(&self, idurl: &IdUrl) -> bool {
        self.get(idurl).is_some()
    }

    /// The newest IDURL known for the identity behind `idurl`.
    pub fn latest(&self, idurl: &IdUrl) -> IdUrl {
        self.registry.latest(idurl)
    }

    /// `GetLatest`: returns from cache, fetching only if absent.
    pub fn get_latest(
        &self,
        idurl: &IdUrl,
        timeout: Duration,
    ) -> Result<IdentityDocument, FetchError> {
        if let Some(doc) = self.get(idurl) {
            return Ok(doc);
        }
        self.fetch(idurl, timeout, true)
    }

    /// `Fetch`: fetches the document, coalescing with any in-flight fetch of the same IDURL.
    /// On failure, with `try_other_sources` and a previously known version of this identity,
    /// every URL in its `sources[]` is tried in reverse order; the fetch fails only when all
    /// sources are exhausted.
    pub fn fetch(
        &self,
        idurl: &IdUrl,
        timeout: Duration,
        try_other_sources: bool,
    ) -> Result<IdentityDocument, FetchError> {
        let prior = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(waiters) = inner.in_flight.get_mut(idurl) {
                let (sender, receiver) = mpsc::channel();
                waiters.push(sender);
                drop(inner);
                // Margin over the fetching caller's own timeout budget.
                return match receiver.recv_timeout(timeout + Duration::from_secs(5)) {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Timeout),
                };
            }
            inner.in_flight.insert(idurl.clone(), Vec::new());
            inner.cached.get(idurl).cloned()
        };

        let result = self.fetch_uncoalesced(idurl, timeout, try_other_sources, prior);

        let waiters = {
            let mut inner = self.inner.lock().unwrap();
            inner.in_flight.remove(idurl).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        result
    }

    fn fetch_uncoalesced(
        &self,
        idurl: &IdUrl,
        timeout: Duration,
        try_other_sources: bool,
        prior: Option<IdentityDocument>,
    ) -> Result<IdentityDocument, FetchError> {
        let mut last_error = match self.source.fetch(idurl, timeout) {
            Ok(doc) => match self.accept(idurl, doc) {
                Ok(doc) => return Ok(doc),
                Err(err) => FetchError::BadIdentity(err),
            },
            Err(err) => err,
        };

        if try_other_sources {
            if let Some(prior) = prior {
                for alternate in prior.sources.iter().rev() {
                    if alternate == idurl {
                        continue;
                    }
                    log::debug!(
                        "identity fetch of {} failed ({}), trying alternate source {}",
                        idurl,
                        last_error,
                        alternate
                    );
                    match self.source.fetch(alternate, timeout) {
                        Ok(doc) => match self.accept(idurl, doc) {
                            Ok(doc) => return Ok(doc),
                            Err(err) => last_error = FetchError::BadIdentity(err),
                        },
                        Err(err) => last_error = err,
                    }
                }
                return Err(FetchError::AllSourcesFailed);
            }
        }
        Err(last_error)
    }

    /// `Update`: validates and revision-gates a pushed document. Returns whether the revision
    /// was accepted; `Ok(false)` means a valid but stale copy.
    pub fn update(&self, idurl: &IdUrl, doc: IdentityDocument) -> Result<bool, IdentityError> {
        doc.validate()?;
        {
            let inner = self.inner.lock().unwrap();
            if let Some(cached) = inner.cached.get(idurl) {
                if cached.public_key == doc.public_key && cached.revision >= doc.revision {
                    return Ok(false);
                }
            }
        }
        self.accept(idurl, doc).map(|_| true)
    }

    /// `Override`: shadows an identity without propagating it. The overridden copy wins all
    /// lookups but the organic cached copy is untouched.
    pub fn override_identity(
        &self,
        idurl: &IdUrl,
        doc: IdentityDocument,
    ) -> Result<(), IdentityError> {
        doc.validate()?;
        self.inner.lock().unwrap().overridden.insert(idurl.clone(), doc);
        Ok(())
    }

    pub fn remove_override(&self, idurl: &IdUrl) {
        self.inner.lock().unwrap().overridden.remove(idurl);
    }

    /// Explicit forget: the only way an entry leaves the cache.
    pub fn forget(&self, idurl: &IdUrl) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(doc) = inner.cached.remove(idurl) {
            if let Some(aliases) = inner.aliases.get_mut(&doc.public_key) {
                aliases.remove(idurl);
            }
        }
        inner.overridden.remove(idurl);
        self.registry.forget(idurl);
    }

    /// Verifies a packet's signature against its creator's cached identity. Unknown creators
    /// fail verification.
    pub fn verify_packet(&self, packet: &SignedPacket) -> bool {
        let Some(doc) = self.get(&packet.creator) else {
            return false;
        };
        let Ok(key) = doc.verifying_key() else {
            return false;
        };
        packet.is_correct(&key)
    }

    /// Validates and indexes an accepted document, rewriting aliases on rotation.
    fn accept(
        &self,
        requested_at: &IdUrl,
        doc: IdentityDocument,
    ) -> Result<IdentityDocument, IdentityError> {
        doc.validate()?;
        let canonical = doc
            .default_source()
            .cloned()
            .ok_or(IdentityError::Malformed)?;

        let rotated_from = self.registry.bind(&canonical, doc.public_key);
        if requested_at != &canonical {
            self.registry.bind_alias(requested_at, doc.public_key);
        }

        {
            let mut inner = self.inner.lock().unwrap();
            let aliases = inner.aliases.entry(doc.public_key).or_default();
            aliases.insert(canonical.clone());
            aliases.insert(requested_at.clone());
            let aliases: Vec<IdUrl> = aliases.iter().cloned().collect();
            // Rewrite every index in place: all aliases resolve to the newest document.
            for alias in &aliases {
                inner.cached.insert(alias.clone(), doc.clone());
                if inner.overridden.contains_key(alias) {
                    inner.overridden.insert(alias.clone(), doc.clone());
                }
            }
        }

        if let Some(old_idurl) = rotated_from {
            log::info!("identity rotated: {} -> {}", old_idurl, canonical);
            Event::publish(
                &self.event_publisher,
                Event::IdentityRotated(IdentityRotatedEvent {
                    timestamp: SystemTime::now(),
                    old_idurl,
                    new_idurl: canonical,
                }),
            );
        }
        Ok(doc)
    }
}
