/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The service seeker: locate a peer, handshake with it, request a named service, and verify
//! acceptance.
//!
//! Two entry points: [`connect_random_node`] iterates a DHT lookup for candidates, filtering by
//! an exclusion set and by protocol intersection with our own identity; [`connect_known_node`]
//! targets one IDURL directly. Both return exactly one [`ConnectOutcome`].
//!
//! The peer answers a `RequestService` with an `Ack` whose text payload starts with
//! `accepted:` on success. A `mismatch:<json>` payload is not a generic failure: it carries the
//! peer's view of a broker cooperation set and is surfaced as [`ConnectOutcome::Mismatch`] so
//! the group member can re-detect brokers from it.
//!
//! The seeker is written against [`SeekerDriver`] so the whole negotiation is testable with a
//! scripted driver; the production driver lives in [`crate::p2p`].

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::handshake::HandshakeError;
use crate::types::basic::ServiceName;
use crate::types::idurl::IdUrl;

/// Yields candidate IDURLs for one random-lookup iteration.
pub type LookupFn = Box<dyn FnMut() -> Vec<IdUrl> + Send>;

/// The peer's counter-proposal from a `mismatch:<json>` reply: its view of the DHT broker
/// record and/or of the currently cooperating brokers, keyed by position.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMismatch {
    #[serde(default)]
    pub dht_brokers: Option<BTreeMap<u8, IdUrl>>,
    #[serde(default)]
    pub cooperated_brokers: Option<BTreeMap<u8, IdUrl>>,
}

impl ServiceMismatch {
    pub fn parse(json: &str) -> Option<ServiceMismatch> {
        serde_json::from_str(json).ok()
    }

    /// The cooperation set to re-detect from, preferring the broker's live view over the DHT
    /// record.
    pub fn proposed_brokers(&self) -> Option<&BTreeMap<u8, IdUrl>> {
        self.cooperated_brokers
            .as_ref()
            .or(self.dht_brokers.as_ref())
    }
}

#[derive(Clone, Debug)]
pub enum ConnectOutcome {
    /// The peer acknowledged the service request with `accepted:`. Carries the text after the
    /// prefix.
    NodeConnected { idurl: IdUrl, response: String },
    /// The peer replied `mismatch:<json>`.
    Mismatch {
        idurl: IdUrl,
        mismatch: ServiceMismatch,
    },
    /// No lookup iteration produced a usable candidate.
    LookupFailed,
    HandshakeFailed { idurl: IdUrl, error: HandshakeError },
    /// The peer denied the request, replied with `Fail`, or never acked.
    RequestFailed { idurl: IdUrl, reason: String },
}

/// The side effects the seeker needs: performed by the p2p thread in production, scripted in
/// tests.
pub(crate) trait SeekerDriver {
    fn handshake(&mut self, peer: &IdUrl, force_cache: bool) -> Result<(), HandshakeError>;

    /// Sends `RequestService(service, params_json)` and waits for the `Ack`/`Fail` under the
    /// driver's configured timeout. `Ok` carries the ack's text payload; `Err` the failure
    /// reason.
    fn request_service(
        &mut self,
        peer: &IdUrl,
        service: &ServiceName,
        params_json: &str,
    ) -> Result<String, String>;

    /// Transport protocols our own identity advertises, e.g. `["tcp", "udp"]`.
    fn local_protocols(&self) -> Vec<String>;

    /// Transport protocols the candidate's cached identity advertises. `None` when the
    /// candidate's identity is not cached yet.
    fn peer_protocols(&self, peer: &IdUrl) -> Option<Vec<String>>;
}

/// `tcp://203.0.113.7:7771` → `tcp`.
pub(crate) fn contact_protocol(contact: &str) -> Option<&str> {
    contact.split_once("://").map(|(scheme, _)| scheme)
}

fn reachable<D: SeekerDriver + ?Sized>(driver: &D, candidate: &IdUrl) -> bool {
    // Candidates with an uncached identity pass the filter; the handshake will cache and
    // re-check reachability for real.
    let Some(theirs) = driver.peer_protocols(candidate) else {
        return true;
    };
    let ours: HashSet<String> = driver.local_protocols().into_iter().collect();
    theirs.iter().any(|proto| ours.contains(proto))
}

fn negotiate<D: SeekerDriver + ?Sized>(
    driver: &mut D,
    idurl: &IdUrl,
    service: &ServiceName,
    params_json: &str,
    force_cache: bool,
) -> ConnectOutcome {
    if let Err(error) = driver.handshake(idurl, force_cache) {
        return ConnectOutcome::HandshakeFailed {
            idurl: idurl.clone(),
            error,
        };
    }
    match driver.request_service(idurl, service, params_json) {
        Ok(text) => {
            if let Some(response) = text.strip_prefix("accepted:") {
                ConnectOutcome::NodeConnected {
                    idurl: idurl.clone(),
                    response: response.to_string(),
                }
            } else if let Some(body) = text.strip_prefix("mismatch:") {
                match ServiceMismatch::parse(body) {
                    Some(mismatch) => ConnectOutcome::Mismatch {
                        idurl: idurl.clone(),
                        mismatch,
                    },
                    None => ConnectOutcome::RequestFailed {
                        idurl: idurl.clone(),
                        reason: format!("unparseable mismatch body: {}", body),
                    },
                }
            } else {
                ConnectOutcome::RequestFailed {
                    idurl: idurl.clone(),
                    reason: format!("service denied: {}", text),
                }
            }
        }
        Err(reason) => ConnectOutcome::RequestFailed {
            idurl: idurl.clone(),
            reason,
        },
    }
}

/// Iterates `lookup` up to `attempts` times, filtering candidates by `exclude` and by protocol
/// intersection, and negotiates the service with the first usable candidate of each iteration.
/// Terminal outcomes (`NodeConnected`, `Mismatch`) return immediately; failures move on to the
/// next attempt.
pub(crate) fn connect_random_node<D: SeekerDriver + ?Sized>(
    driver: &mut D,
    lookup: &mut LookupFn,
    service: &ServiceName,
    params_json: &str,
    attempts: u32,
    exclude: &HashSet<IdUrl>,
) -> ConnectOutcome {
    let mut last_failure: Option<ConnectOutcome> = None;
    for attempt in 0..attempts {
        let candidates: Vec<IdUrl> = lookup()
            .into_iter()
            .filter(|idurl| !exclude.contains(idurl))
            .filter(|idurl| reachable(driver, idurl))
            .collect();
        let Some(candidate) = candidates.first().cloned() else {
            log::debug!(
                "lookup attempt {} for {} produced no usable candidate",
                attempt,
                service
            );
            continue;
        };
        match negotiate(driver, &candidate, service, params_json, attempt > 0) {
            outcome @ (ConnectOutcome::NodeConnected { .. } | ConnectOutcome::Mismatch { .. }) => {
                return outcome
            }
            failure => last_failure = Some(failure),
        }
    }
    last_failure.unwrap_or(ConnectOutcome::LookupFailed)
}

/// Negotiates the service with a known peer, retrying up to `attempts` times. Retries force an
/// identity refresh on the handshake.
pub(crate) fn connect_known_node<D: SeekerDriver + ?Sized>(
    driver: &mut D,
    idurl: &IdUrl,
    service: &ServiceName,
    params_json: &str,
    attempts: u32,
) -> ConnectOutcome {
    let mut last_failure = ConnectOutcome::LookupFailed;
    for attempt in 0..attempts.max(1) {
        match negotiate(driver, idurl, service, params_json, attempt > 0) {
            outcome @ (ConnectOutcome::NodeConnected { .. } | ConnectOutcome::Mismatch { .. }) => {
                return outcome
            }
            failure => last_failure = failure,
        }
    }
    last_failure
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedDriver {
        handshakes: VecDeque<Result<(), HandshakeError>>,
        replies: VecDeque<Result<String, String>>,
        peer_protocols: Vec<(IdUrl, Vec<String>)>,
        requested: Vec<IdUrl>,
    }

    impl ScriptedDriver {
        fn new() -> ScriptedDriver {
            ScriptedDriver {
                handshakes: VecDeque::new(),
                replies: VecDeque::new(),
                peer_protocols: Vec::new(),
                requested: Vec::new(),
            }
        }
    }

    impl SeekerDriver for ScriptedDriver {
        fn handshake(&mut self, _peer: &IdUrl, _force_cache: bool) -> Result<(), HandshakeError> {
            self.handshakes.pop_front().unwrap_or(Ok(()))
        }

        fn request_service(
            &mut self,
            peer: &IdUrl,
            _service: &ServiceName,
            _params_json: &str,
        ) -> Result<String, String> {
            self.requested.push(peer.clone());
            self.replies
                .pop_front()
                .unwrap_or_else(|| Err("no reply scripted".to_string()))
        }

        fn local_protocols(&self) -> Vec<String> {
            vec!["tcp".to_string()]
        }

        fn peer_protocols(&self, peer: &IdUrl) -> Option<Vec<String>> {
            self.peer_protocols
                .iter()
                .find(|(idurl, _)| idurl == peer)
                .map(|(_, protos)| protos.clone())
        }
    }

    fn service() -> ServiceName {
        ServiceName::new("service_message_broker")
    }

    #[test]
    fn known_node_accepted() {
        let mut driver = ScriptedDriver::new();
        driver
            .replies
            .push_back(Ok("accepted:{\"position\": 0}".to_string()));
        let peer = IdUrl::new("http://idhost.org/broker.xml");
        let outcome = connect_known_node(&mut driver, &peer, &service(), "{}", 3);
        let ConnectOutcome::NodeConnected { idurl, response } = outcome else {
            panic!("expected NodeConnected");
        };
        assert_eq!(idurl, peer);
        assert_eq!(response, "{\"position\": 0}");
    }

    #[test]
    fn mismatch_is_typed_not_a_failure() {
        let mut driver = ScriptedDriver::new();
        driver.replies.push_back(Ok(
            "mismatch:{\"cooperated_brokers\": {\"0\": \"http://idhost.org/b0.xml\"}}".to_string(),
        ));
        let peer = IdUrl::new("http://idhost.org/broker.xml");
        let outcome = connect_known_node(&mut driver, &peer, &service(), "{}", 1);
        let ConnectOutcome::Mismatch { mismatch, .. } = outcome else {
            panic!("expected Mismatch");
        };
        let proposed = mismatch.proposed_brokers().unwrap();
        assert_eq!(
            proposed.get(&0),
            Some(&IdUrl::new("http://idhost.org/b0.xml"))
        );
    }

    #[test]
    fn denial_retries_then_reports_request_failed() {
        let mut driver = ScriptedDriver::new();
        driver.replies.push_back(Ok("denied".to_string()));
        driver.replies.push_back(Err("ack timeout".to_string()));
        let peer = IdUrl::new("http://idhost.org/broker.xml");
        let outcome = connect_known_node(&mut driver, &peer, &service(), "{}", 2);
        let ConnectOutcome::RequestFailed { reason, .. } = outcome else {
            panic!("expected RequestFailed");
        };
        assert_eq!(reason, "ack timeout");
        assert_eq!(driver.requested.len(), 2);
    }

    #[test]
    fn handshake_failure_is_reported() {
        let mut driver = ScriptedDriver::new();
        driver
            .handshakes
            .push_back(Err(HandshakeError::Timeout));
        let peer = IdUrl::new("http://idhost.org/broker.xml");
        let outcome = connect_known_node(&mut driver, &peer, &service(), "{}", 1);
        assert!(matches!(
            outcome,
            ConnectOutcome::HandshakeFailed {
                error: HandshakeError::Timeout,
                ..
            }
        ));
        assert!(driver.requested.is_empty());
    }

    #[test]
    fn random_lookup_filters_excluded_and_unreachable() {
        let mut driver = ScriptedDriver::new();
        let excluded = IdUrl::new("http://idhost.org/dead.xml");
        let udp_only = IdUrl::new("http://idhost.org/udp.xml");
        let good = IdUrl::new("http://idhost.org/good.xml");
        driver
            .peer_protocols
            .push((udp_only.clone(), vec!["udp".to_string()]));
        driver
            .peer_protocols
            .push((good.clone(), vec!["tcp".to_string()]));
        driver.replies.push_back(Ok("accepted:".to_string()));

        let candidates = vec![excluded.clone(), udp_only, good.clone()];
        let mut lookup: LookupFn = Box::new(move || candidates.clone());
        let exclude: HashSet<IdUrl> = [excluded].into_iter().collect();

        let outcome =
            connect_random_node(&mut driver, &mut lookup, &service(), "{}", 3, &exclude);
        let ConnectOutcome::NodeConnected { idurl, .. } = outcome else {
            panic!("expected NodeConnected");
        };
        assert_eq!(idurl, good);
        assert_eq!(driver.requested, vec![good]);
    }

    #[test]
    fn empty_lookups_exhaust_to_lookup_failed() {
        let mut driver = ScriptedDriver::new();
        let mut lookup: LookupFn = Box::new(Vec::new);
        let outcome = connect_random_node(
            &mut driver,
            &mut lookup,
            &service(),
            "{}",
            3,
            &HashSet::new(),
        );
        assert!(matches!(outcome, ConnectOutcome::LookupFailed));
    }
}
