/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-peer handshaker: a reachability probe that caches the peer's identity, sends our own
//! identity document, and waits for an `Ack` or `Fail` with bounded retries.
//!
//! One handshaker exists per (peer, channel) pair and is single-use: it walks
//! `Caching → AwaitingAck → Done` and is destroyed at its terminal status. Callers asking for
//! the same (peer, channel) while one is active join its pending list and all receive the same
//! result.
//!
//! The machine itself is pure: [`Handshaker::on_input`] maps an input to the side effects the
//! driver must perform ([`HandshakeEffect`]). The driver lives in [`crate::p2p`].

use std::fmt::{self, Display, Formatter};

use crate::config::HandshakeConfiguration;
use crate::types::basic::Channel;
use crate::types::idurl::IdUrl;

/// What a successful handshake hands back to every pending caller: the ack packet's origin (the
/// peer's current IDURL, which reflects rotation) and payload.
#[derive(Clone, Debug)]
pub struct AckReply {
    pub origin: IdUrl,
    pub packet_id: String,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeError {
    /// The peer did not respond within `ack_timeout × (ping_retries + 1)`.
    Timeout,
    /// The peer responded with `Fail`.
    Failed(String),
    /// The peer's identity could not be cached.
    NoIdentity,
    /// The handshake was cancelled by a caller.
    Cancelled,
}

impl Display for HandshakeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::Timeout => f.write_str("handshake timed out"),
            HandshakeError::Failed(reason) => write!(f, "handshake failed: {}", reason),
            HandshakeError::NoIdentity => f.write_str("peer identity could not be cached"),
            HandshakeError::Cancelled => f.write_str("handshake cancelled"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum HandshakeState {
    Caching,
    AwaitingAck,
    Done(Result<(), HandshakeError>),
}

pub(crate) enum HandshakeInput {
    /// Start with the identity cache consulted lazily.
    Ping,
    /// Start with a forced identity refresh.
    CacheAndPing,
    CacheSucceeded,
    CacheFailed,
    AckReceived(AckReply),
    FailReceived(String),
    AckTimedOut,
    Cancel,
}

pub(crate) enum HandshakeEffect {
    /// Resolve the peer's identity through the cache.
    CacheIdentity { force: bool },
    /// Sign and send our identity document to the peer, then await `Ack`/`Fail` under
    /// `ack_timeout` with the given correlation id.
    SendIdentity { packet_id: String },
    /// Deliver the result to every pending caller and destroy the machine.
    Conclude(Result<AckReply, HandshakeError>),
}

pub(crate) struct Handshaker {
    pub(crate) peer: IdUrl,
    pub(crate) channel: Channel,
    channel_counter: u64,
    unique: u32,
    cache_attempts: u32,
    ping_attempts: u32,
    config: HandshakeConfiguration,
    pub(crate) state: HandshakeState,
}

impl Handshaker {
    pub(crate) fn new(
        peer: IdUrl,
        channel: Channel,
        channel_counter: u64,
        config: HandshakeConfiguration,
    ) -> Handshaker {
        Handshaker {
            peer,
            channel,
            channel_counter,
            unique: rand::random::<u32>(),
            cache_attempts: 0,
            ping_attempts: 0,
            config,
            state: HandshakeState::Caching,
        }
    }

    /// The packet id of the current ping attempt: `<channel>:<counter>:<attempt>:<unique>`.
    pub(crate) fn packet_id(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.channel, self.channel_counter, self.ping_attempts, self.unique
        )
    }

    pub(crate) fn on_input(&mut self, input: HandshakeInput) -> Vec<HandshakeEffect> {
        match (&self.state, input) {
            (HandshakeState::Caching, HandshakeInput::Ping) => {
                self.cache_attempts = 1;
                vec![HandshakeEffect::CacheIdentity { force: false }]
            }
            (HandshakeState::Caching, HandshakeInput::CacheAndPing) => {
                self.cache_attempts = 1;
                vec![HandshakeEffect::CacheIdentity { force: true }]
            }
            (HandshakeState::Caching, HandshakeInput::CacheSucceeded) => {
                self.state = HandshakeState::AwaitingAck;
                self.ping_attempts = 0;
                vec![HandshakeEffect::SendIdentity {
                    packet_id: self.packet_id(),
                }]
            }
            (HandshakeState::Caching, HandshakeInput::CacheFailed) => {
                if self.cache_attempts <= self.config.cache_retries {
                    self.cache_attempts += 1;
                    vec![HandshakeEffect::CacheIdentity { force: true }]
                } else {
                    self.conclude(Err(HandshakeError::NoIdentity))
                }
            }
            (HandshakeState::AwaitingAck, HandshakeInput::AckReceived(reply)) => {
                self.conclude(Ok(reply))
            }
            (HandshakeState::AwaitingAck, HandshakeInput::FailReceived(reason)) => {
                self.conclude(Err(HandshakeError::Failed(reason)))
            }
            (HandshakeState::AwaitingAck, HandshakeInput::AckTimedOut) => {
                if self.ping_attempts < self.config.ping_retries {
                    self.ping_attempts += 1;
                    vec![HandshakeEffect::SendIdentity {
                        packet_id: self.packet_id(),
                    }]
                } else {
                    self.conclude(Err(HandshakeError::Timeout))
                }
            }
            (_, HandshakeInput::Cancel) => self.conclude(Err(HandshakeError::Cancelled)),
            // Late or duplicate inputs after the terminal state are no-ops.
            (HandshakeState::Done(_), _) => Vec::new(),
            _ => Vec::new(),
        }
    }

    fn conclude(&mut self, result: Result<AckReply, HandshakeError>) -> Vec<HandshakeEffect> {
        self.state = HandshakeState::Done(result.as_ref().map(|_| ()).map_err(|e| e.clone()));
        vec![HandshakeEffect::Conclude(result)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> HandshakeConfiguration {
        HandshakeConfiguration::builder()
            .cache_retries(2)
            .ping_retries(2)
            .ack_timeout(Duration::from_secs(15))
            .build()
    }

    fn handshaker() -> Handshaker {
        Handshaker::new(
            IdUrl::new("http://idhost.org/bob.xml"),
            Channel::new("p2p"),
            1,
            config(),
        )
    }

    fn reply() -> AckReply {
        AckReply {
            origin: IdUrl::new("http://idhost.org/bob.xml"),
            packet_id: "p2p:1:0:7".to_string(),
            payload: Vec::new(),
        }
    }

    #[test]
    fn happy_path() {
        let mut hs = handshaker();
        let effects = hs.on_input(HandshakeInput::Ping);
        assert!(matches!(
            effects.as_slice(),
            [HandshakeEffect::CacheIdentity { force: false }]
        ));
        let effects = hs.on_input(HandshakeInput::CacheSucceeded);
        assert!(matches!(effects.as_slice(), [HandshakeEffect::SendIdentity { .. }]));
        let effects = hs.on_input(HandshakeInput::AckReceived(reply()));
        assert!(matches!(
            effects.as_slice(),
            [HandshakeEffect::Conclude(Ok(_))]
        ));
        assert_eq!(hs.state, HandshakeState::Done(Ok(())));
    }

    #[test]
    fn cache_failures_exhaust_to_no_identity() {
        let mut hs = handshaker();
        hs.on_input(HandshakeInput::Ping);
        // 2 retries configured: the first two failures refetch, the third concludes.
        assert!(matches!(
            hs.on_input(HandshakeInput::CacheFailed).as_slice(),
            [HandshakeEffect::CacheIdentity { force: true }]
        ));
        assert!(matches!(
            hs.on_input(HandshakeInput::CacheFailed).as_slice(),
            [HandshakeEffect::CacheIdentity { force: true }]
        ));
        assert!(matches!(
            hs.on_input(HandshakeInput::CacheFailed).as_slice(),
            [HandshakeEffect::Conclude(Err(HandshakeError::NoIdentity))]
        ));
    }

    #[test]
    fn ack_timeouts_retry_then_fail() {
        let mut hs = handshaker();
        hs.on_input(HandshakeInput::Ping);
        hs.on_input(HandshakeInput::CacheSucceeded);
        let first_id = hs.packet_id();
        let effects = hs.on_input(HandshakeInput::AckTimedOut);
        let [HandshakeEffect::SendIdentity { packet_id }] = effects.as_slice() else {
            panic!("expected a re-send");
        };
        // The attempt number is part of the correlation id.
        assert_ne!(packet_id, &first_id);
        hs.on_input(HandshakeInput::AckTimedOut);
        assert!(matches!(
            hs.on_input(HandshakeInput::AckTimedOut).as_slice(),
            [HandshakeEffect::Conclude(Err(HandshakeError::Timeout))]
        ));
    }

    #[test]
    fn fail_concludes_immediately() {
        let mut hs = handshaker();
        hs.on_input(HandshakeInput::Ping);
        hs.on_input(HandshakeInput::CacheSucceeded);
        assert!(matches!(
            hs.on_input(HandshakeInput::FailReceived("busy".to_string()))
                .as_slice(),
            [HandshakeEffect::Conclude(Err(HandshakeError::Failed(_)))]
        ));
    }

    #[test]
    fn cancel_discards_from_any_state() {
        let mut hs = handshaker();
        hs.on_input(HandshakeInput::Ping);
        assert!(matches!(
            hs.on_input(HandshakeInput::Cancel).as_slice(),
            [HandshakeEffect::Conclude(Err(HandshakeError::Cancelled))]
        ));
        // Terminal: further inputs are ignored.
        assert!(hs.on_input(HandshakeInput::AckTimedOut).is_empty());
    }
}
