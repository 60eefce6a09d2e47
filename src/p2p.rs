/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The p2p thread: drives [handshakes](crate::handshake), performs
//! [service negotiation](crate::seeker) on behalf of the other subsystem threads, and answers
//! inbound handshakes from peers.
//!
//! Other threads talk to it through a cloneable [`P2pHandle`], whose methods block until the
//! p2p thread replies. Commands are processed serially; `ping` commands for the same
//! (peer, channel) that are already queued when a handshake starts join it and receive the same
//! result. [`P2pHandle::cancel`] aborts queued pings for a pair with
//! [`HandshakeError::Cancelled`].
//!
//! Inbound packets on the p2p channel are handled between commands: a peer's `Identity` starts
//! the passive half of a handshake (cache the document, answer `Ack`), and anything else is
//! refused with `Fail`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::config::HandshakeConfiguration;
use crate::handshake::{
    AckReply, HandshakeEffect, HandshakeError, HandshakeInput, Handshaker,
};
use crate::identity_cache::IdentityCache;
use crate::messages::{AckInfo, Command, FailInfo, RequestServiceInfo, SignedPacket};
use crate::networking::{Network, PacketRecvError, PacketStub, CHANNEL_P2P};
use crate::seeker::{self, ConnectOutcome, LookupFn};
use crate::types::basic::{Channel, ServiceName};
use crate::types::identity::IdentityDocument;
use crate::types::idurl::IdUrl;

pub(crate) enum P2pCommand {
    Ping {
        peer: IdUrl,
        channel: Channel,
        force_cache: bool,
        reply: Sender<Result<AckReply, HandshakeError>>,
    },
    Cancel {
        peer: IdUrl,
        channel: Channel,
    },
    ConnectKnown {
        peer: IdUrl,
        service: ServiceName,
        params_json: String,
        attempts: u32,
        reply: Sender<ConnectOutcome>,
    },
    ConnectRandom {
        lookup: LookupFn,
        service: ServiceName,
        params_json: String,
        attempts: u32,
        exclude: HashSet<IdUrl>,
        reply: Sender<ConnectOutcome>,
    },
}

/// Blocking client of the p2p thread. Cloneable; every subsystem thread holds one.
#[derive(Clone)]
pub struct P2pHandle {
    commands: Sender<P2pCommand>,
}

impl P2pHandle {
    /// Handshakes with `peer` on the default p2p channel. `force_cache` refreshes the peer's
    /// identity first.
    pub fn ping(&self, peer: &IdUrl, force_cache: bool) -> Result<AckReply, HandshakeError> {
        self.ping_on(peer, Channel::new(CHANNEL_P2P), force_cache)
    }

    pub fn ping_on(
        &self,
        peer: &IdUrl,
        channel: Channel,
        force_cache: bool,
    ) -> Result<AckReply, HandshakeError> {
        let (reply, result) = mpsc::channel();
        self.commands
            .send(P2pCommand::Ping {
                peer: peer.clone(),
                channel,
                force_cache,
                reply,
            })
            .map_err(|_| HandshakeError::Cancelled)?;
        result.recv().map_err(|_| HandshakeError::Cancelled)?
    }

    /// Aborts every queued ping for (peer, channel) with [`HandshakeError::Cancelled`].
    pub fn cancel(&self, peer: &IdUrl, channel: Channel) {
        let _ = self.commands.send(P2pCommand::Cancel {
            peer: peer.clone(),
            channel,
        });
    }

    pub fn connect_known_node(
        &self,
        peer: &IdUrl,
        service: &ServiceName,
        params_json: &str,
        attempts: u32,
    ) -> ConnectOutcome {
        let (reply, result) = mpsc::channel();
        let sent = self.commands.send(P2pCommand::ConnectKnown {
            peer: peer.clone(),
            service: service.clone(),
            params_json: params_json.to_string(),
            attempts,
            reply,
        });
        if sent.is_err() {
            return ConnectOutcome::LookupFailed;
        }
        result.recv().unwrap_or(ConnectOutcome::LookupFailed)
    }

    pub fn connect_random_node(
        &self,
        lookup: LookupFn,
        service: &ServiceName,
        params_json: &str,
        attempts: u32,
        exclude: HashSet<IdUrl>,
    ) -> ConnectOutcome {
        let (reply, result) = mpsc::channel();
        let sent = self.commands.send(P2pCommand::ConnectRandom {
            lookup,
            service: service.clone(),
            params_json: params_json.to_string(),
            attempts,
            exclude,
            reply,
        });
        if sent.is_err() {
            return ConnectOutcome::LookupFailed;
        }
        result.recv().unwrap_or(ConnectOutcome::LookupFailed)
    }
}

/// Spawns the p2p thread. `my_identity` is the signed document sent to peers during handshakes.
pub(crate) fn start_p2p<N: Network + 'static>(
    stub: PacketStub<N>,
    cache: IdentityCache,
    my_identity: IdentityDocument,
    config: HandshakeConfiguration,
    shutdown_signal: Receiver<()>,
) -> (JoinHandle<()>, P2pHandle) {
    let (commands, command_receiver) = mpsc::channel();
    let thread = thread::spawn(move || {
        let mut service = P2pService {
            stub,
            cache,
            my_identity,
            config,
            command_receiver,
            backlog: VecDeque::new(),
            channel_counters: HashMap::new(),
        };
        loop {
            match shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("P2p thread disconnected from main thread")
                }
            }

            if let Some(command) = service.next_command() {
                service.handle_command(command);
            } else if let Some((origin, packet)) = service.stub.try_recv() {
                service.handle_inbound(origin, packet);
            } else {
                thread::yield_now()
            }
        }
    });
    (thread, P2pHandle { commands })
}

struct P2pService<N: Network> {
    stub: PacketStub<N>,
    cache: IdentityCache,
    my_identity: IdentityDocument,
    config: HandshakeConfiguration,
    command_receiver: Receiver<P2pCommand>,
    backlog: VecDeque<P2pCommand>,
    /// Per-channel handshake counters for packet-id correlation.
    channel_counters: HashMap<Channel, u64>,
}

impl<N: Network> P2pService<N> {
    fn next_command(&mut self) -> Option<P2pCommand> {
        if let Some(command) = self.backlog.pop_front() {
            return Some(command);
        }
        self.command_receiver.try_recv().ok()
    }

    fn handle_command(&mut self, command: P2pCommand) {
        match command {
            P2pCommand::Ping {
                peer,
                channel,
                force_cache,
                reply,
            } => {
                let mut replies = vec![reply];
                replies.extend(self.drain_coalesced_pings(&peer, &channel));
                let result = self.run_handshake(&peer, channel, force_cache);
                for reply in replies {
                    let _ = reply.send(result.clone());
                }
            }
            P2pCommand::Cancel { peer, channel } => {
                for reply in self.drain_coalesced_pings(&peer, &channel) {
                    let _ = reply.send(Err(HandshakeError::Cancelled));
                }
            }
            P2pCommand::ConnectKnown {
                peer,
                service,
                params_json,
                attempts,
                reply,
            } => {
                let outcome =
                    seeker::connect_known_node(self, &peer, &service, &params_json, attempts);
                let _ = reply.send(outcome);
            }
            P2pCommand::ConnectRandom {
                mut lookup,
                service,
                params_json,
                attempts,
                exclude,
                reply,
            } => {
                let outcome = seeker::connect_random_node(
                    self,
                    &mut lookup,
                    &service,
                    &params_json,
                    attempts,
                    &exclude,
                );
                let _ = reply.send(outcome);
            }
        }
    }

    /// Pulls every queued `Ping` for (peer, channel) out of the backlog and the command queue,
    /// returning their reply senders. Other commands keep their order in the backlog.
    fn drain_coalesced_pings(
        &mut self,
        peer: &IdUrl,
        channel: &Channel,
    ) -> Vec<Sender<Result<AckReply, HandshakeError>>> {
        while let Ok(command) = self.command_receiver.try_recv() {
            self.backlog.push_back(command);
        }
        let mut replies = Vec::new();
        let mut kept = VecDeque::with_capacity(self.backlog.len());
        for command in self.backlog.drain(..) {
            match command {
                P2pCommand::Ping {
                    peer: queued_peer,
                    channel: queued_channel,
                    reply,
                    ..
                } if self.cache.registry().same(&queued_peer, peer)
                    && &queued_channel == channel =>
                {
                    replies.push(reply);
                }
                other => kept.push_back(other),
            }
        }
        self.backlog = kept;
        replies
    }

    fn next_counter(&mut self, channel: &Channel) -> u64 {
        let counter = self.channel_counters.entry(channel.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Drives one handshaker to its terminal state.
    fn run_handshake(
        &mut self,
        peer: &IdUrl,
        channel: Channel,
        force_cache: bool,
    ) -> Result<AckReply, HandshakeError> {
        let counter = self.next_counter(&channel);
        let mut machine =
            Handshaker::new(peer.clone(), channel.clone(), counter, self.config.clone());
        let first = if force_cache {
            HandshakeInput::CacheAndPing
        } else {
            HandshakeInput::Ping
        };
        let mut pending = machine.on_input(first);
        loop {
            let Some(effect) = pending.pop() else {
                // The machine only goes quiet at a terminal state.
                return Err(HandshakeError::Cancelled);
            };
            let input = match effect {
                HandshakeEffect::CacheIdentity { force } => {
                    let cached = if force {
                        self.cache
                            .fetch(peer, self.config.identity_fetch_timeout, true)
                            .is_ok()
                    } else {
                        self.cache
                            .get_latest(peer, self.config.identity_fetch_timeout)
                            .is_ok()
                    };
                    if cached {
                        HandshakeInput::CacheSucceeded
                    } else {
                        HandshakeInput::CacheFailed
                    }
                }
                HandshakeEffect::SendIdentity { packet_id } => {
                    self.stub.send_command(
                        peer,
                        channel.clone(),
                        packet_id.clone(),
                        Command::Identity(self.my_identity.clone()),
                    );
                    self.await_response(peer, &packet_id)
                }
                HandshakeEffect::Conclude(result) => return result,
            };
            pending = machine.on_input(input);
        }
    }

    /// Waits for the `Ack`/`Fail` correlated with `packet_id`, answering inbound handshakes
    /// that arrive in the meantime.
    fn await_response(&mut self, peer: &IdUrl, packet_id: &str) -> HandshakeInput {
        let deadline = Instant::now() + self.config.ack_timeout;
        loop {
            let received = self.stub.recv_matching(deadline, |_, packet| {
                packet.packet_id == packet_id
                    && matches!(packet.command, Command::Ack(_) | Command::Fail(_))
            });
            let (origin, packet) = match received {
                Ok(received) => received,
                Err(PacketRecvError::Timeout) | Err(PacketRecvError::Disconnected) => {
                    return HandshakeInput::AckTimedOut
                }
            };
            if !self.cache.registry().same(&origin, peer)
                && !self.cache.registry().same(&packet.creator, peer)
            {
                log::warn!(
                    "ignoring {} from unrelated peer {} while handshaking {}",
                    packet.command_name(),
                    origin,
                    peer
                );
                continue;
            }
            match packet.command {
                Command::Ack(info) => {
                    return HandshakeInput::AckReceived(AckReply {
                        origin: packet.creator,
                        packet_id: packet.packet_id,
                        payload: info.payload,
                    })
                }
                Command::Fail(info) => return HandshakeInput::FailReceived(info.reason),
                _ => unreachable!("recv_matching only passes Ack and Fail"),
            }
        }
    }

    /// Passive handshake half and service refusal for inbound packets.
    fn handle_inbound(&mut self, origin: IdUrl, packet: SignedPacket) {
        match packet.command.clone() {
            Command::Identity(doc) => {
                match self.cache.update(&packet.creator, doc) {
                    Ok(accepted) => {
                        if !accepted {
                            log::debug!("stale identity push from {}", packet.creator);
                        }
                        self.stub.send_command(
                            &origin,
                            packet.channel,
                            packet.packet_id,
                            Command::Ack(AckInfo {
                                payload: Vec::new(),
                            }),
                        );
                    }
                    Err(err) => {
                        log::warn!("rejecting identity push from {}: {}", packet.creator, err);
                        self.stub.send_command(
                            &origin,
                            packet.channel,
                            packet.packet_id,
                            Command::Fail(FailInfo {
                                reason: format!("identity rejected: {}", err),
                            }),
                        );
                    }
                }
            }
            Command::RequestService(info) => {
                // This node hosts no services for peers.
                self.stub.send_command(
                    &origin,
                    packet.channel,
                    packet.packet_id,
                    Command::Fail(FailInfo {
                        reason: format!("service {} not supported", info.service),
                    }),
                );
            }
            other => {
                log::debug!(
                    "dropping unexpected {} from {} on the p2p channel",
                    packet.command_name(),
                    origin
                );
                drop(other);
            }
        }
    }
}

impl<N: Network> seeker::SeekerDriver for P2pService<N> {
    fn handshake(&mut self, peer: &IdUrl, force_cache: bool) -> Result<(), HandshakeError> {
        self.run_handshake(peer, Channel::new(CHANNEL_P2P), force_cache)
            .map(|_| ())
    }

    fn request_service(
        &mut self,
        peer: &IdUrl,
        service: &ServiceName,
        params_json: &str,
    ) -> Result<String, String> {
        let channel = Channel::new(CHANNEL_P2P);
        let counter = self.next_counter(&channel);
        let packet_id = format!("{}:{}:service:{}", channel, counter, rand::random::<u32>());
        self.stub.send_command(
            peer,
            channel,
            packet_id.clone(),
            Command::RequestService(RequestServiceInfo {
                service: service.clone(),
                params_json: params_json.as_bytes().to_vec(),
            }),
        );
        match self.await_response(peer, &packet_id) {
            HandshakeInput::AckReceived(reply) => {
                Ok(String::from_utf8_lossy(&reply.payload).to_string())
            }
            HandshakeInput::FailReceived(reason) => Err(reason),
            _ => Err("service request timed out".to_string()),
        }
    }

    fn local_protocols(&self) -> Vec<String> {
        self.my_identity
            .contacts
            .iter()
            .filter_map(|contact| seeker::contact_protocol(contact))
            .map(str::to_string)
            .collect()
    }

    fn peer_protocols(&self, peer: &IdUrl) -> Option<Vec<String>> {
        self.cache.get(peer).map(|doc| {
            doc.contacts
                .iter()
                .filter_map(|contact| seeker::contact_protocol(contact))
                .map(str::to_string)
                .collect()
        })
    }
}
