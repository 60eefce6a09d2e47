/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](Network) for pluggable peer-to-peer networking, as well as the internal
//! types and functions that subsystem threads use to interact with the network.
//!
//! Networking is modular: each peer is reachable by its IDURL, and providers interact with the
//! core's threads through implementations of the [`Network`] trait. The poller thread spawned by
//! [`start_polling`] drains the provider and distributes inbound packets to the subsystem
//! threads by channel: `"group"` to the group-member thread, `"supplier"` to the backup thread,
//! `"index"` to the index synchronizer, and everything else to the p2p thread (handshakes and
//! service negotiation use caller-chosen channel names).
//!
//! Each subsystem thread wraps its sending half and its inbound receiver in a [`PacketStub`],
//! whose deadline-based `recv_matching` buffers packets that arrive out of interest order
//! instead of dropping them.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::messages::{Command, SignedPacket};
use crate::types::basic::Channel;
use crate::types::idurl::IdUrl;
use crate::types::keypair::Keypair;

/// Channel consumed by the group-member thread.
pub const CHANNEL_GROUP: &str = "group";
/// Channel consumed by the backup thread (data sender, monitor, list-files).
pub const CHANNEL_SUPPLIER: &str = "supplier";
/// Channel consumed by the index synchronizer.
pub const CHANNEL_INDEX: &str = "index";
/// Default channel for handshakes and service negotiation.
pub const CHANNEL_P2P: &str = "p2p";

pub trait Network: Clone + Send + 'static {
    /// Send a packet to the specified peer without blocking. Delivery is best-effort; every
    /// caller encodes its own ack timeout and retry policy.
    fn send(&mut self, peer: &IdUrl, packet: SignedPacket);

    /// Receive a packet from any peer. Returns immediately with a `None` if no packet is
    /// available now.
    fn recv(&mut self) -> Option<(IdUrl, SignedPacket)>;
}

/// Spawns the poller thread, which polls the [`Network`] for packets and distributes them into
/// receivers for the p2p, group, supplier and index subsystems.
pub(crate) fn start_polling<N: Network + 'static>(
    mut network: N,
    shutdown_signal: Receiver<()>,
) -> (
    JoinHandle<()>,
    Receiver<(IdUrl, SignedPacket)>,
    Receiver<(IdUrl, SignedPacket)>,
    Receiver<(IdUrl, SignedPacket)>,
    Receiver<(IdUrl, SignedPacket)>,
) {
    let (to_p2p, p2p_receiver) = mpsc::channel();
    let (to_group, group_receiver) = mpsc::channel();
    let (to_supplier, supplier_receiver) = mpsc::channel();
    let (to_index, index_receiver) = mpsc::channel();

    let poller_thread = thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Poller thread disconnected from main thread")
            }
        }

        if let Some((origin, packet)) = network.recv() {
            let _ = match packet.channel.as_str() {
                CHANNEL_GROUP => to_group.send((origin, packet)),
                CHANNEL_SUPPLIER => to_supplier.send((origin, packet)),
                CHANNEL_INDEX => to_index.send((origin, packet)),
                _ => to_p2p.send((origin, packet)),
            };
        } else {
            thread::yield_now()
        }
    });

    (
        poller_thread,
        p2p_receiver,
        group_receiver,
        supplier_receiver,
        index_receiver,
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PacketRecvError {
    Timeout,
    Disconnected,
}

/// A sending and receiving end for one subsystem's packets.
///
/// `recv_matching` only returns packets the caller is currently interested in and buffers the
/// rest for later consumption in arrival order. This keeps a state machine from dropping, say,
/// a queue chunk that arrives while it is waiting for a service ack.
pub(crate) struct PacketStub<N: Network> {
    network: N,
    me: IdUrl,
    keypair: Keypair,
    receiver: Receiver<(IdUrl, SignedPacket)>,
    buffer: VecDeque<(IdUrl, SignedPacket)>,
}

impl<N: Network> PacketStub<N> {
    pub(crate) fn new(
        network: N,
        me: IdUrl,
        keypair: Keypair,
        receiver: Receiver<(IdUrl, SignedPacket)>,
    ) -> PacketStub<N> {
        PacketStub {
            network,
            me,
            keypair,
            receiver,
            buffer: VecDeque::new(),
        }
    }

    pub(crate) fn me(&self) -> &IdUrl {
        &self.me
    }

    /// Signs and sends one command to `peer`.
    pub(crate) fn send_command(
        &mut self,
        peer: &IdUrl,
        channel: Channel,
        packet_id: String,
        command: Command,
    ) {
        let packet = SignedPacket::new(&self.keypair, self.me.clone(), channel, packet_id, command);
        self.network.send(peer, packet);
    }

    pub(crate) fn send_packet(&mut self, peer: &IdUrl, packet: SignedPacket) {
        self.network.send(peer, packet);
    }

    /// Returns the next buffered or inbound packet, waiting up to `deadline`.
    pub(crate) fn recv(
        &mut self,
        deadline: Instant,
    ) -> Result<(IdUrl, SignedPacket), PacketRecvError> {
        if let Some(buffered) = self.buffer.pop_front() {
            return Ok(buffered);
        }
        self.recv_from_channel(deadline)
    }

    /// Returns the next packet satisfying `matches`, buffering every other packet that arrives
    /// before the deadline.
    pub(crate) fn recv_matching(
        &mut self,
        deadline: Instant,
        matches: impl Fn(&IdUrl, &SignedPacket) -> bool,
    ) -> Result<(IdUrl, SignedPacket), PacketRecvError> {
        if let Some(pos) = self
            .buffer
            .iter()
            .position(|(origin, packet)| matches(origin, packet))
        {
            // Indexing is safe: `pos` came from this buffer.
            return Ok(self.buffer.remove(pos).expect("buffered position exists"));
        }
        loop {
            let (origin, packet) = self.recv_from_channel(deadline)?;
            if matches(&origin, &packet) {
                return Ok((origin, packet));
            }
            self.buffer.push_back((origin, packet));
        }
    }

    /// Non-blocking receive of the next buffered or pending packet.
    pub(crate) fn try_recv(&mut self) -> Option<(IdUrl, SignedPacket)> {
        if let Some(buffered) = self.buffer.pop_front() {
            return Some(buffered);
        }
        self.receiver.try_recv().ok()
    }

    fn recv_from_channel(
        &mut self,
        deadline: Instant,
    ) -> Result<(IdUrl, SignedPacket), PacketRecvError> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(PacketRecvError::Timeout);
            }
            match self.receiver.recv_timeout(deadline - now) {
                Ok(received) => return Ok(received),
                Err(RecvTimeoutError::Timeout) => return Err(PacketRecvError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(PacketRecvError::Disconnected),
            }
        }
    }
}
