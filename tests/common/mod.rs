/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! In-memory providers and scripted peers shared by the integration tests.
//!
//! The [`Hub`] is a process-local network: every participant joins it under its IDURL and gets
//! a [`HubNetwork`] that delivers packets into per-recipient inboxes. Nodes under test plug a
//! `HubNetwork` into their [`NodeSpec`](bitdust_core::node::NodeSpec); scripted peers (brokers,
//! suppliers) run as [`Peer`] actor threads answering packets from a behavior closure.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, Once};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bitdust_core::dht::{BrokerEntry, Dht, DhtError};
use bitdust_core::group::messages::{AcceptedReply, QueueMessage};
use bitdust_core::identity_cache::{FetchError, IdentitySource};
use bitdust_core::logging::setup_logger;
use bitdust_core::messages::{
    AckInfo, Command, DataPacket, FailInfo, FilesReport, QueueMessagesChunk, SignedPacket,
};
use bitdust_core::networking::{Network, CHANNEL_GROUP};
use bitdust_core::pluggables::{FragmentStore, KVGet, KVStore};
use bitdust_core::types::basic::{BrokerPos, Channel, SequenceId};
use bitdust_core::types::identity::IdentityDocument;
use bitdust_core::types::idurl::IdUrl;
use bitdust_core::types::keypair::Keypair;
use bitdust_core::types::packet_id::{BackupId, PacketId};

static LOGGER: Once = Once::new();

pub fn init_logger() {
    LOGGER.call_once(|| {
        let _ = setup_logger(log::LevelFilter::Info);
    });
}

// The in-memory network.

/// One per-recipient inbox per joined IDURL.
#[derive(Clone)]
pub struct Hub {
    inboxes: Arc<Mutex<HashMap<IdUrl, VecDeque<(IdUrl, SignedPacket)>>>>,
}

impl Hub {
    pub fn new() -> Hub {
        Hub {
            inboxes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn join(&self, me: &IdUrl) -> HubNetwork {
        self.inboxes
            .lock()
            .unwrap()
            .entry(me.clone())
            .or_default();
        HubNetwork {
            me: me.clone(),
            hub: self.clone(),
        }
    }
}

#[derive(Clone)]
pub struct HubNetwork {
    me: IdUrl,
    hub: Hub,
}

impl Network for HubNetwork {
    fn send(&mut self, peer: &IdUrl, packet: SignedPacket) {
        let mut inboxes = self.hub.inboxes.lock().unwrap();
        inboxes
            .entry(peer.clone())
            .or_default()
            .push_back((self.me.clone(), packet));
    }

    fn recv(&mut self) -> Option<(IdUrl, SignedPacket)> {
        let mut inboxes = self.hub.inboxes.lock().unwrap();
        inboxes.get_mut(&self.me)?.pop_front()
    }
}

// In-memory storage providers.

#[derive(Clone)]
pub struct MemoryKV(Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>);

impl MemoryKV {
    pub fn new() -> MemoryKV {
        MemoryKV(Arc::new(Mutex::new(HashMap::new())))
    }
}

impl KVGet for MemoryKV {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(key).cloned()
    }
}

impl KVStore for MemoryKV {
    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.0.lock().unwrap().insert(key.to_vec(), value.to_vec());
    }

    fn delete(&mut self, key: &[u8]) {
        self.0.lock().unwrap().remove(key);
    }
}

#[derive(Clone)]
pub struct MemoryFragments(Arc<Mutex<HashMap<PacketId, Vec<u8>>>>);

impl MemoryFragments {
    pub fn new() -> MemoryFragments {
        MemoryFragments(Arc::new(Mutex::new(HashMap::new())))
    }
}

impl FragmentStore for MemoryFragments {
    fn has(&self, packet_id: &PacketId) -> bool {
        self.0.lock().unwrap().contains_key(packet_id)
    }

    fn put(&mut self, packet_id: &PacketId, data: &[u8]) {
        self.0.lock().unwrap().insert(packet_id.clone(), data.to_vec());
    }

    fn get(&self, packet_id: &PacketId) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(packet_id).cloned()
    }

    fn delete(&mut self, packet_id: &PacketId) {
        self.0.lock().unwrap().remove(packet_id);
    }

    fn list(&self, backup_id: &BackupId) -> Vec<PacketId> {
        self.0
            .lock()
            .unwrap()
            .keys()
            .filter(|piece| &piece.backup_id == backup_id)
            .cloned()
            .collect()
    }
}

/// A DHT whose broker records live in a shared map. Reads and writes are instantaneous.
#[derive(Clone)]
pub struct ScriptedDht {
    records: Arc<Mutex<HashMap<IdUrl, BTreeMap<BrokerPos, IdUrl>>>>,
}

impl ScriptedDht {
    pub fn new() -> ScriptedDht {
        ScriptedDht {
            records: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn brokers_of(&self, customer: &IdUrl) -> BTreeMap<BrokerPos, IdUrl> {
        self.records
            .lock()
            .unwrap()
            .get(customer)
            .cloned()
            .unwrap_or_default()
    }
}

impl Dht for ScriptedDht {
    fn read_brokers(
        &mut self,
        customer: &IdUrl,
        positions: &[BrokerPos],
        _use_cache: bool,
    ) -> Result<Vec<BrokerEntry>, DhtError> {
        let records = self.records.lock().unwrap();
        let Some(entries) = records.get(customer) else {
            return Ok(Vec::new());
        };
        Ok(positions
            .iter()
            .filter_map(|position| {
                entries.get(position).map(|idurl| BrokerEntry {
                    position: *position,
                    idurl: idurl.clone(),
                })
            })
            .collect())
    }

    fn write_broker(
        &mut self,
        customer: &IdUrl,
        entry: &BrokerEntry,
        _ttl: Duration,
    ) -> Result<(), DhtError> {
        self.records
            .lock()
            .unwrap()
            .entry(customer.clone())
            .or_default()
            .insert(entry.position, entry.idurl.clone());
        Ok(())
    }

    fn erase_broker(&mut self, customer: &IdUrl, position: BrokerPos) -> Result<(), DhtError> {
        if let Some(entries) = self.records.lock().unwrap().get_mut(customer) {
            entries.remove(&position);
        }
        Ok(())
    }

    fn clear_brokers_cache(&mut self, _customer: &IdUrl) {}
}

/// An identity source backed by a map of pre-registered documents.
pub struct MapIdentitySource {
    docs: Mutex<HashMap<IdUrl, IdentityDocument>>,
}

impl MapIdentitySource {
    pub fn new() -> MapIdentitySource {
        MapIdentitySource {
            docs: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, idurl: &IdUrl, doc: IdentityDocument) {
        self.docs.lock().unwrap().insert(idurl.clone(), doc);
    }
}

impl IdentitySource for MapIdentitySource {
    fn fetch(&self, idurl: &IdUrl, _timeout: Duration) -> Result<IdentityDocument, FetchError> {
        self.docs
            .lock()
            .unwrap()
            .get(idurl)
            .cloned()
            .ok_or(FetchError::Unreachable)
    }
}

// Scripted peers.

/// A scripted peer's sending half: signs outgoing packets with the peer's keypair.
pub struct PeerIo {
    pub idurl: IdUrl,
    pub keypair: Keypair,
    net: HubNetwork,
}

impl PeerIo {
    pub fn send(&mut self, to: &IdUrl, channel: &str, packet_id: &str, command: Command) {
        let packet = SignedPacket::new(
            &self.keypair,
            self.idurl.clone(),
            Channel::new(channel),
            packet_id.to_string(),
            command,
        );
        self.net.send(to, packet);
    }

    pub fn ack(&mut self, to: &IdUrl, request: &SignedPacket, payload: Vec<u8>) {
        self.send(
            to,
            request.channel.as_str(),
            &request.packet_id,
            Command::Ack(AckInfo { payload }),
        );
    }

    pub fn fail(&mut self, to: &IdUrl, request: &SignedPacket, reason: &str) {
        self.send(
            to,
            request.channel.as_str(),
            &request.packet_id,
            Command::Fail(FailInfo {
                reason: reason.to_string(),
            }),
        );
    }

    pub fn recv_wait(&mut self, timeout: Duration) -> Option<(IdUrl, SignedPacket)> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(received) = self.net.recv() {
                return Some(received);
            }
            thread::sleep(Duration::from_millis(2));
        }
        None
    }
}

/// One scripted peer: a keypair, an IDURL joined to the hub, and a log of everything received.
pub struct Peer {
    pub io: PeerIo,
    pub received: Arc<Mutex<Vec<SignedPacket>>>,
}

impl Peer {
    pub fn new(hub: &Hub, url: &str) -> Peer {
        let idurl = IdUrl::new(url);
        let net = hub.join(&idurl);
        Peer {
            io: PeerIo {
                idurl,
                keypair: Keypair::generate(),
                net,
            },
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The peer's signed identity document, for seeding a [`MapIdentitySource`].
    pub fn identity(&self, name: &str) -> IdentityDocument {
        IdentityDocument::new_signed(
            &self.io.keypair,
            name,
            vec![self.io.idurl.clone()],
            vec!["tcp://127.0.0.1:7771".to_string()],
            1,
        )
    }

    /// Packets received so far whose command satisfies `matches`.
    pub fn received_matching(
        &self,
        matches: impl Fn(&SignedPacket) -> bool,
    ) -> Vec<SignedPacket> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|packet| matches(packet))
            .cloned()
            .collect()
    }

    /// Runs the peer as an actor thread: every inbound packet is logged and handed to
    /// `behavior`. Returns a handle that stops and joins the thread.
    pub fn run(
        mut self,
        mut behavior: impl FnMut(&mut PeerIo, &IdUrl, SignedPacket) + Send + 'static,
    ) -> PeerThread {
        let stop = Arc::new(AtomicBool::new(false));
        let stopping = stop.clone();
        let received = self.received.clone();
        let thread = thread::spawn(move || loop {
            if stopping.load(Ordering::Relaxed) {
                return;
            }
            match self.io.net.recv() {
                Some((origin, packet)) => {
                    received.lock().unwrap().push(packet.clone());
                    behavior(&mut self.io, &origin, packet);
                }
                None => thread::sleep(Duration::from_millis(2)),
            }
        });
        PeerThread { stop, thread }
    }
}

pub struct PeerThread {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl PeerThread {
    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.thread.join();
    }
}

/// A message broker: accepts handshakes and `queue-connect` with the given cooperation set,
/// acks `Consume`, and (unless `ack_produce` is false) acks every `Produce` and echoes it back
/// as a one-message queue chunk with the next sequence id.
pub fn broker_behavior(
    cooperated: BTreeMap<u8, IdUrl>,
    ack_produce: bool,
) -> impl FnMut(&mut PeerIo, &IdUrl, SignedPacket) + Send + 'static {
    let mut sequences: HashMap<String, i64> = HashMap::new();
    move |io, origin, packet| match packet.command.clone() {
        Command::Identity(_) => io.ack(origin, &packet, Vec::new()),
        Command::RequestService(_) => {
            let reply = AcceptedReply {
                cooperated_brokers: cooperated.clone(),
                archive_folder_path: None,
            };
            let text = format!(
                "accepted:{}",
                serde_json::to_string(&reply).expect("accepted reply serializes")
            );
            io.ack(origin, &packet, text.into_bytes());
        }
        Command::Consume(request) => {
            sequences
                .entry(request.queue_id)
                .or_insert(request.last_sequence_id.int());
            io.ack(origin, &packet, Vec::new());
        }
        Command::Produce(request) => {
            if !ack_produce {
                return;
            }
            io.ack(origin, &packet, Vec::new());
            let sequence = sequences.entry(request.queue_id.clone()).or_insert(0);
            *sequence += 1;
            let sequence_id = SequenceId::new(*sequence);
            let message = QueueMessage::new(sequence_id, &request.producer_id, &request.payload);
            io.send(
                origin,
                CHANNEL_GROUP,
                &format!("{}:chunk:{}", request.queue_id, sequence),
                Command::QueueMessages(QueueMessagesChunk {
                    queue_id: request.queue_id,
                    messages_json: QueueMessage::encode_list(&[message]),
                    latest_sequence_id: sequence_id,
                }),
            );
        }
        Command::QueueDisconnect(_) => io.ack(origin, &packet, Vec::new()),
        Command::Ack(_) | Command::Fail(_) => (),
        _ => io.fail(origin, &packet, "unsupported command"),
    }
}

/// A storage supplier: answers `ListFiles` with an empty report, stores `Data` uploads, serves
/// them back on `Retrieve`, and acks deletions.
pub fn supplier_behavior() -> impl FnMut(&mut PeerIo, &IdUrl, SignedPacket) + Send + 'static {
    let mut stored: HashMap<String, Vec<u8>> = HashMap::new();
    move |io, origin, packet| match packet.command.clone() {
        Command::Identity(_) => io.ack(origin, &packet, Vec::new()),
        Command::ListFiles(_) => io.send(
            origin,
            packet.channel.as_str(),
            &packet.packet_id,
            Command::Files(FilesReport {
                payload: Vec::new(),
            }),
        ),
        Command::Data(data) => {
            stored.insert(data.packet_id, data.payload);
            io.ack(origin, &packet, Vec::new());
        }
        Command::Retrieve(request) => match stored.get(&request.packet_id) {
            Some(payload) => io.send(
                origin,
                packet.channel.as_str(),
                &packet.packet_id,
                Command::Data(DataPacket {
                    packet_id: request.packet_id,
                    payload: payload.clone(),
                }),
            ),
            None => io.fail(origin, &packet, "no such packet"),
        },
        Command::DeleteFile(_) => io.ack(origin, &packet, Vec::new()),
        Command::Ack(_) | Command::Fail(_) => (),
        _ => io.fail(origin, &packet, "unsupported command"),
    }
}

// Assertion helpers.

/// Receives the next value from an event channel, or panics after 10 seconds.
pub fn expect_recv<T>(receiver: &Receiver<T>, what: &str) -> T {
    match receiver.recv_timeout(Duration::from_secs(10)) {
        Ok(value) => value,
        Err(_) => panic!("timed out waiting for {}", what),
    }
}

/// Polls `condition` until it holds, or panics after 10 seconds.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {}", what);
}
