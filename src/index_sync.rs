/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The index synchronizer: replicates the [catalog](crate::catalog) to every supplier and
//! restores it from them.
//!
//! The catalog travels as one opaque piece: its JSON form encrypted with the node's index key,
//! stored at every supplier under the reserved index packet id and carried on the `"index"`
//! channel. *Pull* asks every supplier for its copy and adopts the newest revision; *push*
//! broadcasts the local copy after the revision changed. A node starts in `NoInfo`, pulls until
//! at least one supplier answers, and only then considers itself synchronized; silence from
//! every supplier re-enters the request cycle after a retry interval.
//!
//! The timing and state rules live in [`SyncPlanner`], which is pure; the thread around it does
//! the wire work.

use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use serde::Deserialize;

use crate::catalog::{Catalog, INDEX_FILE_NAME, INDEX_PATH_ID};
use crate::config::IndexSyncConfiguration;
use crate::events::{Event, IndexSynchronizedEvent};
use crate::messages::{Command, DataPacket, RetrieveRequest, SignedPacket};
use crate::networking::{Network, PacketRecvError, PacketStub, CHANNEL_INDEX};
use crate::pluggables::KVStore;
use crate::types::basic::{Channel, Revision};
use crate::types::idurl::IdUrl;
use crate::types::packet_id::GlobalId;
use crate::types::symkey::GroupKey;

const TICK: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SyncState {
    /// Never heard from any supplier; the local catalog is not trusted for destructive work.
    NoInfo,
    /// A pull went out and no supplier has answered yet.
    Request,
    /// A push broadcast is in flight.
    Sending,
    InSync,
}

pub(crate) enum SyncAction {
    Pull,
    Push,
}

/// Pure timing and state bookkeeping of the synchronizer.
pub(crate) struct SyncPlanner {
    pub(crate) state: SyncState,
    last_pull_attempt: Option<Instant>,
    last_pull_success: Option<Instant>,
    last_push_attempt: Option<Instant>,
    /// The revision the suppliers are known to hold.
    pushed_revision: Revision,
}

impl SyncPlanner {
    pub(crate) fn new() -> SyncPlanner {
        SyncPlanner {
            state: SyncState::NoInfo,
            last_pull_attempt: None,
            last_pull_success: None,
            last_push_attempt: None,
            pushed_revision: Revision::new(0),
        }
    }

    pub(crate) fn next_action(
        &self,
        now: Instant,
        local_revision: Revision,
        config: &IndexSyncConfiguration,
    ) -> Option<SyncAction> {
        match self.state {
            SyncState::NoInfo => Some(SyncAction::Pull),
            SyncState::Request => match self.last_pull_attempt {
                Some(at) if now.duration_since(at) < config.request_retry_interval => None,
                _ => Some(SyncAction::Pull),
            },
            SyncState::Sending => None,
            SyncState::InSync => {
                if local_revision != self.pushed_revision {
                    match self.last_push_attempt {
                        Some(at)
                            if now.duration_since(at) < config.request_retry_interval =>
                        {
                            None
                        }
                        _ => Some(SyncAction::Push),
                    }
                } else {
                    match self.last_pull_success {
                        Some(at) if now.duration_since(at) >= config.pull_interval => {
                            Some(SyncAction::Pull)
                        }
                        _ => None,
                    }
                }
            }
        }
    }

    pub(crate) fn note_pull_attempt(&mut self, now: Instant) {
        self.last_pull_attempt = Some(now);
        if self.state != SyncState::InSync {
            self.state = SyncState::Request;
        }
    }

    /// Records a completed pull: the suppliers' newest revision is `remote_revision`.
    pub(crate) fn note_pull_success(&mut self, now: Instant, remote_revision: Revision) {
        self.last_pull_success = Some(now);
        self.pushed_revision = remote_revision;
        self.state = SyncState::InSync;
    }

    pub(crate) fn note_push_attempt(&mut self, now: Instant) {
        self.last_push_attempt = Some(now);
    }

    pub(crate) fn note_push_success(&mut self, revision: Revision) {
        self.pushed_revision = revision;
        self.state = SyncState::InSync;
    }

    /// Forces a fresh pull on the next tick without losing the in-sync baseline.
    pub(crate) fn request_pull(&mut self) {
        self.last_pull_attempt = None;
        self.last_pull_success = None;
        if self.state == SyncState::InSync {
            self.state = SyncState::Request;
        }
    }
}

/// Decrypts and probes one remote index copy. Returns its revision and the decrypted JSON.
pub(crate) fn decode_remote_index(key: &GroupKey, payload: &[u8]) -> Option<(Revision, Vec<u8>)> {
    #[derive(Deserialize)]
    struct RevisionProbe {
        revision: Revision,
    }
    let json = key.decrypt(payload).ok()?;
    let probe: RevisionProbe = serde_json::from_slice(&json).ok()?;
    Some((probe.revision, json))
}

enum IndexCommand {
    Synchronize,
}

/// Client of the index-sync thread.
#[derive(Clone)]
pub struct IndexHandle {
    commands: Sender<IndexCommand>,
}

impl IndexHandle {
    /// Forces a pull (and, if the revision moved, a push) on the next tick.
    pub fn synchronize(&self) {
        let _ = self.commands.send(IndexCommand::Synchronize);
    }
}

pub(crate) fn start_index_sync<N: Network + 'static, K: KVStore>(
    stub: PacketStub<N>,
    catalog: Catalog,
    kv: K,
    suppliers: Vec<IdUrl>,
    index_key: GroupKey,
    config: IndexSyncConfiguration,
    event_publisher: Option<Sender<Event>>,
    shutdown_signal: Receiver<()>,
) -> (JoinHandle<()>, IndexHandle) {
    let (commands, command_receiver) = mpsc::channel();
    let thread = thread::spawn(move || {
        let mut service = IndexSyncService {
            stub,
            catalog,
            kv,
            suppliers,
            index_key,
            config,
            planner: SyncPlanner::new(),
            event_publisher,
        };
        loop {
            match shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("Index sync thread disconnected from main thread")
                }
            }

            match command_receiver.recv_timeout(TICK) {
                Ok(IndexCommand::Synchronize) => service.planner.request_pull(),
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => {
                    panic!("Index sync thread disconnected from main thread")
                }
            }

            while let Some((origin, packet)) = service.stub.try_recv() {
                service.drop_unsolicited(origin, packet);
            }

            let action =
                service
                    .planner
                    .next_action(Instant::now(), service.catalog.revision(), &service.config);
            match action {
                Some(SyncAction::Pull) => service.pull(),
                Some(SyncAction::Push) => service.push(),
                None => (),
            }
        }
    });
    (thread, IndexHandle { commands })
}

struct IndexSyncService<N: Network, K: KVStore> {
    stub: PacketStub<N>,
    catalog: Catalog,
    kv: K,
    suppliers: Vec<IdUrl>,
    index_key: GroupKey,
    config: IndexSyncConfiguration,
    planner: SyncPlanner,
    event_publisher: Option<Sender<Event>>,
}

impl<N: Network, K: KVStore> IndexSyncService<N, K> {
    /// The packet id the index file is stored under at every supplier.
    fn index_wire_id(&self) -> String {
        let customer = GlobalId::new(None, &self.stub.me().to_global_form());
        format!("{}:{}/{}", customer, INDEX_PATH_ID, INDEX_FILE_NAME)
    }

    fn pull(&mut self) {
        let now = Instant::now();
        self.planner.note_pull_attempt(now);
        if self.suppliers.is_empty() {
            return;
        }
        let wire = self.index_wire_id();
        let mut outstanding = HashSet::new();
        for supplier in self.suppliers.clone() {
            let packet_id = format!("{}:{}", wire, rand::random::<u32>());
            self.stub.send_command(
                &supplier,
                Channel::new(CHANNEL_INDEX),
                packet_id.clone(),
                Command::Retrieve(RetrieveRequest {
                    packet_id: wire.clone(),
                }),
            );
            outstanding.insert(packet_id);
        }

        let total = outstanding.len();
        let deadline = Instant::now() + self.config.ack_timeout;
        let mut best: Option<(Revision, Vec<u8>)> = None;
        while !outstanding.is_empty() {
            let received = self.stub.recv_matching(deadline, |_, packet| {
                outstanding.contains(&packet.packet_id)
                    && matches!(packet.command, Command::Data(_) | Command::Fail(_))
            });
            let (origin, packet) = match received {
                Ok(received) => received,
                Err(PacketRecvError::Timeout) | Err(PacketRecvError::Disconnected) => break,
            };
            outstanding.remove(&packet.packet_id);
            match packet.command {
                Command::Data(data) => {
                    match decode_remote_index(&self.index_key, &data.payload) {
                        Some((revision, json)) => {
                            let newer = best
                                .as_ref()
                                .map_or(true, |(best_revision, _)| revision > *best_revision);
                            if newer {
                                best = Some((revision, json));
                            }
                        }
                        None => log::warn!("unreadable index copy from {}", origin),
                    }
                }
                Command::Fail(info) => {
                    log::debug!("supplier {} holds no index copy: {}", origin, info.reason)
                }
                _ => (),
            }
        }
        let answered = total - outstanding.len();

        let local = self.catalog.revision();
        match best {
            Some((revision, json)) if revision > local => {
                if self.catalog.absorb_json(&json).is_some() {
                    self.catalog.save(&mut self.kv);
                    self.catalog.mark_synchronized();
                    self.planner.note_pull_success(now, revision);
                    log::info!("index restored from suppliers at revision {}", revision);
                    self.publish_synchronized(revision);
                } else {
                    log::warn!("newest remote index copy does not decode, keeping local");
                }
            }
            Some((revision, _)) => {
                // Local copy is the newest; the revision gap triggers a push.
                self.catalog.mark_synchronized();
                self.planner.note_pull_success(now, revision);
                self.publish_synchronized(local);
            }
            None if answered > 0 => {
                // Every answering supplier holds nothing: a fresh fleet. The local catalog is
                // authoritative.
                self.catalog.mark_synchronized();
                self.planner.note_pull_success(now, Revision::new(0));
                self.publish_synchronized(local);
            }
            None => log::debug!("no supplier answered the index pull"),
        }
    }

    fn push(&mut self) {
        let now = Instant::now();
        self.planner.note_push_attempt(now);
        self.planner.state = SyncState::Sending;
        let revision = self.catalog.revision();
        let json = self.catalog.to_json();
        let payload = match self.index_key.encrypt(&json) {
            Ok(payload) => payload,
            Err(err) => {
                log::error!("index encryption failed: {}", err);
                self.planner.state = SyncState::InSync;
                return;
            }
        };
        self.catalog.save(&mut self.kv);

        let wire = self.index_wire_id();
        let mut outstanding = HashSet::new();
        for supplier in self.suppliers.clone() {
            let packet_id = format!("{}:{}", wire, rand::random::<u32>());
            self.stub.send_command(
                &supplier,
                Channel::new(CHANNEL_INDEX),
                packet_id.clone(),
                Command::Data(DataPacket {
                    packet_id: wire.clone(),
                    payload: payload.clone(),
                }),
            );
            outstanding.insert(packet_id);
        }

        let deadline = Instant::now() + self.config.ack_timeout;
        let mut acked = 0usize;
        while !outstanding.is_empty() {
            let received = self.stub.recv_matching(deadline, |_, packet| {
                outstanding.contains(&packet.packet_id)
                    && matches!(packet.command, Command::Ack(_) | Command::Fail(_))
            });
            let (origin, packet) = match received {
                Ok(received) => received,
                Err(PacketRecvError::Timeout) | Err(PacketRecvError::Disconnected) => break,
            };
            outstanding.remove(&packet.packet_id);
            match packet.command {
                Command::Ack(_) => acked += 1,
                Command::Fail(info) => {
                    log::warn!("supplier {} refused the index: {}", origin, info.reason)
                }
                _ => (),
            }
        }

        if acked > 0 {
            log::info!(
                "index revision {} stored at {}/{} suppliers",
                revision,
                acked,
                self.suppliers.len()
            );
            self.planner.note_push_success(revision);
            self.publish_synchronized(revision);
        } else {
            log::warn!("no supplier stored index revision {}", revision);
            self.planner.state = SyncState::InSync;
        }
    }

    fn drop_unsolicited(&mut self, origin: IdUrl, packet: SignedPacket) {
        log::debug!(
            "dropping unsolicited {} from {} on the index channel",
            packet.command_name(),
            origin
        );
    }

    fn publish_synchronized(&self, revision: Revision) {
        Event::publish(
            &self.event_publisher,
            Event::IndexSynchronized(IndexSynchronizedEvent {
                timestamp: SystemTime::now(),
                revision,
            }),
        );
    }
}
