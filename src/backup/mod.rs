/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The backup subsystem: presence matrices, the monitor's fire-hire/list-files/rebuild cycle,
//! and the data sender.
//!
//! All three live on one thread. Its loop is paced by the monitor heartbeat: each tick it runs
//! a monitor cycle if one is due, runs a sender scan if one is due, and otherwise absorbs
//! unsolicited supplier packets. Other threads reach it through the [`BackupHandle`].

pub mod list_files;
pub mod matrix;

pub(crate) mod monitor;
pub(crate) mod sender;

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Instant, SystemTime};

use crate::catalog::Catalog;
use crate::clock::SharedClock;
use crate::config::BackupConfiguration;
use crate::events::{
    BackupTaskFailedEvent, Event, LocalFilesCleanedEvent, RebuildStartedEvent, SupplierFiredEvent,
};
use crate::messages::{Command, DataPacket, DeleteFileRequest, ListFilesRequest, SignedPacket};
use crate::networking::{Network, PacketStub, CHANNEL_SUPPLIER};
use crate::pluggables::{paths, FragmentStore, KVStore};
use crate::types::basic::{Channel, SupplierPos};
use crate::types::idurl::IdUrl;
use crate::types::packet_id::{BackupId, GlobalId, PacketId, DEFAULT_KEY_ALIAS};

use list_files::process_raw_list_files;
use matrix::BackupMatrix;
use monitor::{BackupMonitor, MonitorState};
use sender::{DataSender, EnqueueError, SenderState};

pub(crate) enum BackupCommand {
    /// Force a full monitor cycle and a sender scan now.
    Restart,
    /// New local pieces exist; report them and scan for sends.
    NewData(Vec<PacketId>),
}

/// Client of the backup thread.
#[derive(Clone)]
pub struct BackupHandle {
    commands: Sender<BackupCommand>,
}

impl BackupHandle {
    pub fn restart(&self) {
        let _ = self.commands.send(BackupCommand::Restart);
    }

    pub fn new_data(&self, pieces: Vec<PacketId>) {
        let _ = self.commands.send(BackupCommand::NewData(pieces));
    }
}

pub(crate) fn start_backup<N: Network + 'static, K: KVStore, F: FragmentStore>(
    stub: PacketStub<N>,
    catalog: Catalog,
    matrix: BackupMatrix,
    kv: K,
    fragments: F,
    config: BackupConfiguration,
    clock: SharedClock,
    event_publisher: Option<Sender<Event>>,
    shutdown_signal: Receiver<()>,
) -> (JoinHandle<()>, BackupHandle) {
    let (commands, command_receiver) = mpsc::channel();
    let suppliers_count = config.suppliers.len();
    let thread = thread::spawn(move || {
        let mut service = BackupService {
            stub,
            catalog,
            matrix,
            kv,
            fragments,
            monitor: BackupMonitor::new(suppliers_count),
            sender: DataSender::new(
                suppliers_count,
                config.stats_window,
                config.max_outbox_depth,
                config.dead_supplier_failures,
            ),
            config,
            clock,
            event_publisher,
            packet_counter: 0,
        };
        loop {
            match shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("Backup thread disconnected from main thread")
                }
            }

            match command_receiver.recv_timeout(service.config.heartbeat) {
                Ok(BackupCommand::Restart) => {
                    service.monitor.request_restart();
                    service.sender.last_scan = None;
                }
                Ok(BackupCommand::NewData(pieces)) => {
                    for piece in pieces {
                        service.matrix.local_file_report(&piece, true);
                    }
                    service.sender.last_scan = None;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => (),
                Err(mpsc::RecvTimeoutError::Disconnected) => return,
            }

            service.absorb_unsolicited();

            let now = service.clock.now();
            if service.monitor.cycle_due(now, service.config.cycle_interval) {
                service.run_monitor_cycle();
            }
            if service.scan_due(now) {
                service.run_send_scan();
            }
        }
    });
    (thread, BackupHandle { commands })
}

struct BackupService<N: Network, K: KVStore, F: FragmentStore> {
    stub: PacketStub<N>,
    catalog: Catalog,
    matrix: BackupMatrix,
    kv: K,
    fragments: F,
    monitor: BackupMonitor,
    sender: DataSender,
    config: BackupConfiguration,
    clock: SharedClock,
    event_publisher: Option<Sender<Event>>,
    packet_counter: u64,
}

impl<N: Network, K: KVStore, F: FragmentStore> BackupService<N, K, F> {
    fn supplier_of(&self, pos: SupplierPos) -> Option<&IdUrl> {
        self.config.suppliers.get(pos.index())
    }

    fn my_global_id(&self) -> GlobalId {
        GlobalId::new(None, &self.stub.me().to_global_form())
    }

    fn default_key_id(&self) -> String {
        format!("{}${}", DEFAULT_KEY_ALIAS, self.stub.me().to_global_form())
    }

    /// The on-the-wire packet id of a piece: the catalog-local id qualified with our global id.
    fn wire_packet_id(&self, piece: &PacketId) -> String {
        if piece.backup_id.customer.is_some() {
            piece.to_string()
        } else {
            format!("{}:{}", self.my_global_id(), piece)
        }
    }

    fn next_packet_id(&mut self, prefix: &str) -> String {
        self.packet_counter += 1;
        format!("{}:{}:{}", prefix, self.packet_counter, rand::random::<u32>())
    }

    /// Handles supplier packets that arrive outside of an awaited ack, e.g. a pushed Files
    /// report after the supplier rescanned its disk.
    fn absorb_unsolicited(&mut self) {
        while let Some((origin, packet)) = self.stub.try_recv() {
            self.handle_inbound(origin, packet);
        }
    }

    fn handle_inbound(&mut self, origin: IdUrl, packet: SignedPacket) {
        let position = self
            .config
            .suppliers
            .iter()
            .position(|supplier| supplier == &origin);
        let Some(position) = position else {
            log::debug!(
                "dropping {} from {}: not one of our suppliers",
                packet.command_name(),
                origin
            );
            return;
        };
        match packet.command {
            Command::Files(report) => {
                self.process_supplier_report(SupplierPos::new(position as u32), &report.payload);
            }
            other => {
                log::debug!(
                    "dropping unsolicited {:?} from supplier {}",
                    other,
                    origin
                );
            }
        }
    }

    fn process_supplier_report(&mut self, supplier: SupplierPos, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload).to_string();
        if let Some(idurl) = self.supplier_of(supplier) {
            let key = paths::combine(&paths::SUPPLIER_LIST_FILES, idurl.as_str().as_bytes());
            self.kv.set(&key, payload);
        }
        let outcome = process_raw_list_files(
            supplier,
            &text,
            &self.catalog,
            &self.matrix,
            &self.config.registered_key_aliases,
            &self.default_key_id(),
        );
        for path_id in outcome.delete_on_supplier {
            if let Some(idurl) = self.supplier_of(supplier).cloned() {
                let packet_id = self.next_packet_id("deletefile");
                self.stub.send_command(
                    &idurl,
                    Channel::new(CHANNEL_SUPPLIER),
                    packet_id,
                    Command::DeleteFile(DeleteFileRequest {
                        packet_id: path_id.to_string(),
                    }),
                );
            }
        }
        if !outcome.rebuild.is_empty() {
            self.start_rebuild(outcome.rebuild);
        }
    }

    /// One full monitor cycle: fire-hire, list-files, list-backups, rebuilding, pruning.
    fn run_monitor_cycle(&mut self) {
        self.monitor.begin_cycle(self.clock.now());

        // FireHire: suppliers whose recent sends all failed are reported and their remote
        // column is invalidated so the next cycle re-learns it from scratch.
        debug_assert_eq!(self.monitor.state, MonitorState::FireHire);
        for position in 0..self.config.suppliers.len() {
            let supplier = SupplierPos::new(position as u32);
            if self.sender.supplier_banned(supplier) {
                if let Some(idurl) = self.supplier_of(supplier).cloned() {
                    log::warn!("supplier {} at position {} is unreliable", idurl, supplier);
                    Event::publish(
                        &self.event_publisher,
                        Event::SupplierFired(SupplierFiredEvent {
                            timestamp: SystemTime::now(),
                            supplier: idurl,
                            position: supplier,
                        }),
                    );
                }
                self.matrix.reset_supplier(supplier);
                self.sender.reset_stats(supplier);
            }
        }
        self.monitor.advance();

        // ListFiles: a fresh report from every supplier.
        debug_assert_eq!(self.monitor.state, MonitorState::ListFiles);
        self.pull_list_files();
        self.monitor.advance();

        // ListBackups: decide which backups need rebuilding.
        debug_assert_eq!(self.monitor.state, MonitorState::ListBackups);
        let mut rebuild: Vec<BackupId> = Vec::new();
        for backup_id in self.catalog.backup_ids() {
            if !self.matrix.scan_missing_blocks(&backup_id).is_empty() {
                rebuild.push(backup_id);
            }
        }
        self.monitor.advance();

        debug_assert_eq!(self.monitor.state, MonitorState::Rebuilding);
        if !rebuild.is_empty() {
            self.start_rebuild(rebuild);
        }
        self.prune_versions();
        self.cleanup_local_copies();
        self.monitor.advance();
        debug_assert_eq!(self.monitor.state, MonitorState::Ready);
    }

    fn pull_list_files(&mut self) {
        for position in 0..self.config.suppliers.len() {
            let supplier = SupplierPos::new(position as u32);
            let Some(idurl) = self.supplier_of(supplier).cloned() else {
                continue;
            };
            let packet_id = self.next_packet_id("listfiles");
            self.stub.send_command(
                &idurl,
                Channel::new(CHANNEL_SUPPLIER),
                packet_id.clone(),
                Command::ListFiles(ListFilesRequest {
                    key_alias: DEFAULT_KEY_ALIAS.to_string(),
                }),
            );
            let deadline = Instant::now() + self.config.list_files_timeout;
            let received = self.stub.recv_matching(deadline, |_, packet| {
                packet.packet_id == packet_id
                    && matches!(packet.command, Command::Files(_) | Command::Fail(_))
            });
            match received {
                Ok((_, packet)) => match packet.command {
                    Command::Files(report) => {
                        self.process_supplier_report(supplier, &report.payload)
                    }
                    Command::Fail(info) => {
                        log::warn!("supplier {} refused list-files: {}", idurl, info.reason);
                        self.monitor.note_supplier_offline(supplier, self.clock.now());
                    }
                    _ => (),
                },
                Err(_) => {
                    log::warn!("supplier {} did not answer list-files", idurl);
                    self.monitor.note_supplier_offline(supplier, self.clock.now());
                }
            }
        }
    }

    /// Queues re-sends for every missing piece we still hold locally. Parity reconstruction of
    /// pieces with no local copy happens behind the fragment store.
    fn start_rebuild(&mut self, backups: Vec<BackupId>) {
        Event::publish(
            &self.event_publisher,
            Event::RebuildStarted(RebuildStartedEvent {
                timestamp: SystemTime::now(),
                backups: backups.clone(),
            }),
        );
        for backup_id in &backups {
            for piece in self.fragments.list(backup_id) {
                self.matrix.local_file_report(&piece, true);
            }
        }
        self.sender.last_scan = None;
    }

    fn prune_versions(&mut self) {
        let pruned = self.catalog.prune_versions(self.config.keep_versions);
        for backup_id in pruned {
            log::info!("pruning old backup {}", backup_id);
            for piece in self.fragments.list(&backup_id) {
                self.fragments.delete(&piece);
            }
            self.matrix.forget_backup(&backup_id);
            for supplier in self.config.suppliers.clone() {
                let wire_id = format!("{}:{}", self.my_global_id(), backup_id);
                let packet_id = self.next_packet_id("deletefile");
                self.stub.send_command(
                    &supplier,
                    Channel::new(CHANNEL_SUPPLIER),
                    packet_id,
                    Command::DeleteFile(DeleteFileRequest { packet_id: wire_id }),
                );
            }
        }
    }

    fn cleanup_local_copies(&mut self) {
        let allowed = self.monitor.local_cleanup_allowed(
            self.config.keep_local_copies,
            self.config.wait_suppliers,
            self.config.supplier_offline_window,
            self.clock.now(),
        );
        if !allowed {
            return;
        }
        let mut removed = 0;
        for backup_id in self.matrix.backup_ids() {
            for piece in self.matrix.scan_blocks_to_remove(&backup_id, true) {
                if self.fragments.has(&piece) {
                    self.fragments.delete(&piece);
                    removed += 1;
                }
                self.matrix.local_file_report(&piece, false);
            }
        }
        if removed > 0 {
            Event::publish(
                &self.event_publisher,
                Event::LocalFilesCleaned(LocalFilesCleanedEvent {
                    timestamp: SystemTime::now(),
                    removed,
                }),
            );
        }
    }

    fn scan_due(&self, now: Instant) -> bool {
        match self.sender.last_scan {
            None => true,
            Some(last) => now.duration_since(last) >= self.config.scan_interval,
        }
    }

    /// One sender pass: scan the matrices for unsent pieces, queue them, drain the outboxes.
    fn run_send_scan(&mut self) {
        self.sender.state = SenderState::ScanBlocks;
        self.sender.last_scan = Some(self.clock.now());
        for backup_id in self.matrix.backup_ids() {
            let to_send = self
                .matrix
                .scan_blocks_to_send(&backup_id, self.config.max_outbox_depth);
            for (supplier, pieces) in to_send {
                for piece in pieces {
                    match self.sender.enqueue(supplier, piece) {
                        Ok(()) => (),
                        Err(EnqueueError::OutboxFull) => break,
                        Err(EnqueueError::SupplierDead) => break,
                    }
                }
            }
        }

        self.sender.state = SenderState::Sending;
        for position in 0..self.config.suppliers.len() {
            let supplier = SupplierPos::new(position as u32);
            while let Some(piece) = self.sender.pop_next(supplier) {
                if !self.send_piece(supplier, &piece) {
                    // Consecutive failures will ban the supplier; stop early to spare it.
                    if self.sender.supplier_banned(supplier) {
                        self.sender.clear_outbox(supplier);
                        break;
                    }
                }
            }
        }
        self.sender.state = SenderState::Ready;
    }

    /// Uploads one piece and waits for the supplier's ack. Returns whether it was confirmed.
    fn send_piece(&mut self, supplier: SupplierPos, piece: &PacketId) -> bool {
        let Some(idurl) = self.supplier_of(supplier).cloned() else {
            return false;
        };
        let Some(payload) = self.fragments.get(piece) else {
            log::warn!("piece {} disappeared from the fragment store", piece);
            self.matrix.local_file_report(piece, false);
            return false;
        };
        let wire_id = self.wire_packet_id(piece);
        self.stub.send_command(
            &idurl,
            Channel::new(CHANNEL_SUPPLIER),
            wire_id.clone(),
            Command::Data(DataPacket {
                packet_id: wire_id.clone(),
                payload,
            }),
        );
        let deadline = Instant::now() + self.config.send_ack_timeout;
        let received = self.stub.recv_matching(deadline, |_, packet| {
            packet.packet_id == wire_id
                && matches!(packet.command, Command::Ack(_) | Command::Fail(_))
        });
        let ok = match received {
            Ok((_, packet)) => match packet.command {
                Command::Ack(_) => true,
                Command::Fail(info) => {
                    Event::publish(
                        &self.event_publisher,
                        Event::BackupTaskFailed(BackupTaskFailedEvent {
                            timestamp: SystemTime::now(),
                            backup_id: piece.backup_id.clone(),
                            reason: info.reason,
                        }),
                    );
                    false
                }
                _ => false,
            },
            Err(_) => {
                self.monitor.note_supplier_offline(supplier, self.clock.now());
                false
            }
        };
        self.sender.note_result(supplier, ok);
        self.matrix
            .remote_file_report(&piece.backup_id, piece.block, supplier, piece.kind, ok);
        ok
    }
}
