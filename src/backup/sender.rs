/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Data-sender bookkeeping: per-supplier outboxes and rolling send statistics.
//!
//! The sender walks `Ready ↔ ScanBlocks ↔ Sending`. A scan asks the matrix for unsent pieces
//! and enqueues them per supplier; the backup thread then drains the outboxes in FIFO order,
//! one upload at a time per supplier. Every ack appends `+` and every failure `-` to that
//! supplier's rolling stat string (trimmed to the configured window); a supplier whose last
//! few sends all failed is skipped until a send succeeds again. An outbox at its depth cap
//! rejects further pieces, which the sender simply retries on its next scan.

use std::collections::{HashSet, VecDeque};
use std::fmt::{self, Display, Formatter};
use std::time::Instant;

use crate::types::basic::SupplierPos;
use crate::types::packet_id::PacketId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SenderState {
    Ready,
    ScanBlocks,
    Sending,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EnqueueError {
    /// The supplier's outbox is at its depth cap ("in queue").
    OutboxFull,
    /// The supplier's recent sends all failed; skipped until one succeeds.
    SupplierDead,
}

impl Display for EnqueueError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::OutboxFull => f.write_str("in queue"),
            EnqueueError::SupplierDead => f.write_str("supplier is not responding"),
        }
    }
}

pub(crate) struct DataSender {
    pub(crate) state: SenderState,
    stats: Vec<String>,
    outboxes: Vec<VecDeque<PacketId>>,
    queued: HashSet<PacketId>,
    pub(crate) last_scan: Option<Instant>,
    stats_window: usize,
    max_outbox_depth: usize,
    dead_supplier_failures: usize,
}

impl DataSender {
    pub(crate) fn new(
        suppliers_count: usize,
        stats_window: usize,
        max_outbox_depth: usize,
        dead_supplier_failures: usize,
    ) -> DataSender {
        DataSender {
            state: SenderState::Ready,
            stats: vec![String::new(); suppliers_count],
            outboxes: vec![VecDeque::new(); suppliers_count],
            queued: HashSet::new(),
            last_scan: None,
            stats_window,
            max_outbox_depth,
            dead_supplier_failures,
        }
    }

    /// True when the supplier's last `dead_supplier_failures` sends all failed.
    pub(crate) fn supplier_banned(&self, supplier: SupplierPos) -> bool {
        let Some(stats) = self.stats.get(supplier.index()) else {
            return true;
        };
        stats.len() >= self.dead_supplier_failures
            && stats[stats.len() - self.dead_supplier_failures..]
                .bytes()
                .all(|b| b == b'-')
    }

    pub(crate) fn outbox_depth(&self, supplier: SupplierPos) -> usize {
        self.outboxes
            .get(supplier.index())
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Queues one piece for upload. Duplicates of a piece already queued are ignored.
    pub(crate) fn enqueue(
        &mut self,
        supplier: SupplierPos,
        packet_id: PacketId,
    ) -> Result<(), EnqueueError> {
        if self.supplier_banned(supplier) {
            return Err(EnqueueError::SupplierDead);
        }
        let outbox = &mut self.outboxes[supplier.index()];
        if self.queued.contains(&packet_id) {
            return Ok(());
        }
        if outbox.len() >= self.max_outbox_depth {
            return Err(EnqueueError::OutboxFull);
        }
        self.queued.insert(packet_id.clone());
        outbox.push_back(packet_id);
        Ok(())
    }

    /// Pops the supplier's next queued piece, preserving FIFO order.
    pub(crate) fn pop_next(&mut self, supplier: SupplierPos) -> Option<PacketId> {
        let piece = self.outboxes[supplier.index()].pop_front()?;
        self.queued.remove(&piece);
        Some(piece)
    }

    /// Records one send result in the supplier's rolling stat string.
    pub(crate) fn note_result(&mut self, supplier: SupplierPos, ok: bool) {
        let stats = &mut self.stats[supplier.index()];
        stats.push(if ok { '+' } else { '-' });
        if stats.len() > self.stats_window {
            let excess = stats.len() - self.stats_window;
            stats.drain(..excess);
        }
    }

    pub(crate) fn stats(&self, supplier: SupplierPos) -> &str {
        &self.stats[supplier.index()]
    }

    /// Drops one supplier's queued pieces, e.g. after it was banned mid-drain.
    pub(crate) fn clear_outbox(&mut self, supplier: SupplierPos) {
        let outbox = &mut self.outboxes[supplier.index()];
        for piece in outbox.drain(..) {
            self.queued.remove(&piece);
        }
    }

    /// Forgets a supplier's send history, e.g. after firing it.
    pub(crate) fn reset_stats(&mut self, supplier: SupplierPos) {
        self.stats[supplier.index()].clear();
    }
}
