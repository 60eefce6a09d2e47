/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Backup-monitor bookkeeping: the cycle state machine and the supplier offline history.
//!
//! The monitor walks `Ready → FireHire → ListFiles → ListBackups → Rebuilding → Ready` once
//! per cycle. The backup thread's heartbeat asks [`BackupMonitor::cycle_due`] every few
//! seconds; a full cycle runs every `cycle_interval`, or immediately after a requested
//! restart or an observed supplier failure. The offline history also gates local-copy
//! cleanup: while any supplier was offline within the safety window, confirmed-remote pieces
//! are kept locally.

use std::time::{Duration, Instant};

use crate::types::basic::SupplierPos;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MonitorState {
    Ready,
    FireHire,
    ListFiles,
    ListBackups,
    Rebuilding,
}

pub(crate) struct BackupMonitor {
    pub(crate) state: MonitorState,
    last_cycle: Option<Instant>,
    restart_requested: bool,
    /// Per supplier: when it was last seen unresponsive, if ever.
    last_offline: Vec<Option<Instant>>,
}

impl BackupMonitor {
    pub(crate) fn new(suppliers_count: usize) -> BackupMonitor {
        BackupMonitor {
            state: MonitorState::Ready,
            last_cycle: None,
            restart_requested: false,
            last_offline: vec![None; suppliers_count],
        }
    }

    /// Forces a full cycle on the next heartbeat.
    pub(crate) fn request_restart(&mut self) {
        self.restart_requested = true;
    }

    pub(crate) fn cycle_due(&self, now: Instant, cycle_interval: Duration) -> bool {
        if self.state != MonitorState::Ready {
            return false;
        }
        if self.restart_requested {
            return true;
        }
        match self.last_cycle {
            None => true,
            Some(last) => now.duration_since(last) >= cycle_interval,
        }
    }

    pub(crate) fn begin_cycle(&mut self, now: Instant) {
        self.state = MonitorState::FireHire;
        self.last_cycle = Some(now);
        self.restart_requested = false;
    }

    pub(crate) fn advance(&mut self) {
        self.state = match self.state {
            MonitorState::Ready => MonitorState::Ready,
            MonitorState::FireHire => MonitorState::ListFiles,
            MonitorState::ListFiles => MonitorState::ListBackups,
            MonitorState::ListBackups => MonitorState::Rebuilding,
            MonitorState::Rebuilding => MonitorState::Ready,
        };
    }

    pub(crate) fn note_supplier_offline(&mut self, supplier: SupplierPos, now: Instant) {
        if let Some(slot) = self.last_offline.get_mut(supplier.index()) {
            *slot = Some(now);
        }
        // A supplier failure is a reason to cycle again soon.
        self.restart_requested = true;
    }

    /// True when some supplier was offline within the safety window ending at `now`.
    pub(crate) fn any_supplier_offline_within(&self, window: Duration, now: Instant) -> bool {
        self.last_offline.iter().any(|last| match last {
            Some(at) => now.duration_since(*at) < window,
            None => false,
        })
    }

    /// The local-cleanup gate: erasing confirmed-remote local copies is allowed only when the
    /// user opted out of keeping them, and either no supplier was recently offline or the
    /// wait-suppliers safety is off.
    pub(crate) fn local_cleanup_allowed(
        &self,
        keep_local_copies: bool,
        wait_suppliers: bool,
        offline_window: Duration,
        now: Instant,
    ) -> bool {
        if keep_local_copies {
            return false;
        }
        if !wait_suppliers {
            return true;
        }
        !self.any_supplier_offline_within(offline_window, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CYCLE: Duration = Duration::from_secs(60);
    const WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

    #[test]
    fn first_cycle_is_immediately_due() {
        let monitor = BackupMonitor::new(2);
        assert!(monitor.cycle_due(Instant::now(), CYCLE));
    }

    #[test]
    fn cycle_due_after_interval_or_restart() {
        let mut monitor = BackupMonitor::new(2);
        let start = Instant::now();
        monitor.begin_cycle(start);
        while monitor.state != MonitorState::Ready {
            monitor.advance();
        }
        assert!(!monitor.cycle_due(start + Duration::from_secs(10), CYCLE));
        assert!(monitor.cycle_due(start + CYCLE, CYCLE));

        monitor.request_restart();
        assert!(monitor.cycle_due(start + Duration::from_secs(10), CYCLE));
    }

    #[test]
    fn not_due_mid_cycle() {
        let mut monitor = BackupMonitor::new(2);
        let start = Instant::now();
        monitor.begin_cycle(start);
        assert_eq!(monitor.state, MonitorState::FireHire);
        assert!(!monitor.cycle_due(start + 2 * CYCLE, CYCLE));
    }

    #[test]
    fn walks_the_full_cycle() {
        let mut monitor = BackupMonitor::new(2);
        monitor.begin_cycle(Instant::now());
        let mut states = vec![monitor.state];
        for _ in 0..4 {
            monitor.advance();
            states.push(monitor.state);
        }
        assert_eq!(
            states,
            vec![
                MonitorState::FireHire,
                MonitorState::ListFiles,
                MonitorState::ListBackups,
                MonitorState::Rebuilding,
                MonitorState::Ready,
            ]
        );
    }

    #[test]
    fn cleanup_gate() {
        let mut monitor = BackupMonitor::new(2);
        let now = Instant::now();
        assert!(!monitor.local_cleanup_allowed(true, true, WINDOW, now));
        assert!(monitor.local_cleanup_allowed(false, true, WINDOW, now));

        monitor.note_supplier_offline(SupplierPos::new(1), now);
        let later = now + Duration::from_secs(60 * 60);
        assert!(!monitor.local_cleanup_allowed(false, true, WINDOW, later));
        // Opting out of the safety ignores the offline history.
        assert!(monitor.local_cleanup_allowed(false, false, WINDOW, later));
        // Past the window the history no longer blocks.
        assert!(monitor.local_cleanup_allowed(false, true, WINDOW, now + WINDOW));
    }
}
