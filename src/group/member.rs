/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-group member state: the connection state machine's bookkeeping, the strictly ordered
//! consume side, and the at-most-once publish side.
//!
//! This module holds only the state transitions; the group thread in [`crate::group`] drives
//! the network side (DHT reads, queue-connect negotiation, pings, sends). Keeping the
//! transitions free of I/O makes the ordering and retry rules testable in isolation.

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use crate::group::messages::QueueMessage;
use crate::group::{GroupKeyId, QueueId};
use crate::types::basic::{BrokerPos, SequenceId};
use crate::types::idurl::IdUrl;
use crate::types::symkey::GroupKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MemberState {
    AtStartup,
    Disconnected,
    DhtRead,
    Brokers,
    Queue,
    InSync,
    Closed,
}

/// One not-yet-acknowledged outgoing message.
#[derive(Clone, Debug)]
pub(crate) struct OutgoingSlot {
    pub(crate) counter: u64,
    /// Encrypted with the group key.
    pub(crate) payload: Vec<u8>,
    pub(crate) attempts: u32,
    pub(crate) last_attempt: Option<Instant>,
    /// Set on re-sends after a broker rotation so the transport refreshes the connection.
    pub(crate) require_handshake: bool,
}

/// One message delivered upward, decrypted and in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Delivery {
    pub(crate) sequence_id: SequenceId,
    pub(crate) producer_id: String,
    pub(crate) payload: Vec<u8>,
}

/// What a queue chunk told us about our position relative to the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ChunkVerdict {
    /// We are caught up (also re-emitted when the broker is behind us).
    InSync,
    /// The broker holds messages we never saw; fetch the archive for this range.
    Ahead { from: SequenceId, to: SequenceId },
    /// The broker is reordering beyond repair; the member must disconnect.
    Fatal(String),
}

pub(crate) struct GroupMember {
    pub(crate) group: GroupKeyId,
    pub(crate) key: GroupKey,
    pub(crate) state: MemberState,
    pub(crate) last_sequence_id: SequenceId,
    buffered: BTreeMap<SequenceId, QueueMessage>,
    pub(crate) outgoing: BTreeMap<u64, OutgoingSlot>,
    next_counter: u64,
    pub(crate) connected_brokers: BTreeMap<BrokerPos, IdUrl>,
    /// Brokers excluded from selection until the next successful connect.
    pub(crate) dead_brokers: HashSet<IdUrl>,
    /// The broker the current reconnect cycle already marked dead, for dedup.
    dead_marked: Option<IdUrl>,
}

impl GroupMember {
    pub(crate) fn new(group: GroupKeyId, key: GroupKey, last_sequence_id: SequenceId) -> Self {
        GroupMember {
            group,
            key,
            state: MemberState::AtStartup,
            last_sequence_id,
            buffered: BTreeMap::new(),
            outgoing: BTreeMap::new(),
            next_counter: 0,
            connected_brokers: BTreeMap::new(),
            dead_brokers: HashSet::new(),
            dead_marked: None,
        }
    }

    pub(crate) fn active_broker(&self) -> Option<&IdUrl> {
        self.connected_brokers.get(&BrokerPos::ACTIVE)
    }

    /// The queue this member consumes from, defined once an active broker is connected.
    pub(crate) fn queue_id(&self) -> Option<QueueId> {
        self.active_broker()
            .map(|broker| QueueId::new(&self.group, broker))
    }

    /// Adopts a confirmed cooperation set and ends the reconnect cycle.
    pub(crate) fn on_brokers_connected(&mut self, brokers: BTreeMap<BrokerPos, IdUrl>) {
        self.connected_brokers = brokers;
        self.dead_marked = None;
        self.dead_brokers.clear();
        self.state = MemberState::Queue;
    }

    pub(crate) fn reset_connection(&mut self) {
        self.connected_brokers.clear();
        self.state = MemberState::Disconnected;
    }

    pub(crate) fn close(&mut self) {
        self.state = MemberState::Closed;
        self.buffered.clear();
        self.connected_brokers.clear();
    }

    /// Absorbs one chunk of queue messages: buffers out-of-order arrivals, drains the
    /// contiguous prefix starting at `last_sequence_id + 1`, and judges our position against
    /// the broker's advertised `latest`.
    pub(crate) fn absorb_chunk(
        &mut self,
        messages: Vec<QueueMessage>,
        latest: SequenceId,
        max_buffered: usize,
    ) -> (Vec<Delivery>, ChunkVerdict) {
        for message in messages {
            // Already-consumed sequence ids are duplicates from a failed broker; dropped here,
            // which is what makes delivery at-most-once.
            if message.sequence_id <= self.last_sequence_id {
                continue;
            }
            self.buffered.entry(message.sequence_id).or_insert(message);
        }

        let mut delivered = Vec::new();
        loop {
            let next = self.last_sequence_id.next();
            let Some(message) = self.buffered.remove(&next) else {
                break;
            };
            match message
                .encrypted_payload()
                .and_then(|bytes| self.key.decrypt(&bytes).ok())
            {
                Some(plaintext) => {
                    delivered.push(Delivery {
                        sequence_id: next,
                        producer_id: message.producer_id,
                        payload: plaintext,
                    });
                }
                None => {
                    log::warn!(
                        "message {} in group {} cannot be decrypted, skipping",
                        next,
                        self.group
                    );
                }
            }
            self.last_sequence_id = next;
        }

        if self.buffered.len() > max_buffered {
            return (
                delivered,
                ChunkVerdict::Fatal(format!(
                    "{} buffered messages, broker is reordering beyond repair",
                    self.buffered.len()
                )),
            );
        }
        let verdict = if latest > self.last_sequence_id {
            ChunkVerdict::Ahead {
                from: self.last_sequence_id.next(),
                to: latest,
            }
        } else {
            ChunkVerdict::InSync
        };
        (delivered, verdict)
    }

    /// Encrypts and queues one outgoing message. Returns the slot counter.
    pub(crate) fn enqueue_message(&mut self, plaintext: &[u8]) -> u64 {
        self.next_counter += 1;
        let counter = self.next_counter;
        let payload = self
            .key
            .encrypt(plaintext)
            .expect("encrypting with a valid group key cannot fail");
        self.outgoing.insert(
            counter,
            OutgoingSlot {
                counter,
                payload,
                attempts: 0,
                last_attempt: None,
                require_handshake: false,
            },
        );
        counter
    }

    /// Slot counters ready for (re-)sending: never attempted, or last attempted at least
    /// `ack_timeout` ago. Ordered by counter, so messages leave in enqueue order.
    pub(crate) fn slots_ready(&self, now: Instant, ack_timeout: Duration) -> Vec<u64> {
        self.outgoing
            .values()
            .filter(|slot| match slot.last_attempt {
                None => true,
                Some(at) => now.duration_since(at) >= ack_timeout,
            })
            .map(|slot| slot.counter)
            .collect()
    }

    pub(crate) fn note_sent(&mut self, counter: u64, now: Instant) {
        if let Some(slot) = self.outgoing.get_mut(&counter) {
            slot.attempts += 1;
            slot.last_attempt = Some(now);
        }
    }

    /// Pops an acknowledged slot. Returns whether it still existed.
    pub(crate) fn note_ack(&mut self, counter: u64) -> bool {
        self.outgoing.remove(&counter).is_some()
    }

    /// True when a slot has exhausted its attempt budget.
    pub(crate) fn slot_failed(&self, counter: u64, critical_fails: u32) -> bool {
        self.outgoing
            .get(&counter)
            .map(|slot| slot.attempts > critical_fails)
            .unwrap_or(false)
    }

    /// Marks the active broker dead: records it in the skip list, resets every outgoing
    /// slot's attempts so re-sends start fresh after rotation, and flags re-sends to refresh
    /// the connection. Idempotent within one reconnect cycle: a second detection for the same
    /// broker before the next successful connect returns `None`.
    pub(crate) fn mark_dead_broker(&mut self) -> Option<IdUrl> {
        let broker = self.active_broker()?.clone();
        if self.dead_marked.as_ref() == Some(&broker) {
            return None;
        }
        self.dead_marked = Some(broker.clone());
        self.dead_brokers.insert(broker.clone());
        for slot in self.outgoing.values_mut() {
            slot.attempts = 0;
            slot.last_attempt = None;
            slot.require_handshake = true;
        }
        Some(broker)
    }
}
