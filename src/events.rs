/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events the core publishes for event handling and logging.
//!
//! An event for a given action indicates that the action has been completed. Events are
//! published to the event bus thread (see [`crate::event_bus`]); users register handlers on the
//! [`crate::node::NodeSpec`], and each event also has a default CSV logger in
//! [`crate::logging`].

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::dht::BrokerEntry;
use crate::group::GroupKeyId;
use crate::types::basic::{Revision, SequenceId, SupplierPos};
use crate::types::idurl::IdUrl;
use crate::types::packet_id::BackupId;

pub enum Event {
    // Group lifecycle events.
    GroupConnecting(GroupConnectingEvent),
    GroupSynchronized(GroupSynchronizedEvent),
    GroupDisconnected(GroupDisconnectedEvent),
    GroupBrokersUpdated(GroupBrokersUpdatedEvent),
    // Group message flow events.
    MessageIn(MessageInEvent),
    MessagePushed(MessagePushedEvent),
    PushMessageFailed(PushMessageFailedEvent),
    // Identity events.
    IdentityRotated(IdentityRotatedEvent),
    // Backup and index events.
    IndexSynchronized(IndexSynchronizedEvent),
    BackupTaskFailed(BackupTaskFailedEvent),
    SupplierFired(SupplierFiredEvent),
    RebuildStarted(RebuildStartedEvent),
    LocalFilesCleaned(LocalFilesCleanedEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            // The event bus outlives every publisher except during shutdown, when dropping
            // events is correct.
            let _ = event_publisher.send(event);
        }
    }
}

pub struct GroupConnectingEvent {
    pub timestamp: SystemTime,
    pub group: GroupKeyId,
}

pub struct GroupSynchronizedEvent {
    pub timestamp: SystemTime,
    pub group: GroupKeyId,
    pub last_sequence_id: SequenceId,
}

pub struct GroupDisconnectedEvent {
    pub timestamp: SystemTime,
    pub group: GroupKeyId,
}

pub struct GroupBrokersUpdatedEvent {
    pub timestamp: SystemTime,
    pub customer: IdUrl,
    pub brokers: Vec<BrokerEntry>,
}

pub struct MessageInEvent {
    pub timestamp: SystemTime,
    pub group: GroupKeyId,
    pub sequence_id: SequenceId,
    pub producer_id: String,
    /// The decrypted message body.
    pub payload: Vec<u8>,
}

pub struct MessagePushedEvent {
    pub timestamp: SystemTime,
    pub group: GroupKeyId,
    pub counter: u64,
}

pub struct PushMessageFailedEvent {
    pub timestamp: SystemTime,
    pub group: GroupKeyId,
    pub counter: u64,
    pub attempts: u32,
}

pub struct IdentityRotatedEvent {
    pub timestamp: SystemTime,
    pub old_idurl: IdUrl,
    pub new_idurl: IdUrl,
}

pub struct IndexSynchronizedEvent {
    pub timestamp: SystemTime,
    pub revision: Revision,
}

pub struct BackupTaskFailedEvent {
    pub timestamp: SystemTime,
    pub backup_id: BackupId,
    pub reason: String,
}

pub struct SupplierFiredEvent {
    pub timestamp: SystemTime,
    pub supplier: IdUrl,
    pub position: SupplierPos,
}

pub struct RebuildStartedEvent {
    pub timestamp: SystemTime,
    pub backups: Vec<BackupId>,
}

pub struct LocalFilesCleanedEvent {
    pub timestamp: SystemTime,
    pub removed: usize,
}
