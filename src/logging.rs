/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the node's
//! [config](crate::config::Configuration).
//!
//! Logging goes through the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations),
//! for example with [`setup_logger`].
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two
//! values are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as
//!    constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).

use std::io;
use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use log::LevelFilter;

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const GROUP_CONNECTING: &str = "GroupConnecting";
pub const GROUP_SYNCHRONIZED: &str = "GroupSynchronized";
pub const GROUP_DISCONNECTED: &str = "GroupDisconnected";
pub const GROUP_BROKERS_UPDATED: &str = "GroupBrokersUpdated";
pub const MESSAGE_IN: &str = "MessageIn";
pub const MESSAGE_PUSHED: &str = "MessagePushed";
pub const PUSH_MESSAGE_FAILED: &str = "PushMessageFailed";
pub const IDENTITY_ROTATED: &str = "IdentityRotated";
pub const INDEX_SYNCHRONIZED: &str = "IndexSynchronized";
pub const BACKUP_TASK_FAILED: &str = "BackupTaskFailed";
pub const SUPPLIER_FIRED: &str = "SupplierFired";
pub const REBUILD_STARTED: &str = "RebuildStarted";
pub const LOCAL_FILES_CLEANED: &str = "LocalFilesCleaned";

/// Sets up a fern dispatch that prints every log message of `level` and above to stdout.
pub fn setup_logger(level: LevelFilter) -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("[{}] {}", record.level(), message))
        })
        .level(level)
        .chain(io::stdout())
        .apply()?;
    Ok(())
}

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for GroupConnectingEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|ev: &GroupConnectingEvent| {
            log::info!(
                "{}, {}, {}",
                GROUP_CONNECTING,
                secs_since_unix_epoch(ev.timestamp),
                ev.group
            )
        })
    }
}

impl Logger for GroupSynchronizedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|ev: &GroupSynchronizedEvent| {
            log::info!(
                "{}, {}, {}, {}",
                GROUP_SYNCHRONIZED,
                secs_since_unix_epoch(ev.timestamp),
                ev.group,
                ev.last_sequence_id
            )
        })
    }
}

impl Logger for GroupDisconnectedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|ev: &GroupDisconnectedEvent| {
            log::info!(
                "{}, {}, {}",
                GROUP_DISCONNECTED,
                secs_since_unix_epoch(ev.timestamp),
                ev.group
            )
        })
    }
}

impl Logger for GroupBrokersUpdatedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|ev: &GroupBrokersUpdatedEvent| {
            log::info!(
                "{}, {}, {}, {}",
                GROUP_BROKERS_UPDATED,
                secs_since_unix_epoch(ev.timestamp),
                ev.customer,
                ev.brokers.len()
            )
        })
    }
}

impl Logger for MessageInEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|ev: &MessageInEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                MESSAGE_IN,
                secs_since_unix_epoch(ev.timestamp),
                ev.group,
                ev.sequence_id,
                ev.producer_id
            )
        })
    }
}

impl Logger for MessagePushedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|ev: &MessagePushedEvent| {
            log::info!(
                "{}, {}, {}, {}",
                MESSAGE_PUSHED,
                secs_since_unix_epoch(ev.timestamp),
                ev.group,
                ev.counter
            )
        })
    }
}

impl Logger for PushMessageFailedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|ev: &PushMessageFailedEvent| {
            log::warn!(
                "{}, {}, {}, {}, {}",
                PUSH_MESSAGE_FAILED,
                secs_since_unix_epoch(ev.timestamp),
                ev.group,
                ev.counter,
                ev.attempts
            )
        })
    }
}

impl Logger for IdentityRotatedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|ev: &IdentityRotatedEvent| {
            log::info!(
                "{}, {}, {}, {}",
                IDENTITY_ROTATED,
                secs_since_unix_epoch(ev.timestamp),
                ev.old_idurl,
                ev.new_idurl
            )
        })
    }
}

impl Logger for IndexSynchronizedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|ev: &IndexSynchronizedEvent| {
            log::info!(
                "{}, {}, {}",
                INDEX_SYNCHRONIZED,
                secs_since_unix_epoch(ev.timestamp),
                ev.revision
            )
        })
    }
}

impl Logger for BackupTaskFailedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|ev: &BackupTaskFailedEvent| {
            log::warn!(
                "{}, {}, {}, {}",
                BACKUP_TASK_FAILED,
                secs_since_unix_epoch(ev.timestamp),
                ev.backup_id,
                ev.reason
            )
        })
    }
}

impl Logger for SupplierFiredEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|ev: &SupplierFiredEvent| {
            log::warn!(
                "{}, {}, {}, {}",
                SUPPLIER_FIRED,
                secs_since_unix_epoch(ev.timestamp),
                ev.supplier,
                ev.position
            )
        })
    }
}

impl Logger for RebuildStartedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|ev: &RebuildStartedEvent| {
            log::info!(
                "{}, {}, {}",
                REBUILD_STARTED,
                secs_since_unix_epoch(ev.timestamp),
                ev.backups.len()
            )
        })
    }
}

impl Logger for LocalFilesCleanedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|ev: &LocalFilesCleanedEvent| {
            log::info!(
                "{}, {}, {}",
                LOCAL_FILES_CLEANED,
                secs_since_unix_epoch(ev.timestamp),
                ev.removed
            )
        })
    }
}

/// Get a more readable representation of a bytesequence by base64-encoding it and taking the
/// first 7 characters.
pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

pub(crate) fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Event occured before the Unix Epoch.")
        .as_secs()
}
