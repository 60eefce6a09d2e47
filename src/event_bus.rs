/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The event bus thread: receives [`Event`]s from the subsystem threads and fires the
//! registered handlers for each, in registration order.

use std::sync::mpsc::{Receiver, TryRecvError};
use std::thread::{self, JoinHandle};

use crate::events::*;
use crate::logging::Logger;

pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

#[derive(Default)]
pub struct EventHandlers {
    pub(crate) group_connecting_handlers: Vec<HandlerPtr<GroupConnectingEvent>>,
    pub(crate) group_synchronized_handlers: Vec<HandlerPtr<GroupSynchronizedEvent>>,
    pub(crate) group_disconnected_handlers: Vec<HandlerPtr<GroupDisconnectedEvent>>,
    pub(crate) group_brokers_updated_handlers: Vec<HandlerPtr<GroupBrokersUpdatedEvent>>,
    pub(crate) message_in_handlers: Vec<HandlerPtr<MessageInEvent>>,
    pub(crate) message_pushed_handlers: Vec<HandlerPtr<MessagePushedEvent>>,
    pub(crate) push_message_failed_handlers: Vec<HandlerPtr<PushMessageFailedEvent>>,
    pub(crate) identity_rotated_handlers: Vec<HandlerPtr<IdentityRotatedEvent>>,
    pub(crate) index_synchronized_handlers: Vec<HandlerPtr<IndexSynchronizedEvent>>,
    pub(crate) backup_task_failed_handlers: Vec<HandlerPtr<BackupTaskFailedEvent>>,
    pub(crate) supplier_fired_handlers: Vec<HandlerPtr<SupplierFiredEvent>>,
    pub(crate) rebuild_started_handlers: Vec<HandlerPtr<RebuildStartedEvent>>,
    pub(crate) local_files_cleaned_handlers: Vec<HandlerPtr<LocalFilesCleanedEvent>>,
}

impl EventHandlers {
    /// Handlers that log out every event in the default CSV format.
    pub(crate) fn add_default_loggers(&mut self) {
        self.group_connecting_handlers.push(GroupConnectingEvent::get_logger());
        self.group_synchronized_handlers.push(GroupSynchronizedEvent::get_logger());
        self.group_disconnected_handlers.push(GroupDisconnectedEvent::get_logger());
        self.group_brokers_updated_handlers.push(GroupBrokersUpdatedEvent::get_logger());
        self.message_in_handlers.push(MessageInEvent::get_logger());
        self.message_pushed_handlers.push(MessagePushedEvent::get_logger());
        self.push_message_failed_handlers.push(PushMessageFailedEvent::get_logger());
        self.identity_rotated_handlers.push(IdentityRotatedEvent::get_logger());
        self.index_synchronized_handlers.push(IndexSynchronizedEvent::get_logger());
        self.backup_task_failed_handlers.push(BackupTaskFailedEvent::get_logger());
        self.supplier_fired_handlers.push(SupplierFiredEvent::get_logger());
        self.rebuild_started_handlers.push(RebuildStartedEvent::get_logger());
        self.local_files_cleaned_handlers.push(LocalFilesCleanedEvent::get_logger());
    }

    pub fn fire_handlers(&self, event: Event) {
        match event {
            Event::GroupConnecting(ev) => {
                self.group_connecting_handlers.iter().for_each(|handler| handler(&ev))
            }
            Event::GroupSynchronized(ev) => {
                self.group_synchronized_handlers.iter().for_each(|handler| handler(&ev))
            }
            Event::GroupDisconnected(ev) => {
                self.group_disconnected_handlers.iter().for_each(|handler| handler(&ev))
            }
            Event::GroupBrokersUpdated(ev) => {
                self.group_brokers_updated_handlers.iter().for_each(|handler| handler(&ev))
            }
            Event::MessageIn(ev) => {
                self.message_in_handlers.iter().for_each(|handler| handler(&ev))
            }
            Event::MessagePushed(ev) => {
                self.message_pushed_handlers.iter().for_each(|handler| handler(&ev))
            }
            Event::PushMessageFailed(ev) => {
                self.push_message_failed_handlers.iter().for_each(|handler| handler(&ev))
            }
            Event::IdentityRotated(ev) => {
                self.identity_rotated_handlers.iter().for_each(|handler| handler(&ev))
            }
            Event::IndexSynchronized(ev) => {
                self.index_synchronized_handlers.iter().for_each(|handler| handler(&ev))
            }
            Event::BackupTaskFailed(ev) => {
                self.backup_task_failed_handlers.iter().for_each(|handler| handler(&ev))
            }
            Event::SupplierFired(ev) => {
                self.supplier_fired_handlers.iter().for_each(|handler| handler(&ev))
            }
            Event::RebuildStarted(ev) => {
                self.rebuild_started_handlers.iter().for_each(|handler| handler(&ev))
            }
            Event::LocalFilesCleaned(ev) => {
                self.local_files_cleaned_handlers.iter().for_each(|handler| handler(&ev))
            }
        }
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Event bus thread disconnected from main thread")
            }
        }

        if let Ok(event) = event_subscriber.try_recv() {
            event_handlers.fire_handlers(event);
        } else {
            thread::yield_now()
        }
    })
}
