/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to construct and start a node, and to interact with it while it runs.
//!
//! A [`Node`] is built from a [`NodeSpec`]: the pluggable providers (network, DHT, key-value
//! store, fragment store, identity source), the node's keypair, its
//! [configuration](crate::config::Configuration) and any event handlers. [`NodeSpec::start`]
//! spawns the six long-running threads (poller, p2p, group, backup, index sync and event bus)
//! and returns the handles to talk to them. Dropping the `Node` without calling
//! [`Node::shutdown`] leaves the threads running detached.

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use borsh::{BorshDeserialize, BorshSerialize};
use typed_builder::TypedBuilder;

use crate::backup::{start_backup, BackupHandle};
use crate::backup::matrix::BackupMatrix;
use crate::catalog::Catalog;
use crate::clock::{SharedClock, SystemClock};
use crate::config::Configuration;
use crate::dht::Dht;
use crate::event_bus::{start_event_bus, EventHandlers, HandlerPtr};
use crate::events::*;
use crate::group::{start_group, GroupHandle};
use crate::identity_cache::{IdentityCache, IdentitySource};
use crate::index_sync::{start_index_sync, IndexHandle};
use crate::networking::{start_polling, Network, PacketStub};
use crate::p2p::{start_p2p, P2pHandle};
use crate::pluggables::{paths, FragmentStore, KVStore};
use crate::types::identity::IdentityDocument;
use crate::types::idurl::{IdUrl, IdUrlRegistry};
use crate::types::keypair::Keypair;
use crate::types::symkey::GroupKey;

/// Everything a node needs to start. Construct with [`NodeSpec::builder`].
#[derive(TypedBuilder)]
pub struct NodeSpec<N: Network, D: Dht, K: KVStore, F: FragmentStore> {
    network: N,
    dht: D,
    kv_store: K,
    fragment_store: F,
    identity_source: Arc<dyn IdentitySource>,
    keypair: Keypair,
    configuration: Configuration,

    #[builder(default = Arc::new(SystemClock))]
    clock: SharedClock,

    /// Yields random broker candidates for group broker hiring. One call is one lookup
    /// iteration; the default never finds anything.
    #[builder(default = Arc::new(Vec::new))]
    broker_lookup: Arc<dyn Fn() -> Vec<IdUrl> + Send + Sync>,

    #[builder(default, setter(transform = |handler: impl Fn(&GroupConnectingEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<GroupConnectingEvent>)))]
    on_group_connecting: Option<HandlerPtr<GroupConnectingEvent>>,

    #[builder(default, setter(transform = |handler: impl Fn(&GroupSynchronizedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<GroupSynchronizedEvent>)))]
    on_group_synchronized: Option<HandlerPtr<GroupSynchronizedEvent>>,

    #[builder(default, setter(transform = |handler: impl Fn(&GroupDisconnectedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<GroupDisconnectedEvent>)))]
    on_group_disconnected: Option<HandlerPtr<GroupDisconnectedEvent>>,

    #[builder(default, setter(transform = |handler: impl Fn(&GroupBrokersUpdatedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<GroupBrokersUpdatedEvent>)))]
    on_group_brokers_updated: Option<HandlerPtr<GroupBrokersUpdatedEvent>>,

    #[builder(default, setter(transform = |handler: impl Fn(&MessageInEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<MessageInEvent>)))]
    on_message_in: Option<HandlerPtr<MessageInEvent>>,

    #[builder(default, setter(transform = |handler: impl Fn(&MessagePushedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<MessagePushedEvent>)))]
    on_message_pushed: Option<HandlerPtr<MessagePushedEvent>>,

    #[builder(default, setter(transform = |handler: impl Fn(&PushMessageFailedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PushMessageFailedEvent>)))]
    on_push_message_failed: Option<HandlerPtr<PushMessageFailedEvent>>,

    #[builder(default, setter(transform = |handler: impl Fn(&IdentityRotatedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<IdentityRotatedEvent>)))]
    on_identity_rotated: Option<HandlerPtr<IdentityRotatedEvent>>,

    #[builder(default, setter(transform = |handler: impl Fn(&IndexSynchronizedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<IndexSynchronizedEvent>)))]
    on_index_synchronized: Option<HandlerPtr<IndexSynchronizedEvent>>,

    #[builder(default, setter(transform = |handler: impl Fn(&BackupTaskFailedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<BackupTaskFailedEvent>)))]
    on_backup_task_failed: Option<HandlerPtr<BackupTaskFailedEvent>>,

    #[builder(default, setter(transform = |handler: impl Fn(&SupplierFiredEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SupplierFiredEvent>)))]
    on_supplier_fired: Option<HandlerPtr<SupplierFiredEvent>>,

    #[builder(default, setter(transform = |handler: impl Fn(&RebuildStartedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RebuildStartedEvent>)))]
    on_rebuild_started: Option<HandlerPtr<RebuildStartedEvent>>,

    #[builder(default, setter(transform = |handler: impl Fn(&LocalFilesCleanedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<LocalFilesCleanedEvent>)))]
    on_local_files_cleaned: Option<HandlerPtr<LocalFilesCleanedEvent>>,
}

impl<N: Network + 'static, D: Dht, K: KVStore, F: FragmentStore> NodeSpec<N, D, K, F> {
    /// Spawns the node's threads and returns the running [`Node`].
    pub fn start(self) -> Node {
        let NodeSpec {
            network,
            dht,
            mut kv_store,
            fragment_store,
            identity_source,
            keypair,
            configuration,
            clock,
            broker_lookup,
            on_group_connecting,
            on_group_synchronized,
            on_group_disconnected,
            on_group_brokers_updated,
            on_message_in,
            on_message_pushed,
            on_push_message_failed,
            on_identity_rotated,
            on_index_synchronized,
            on_backup_task_failed,
            on_supplier_fired,
            on_rebuild_started,
            on_local_files_cleaned,
        } = self;

        let mut handlers = EventHandlers::default();
        if configuration.log_events {
            handlers.add_default_loggers();
        }
        if let Some(handler) = on_group_connecting {
            handlers.group_connecting_handlers.push(handler);
        }
        if let Some(handler) = on_group_synchronized {
            handlers.group_synchronized_handlers.push(handler);
        }
        if let Some(handler) = on_group_disconnected {
            handlers.group_disconnected_handlers.push(handler);
        }
        if let Some(handler) = on_group_brokers_updated {
            handlers.group_brokers_updated_handlers.push(handler);
        }
        if let Some(handler) = on_message_in {
            handlers.message_in_handlers.push(handler);
        }
        if let Some(handler) = on_message_pushed {
            handlers.message_pushed_handlers.push(handler);
        }
        if let Some(handler) = on_push_message_failed {
            handlers.push_message_failed_handlers.push(handler);
        }
        if let Some(handler) = on_identity_rotated {
            handlers.identity_rotated_handlers.push(handler);
        }
        if let Some(handler) = on_index_synchronized {
            handlers.index_synchronized_handlers.push(handler);
        }
        if let Some(handler) = on_backup_task_failed {
            handlers.backup_task_failed_handlers.push(handler);
        }
        if let Some(handler) = on_supplier_fired {
            handlers.supplier_fired_handlers.push(handler);
        }
        if let Some(handler) = on_rebuild_started {
            handlers.rebuild_started_handlers.push(handler);
        }
        if let Some(handler) = on_local_files_cleaned {
            handlers.local_files_cleaned_handlers.push(handler);
        }

        let (event_publisher, event_subscriber) = mpsc::channel();
        let event_publisher = Some(event_publisher);

        let my_identity = local_identity(&mut kv_store, &keypair, &configuration);
        let index_key = index_key(&mut kv_store);

        let cache = IdentityCache::new(
            identity_source,
            IdUrlRegistry::new(),
            event_publisher.clone(),
        );
        if let Err(err) = cache.update(&configuration.my_idurl, my_identity.clone()) {
            log::warn!("own identity document failed to cache: {}", err);
        }

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let (p2p_shutdown, p2p_shutdown_receiver) = mpsc::channel();
        let (group_shutdown, group_shutdown_receiver) = mpsc::channel();
        let (backup_shutdown, backup_shutdown_receiver) = mpsc::channel();
        let (index_shutdown, index_shutdown_receiver) = mpsc::channel();
        let (event_bus_shutdown, event_bus_shutdown_receiver) = mpsc::channel();

        let (poller_thread, p2p_receiver, group_receiver, supplier_receiver, index_receiver) =
            start_polling(network.clone(), poller_shutdown_receiver);

        let me = configuration.my_idurl.clone();
        let (p2p_thread, p2p_handle) = start_p2p(
            PacketStub::new(network.clone(), me.clone(), keypair.clone(), p2p_receiver),
            cache.clone(),
            my_identity,
            configuration.handshake.clone(),
            p2p_shutdown_receiver,
        );

        let catalog = Catalog::load(&kv_store);
        let matrix = BackupMatrix::new(configuration.backup.suppliers.len());
        let (backup_thread, backup_handle) = start_backup(
            PacketStub::new(network.clone(), me.clone(), keypair.clone(), supplier_receiver),
            catalog.clone(),
            matrix.clone(),
            kv_store.clone(),
            fragment_store,
            configuration.backup.clone(),
            clock,
            event_publisher.clone(),
            backup_shutdown_receiver,
        );

        let (group_thread, group_handle) = start_group(
            PacketStub::new(network.clone(), me.clone(), keypair.clone(), group_receiver),
            dht,
            kv_store.clone(),
            p2p_handle.clone(),
            cache.clone(),
            broker_lookup,
            configuration.group.clone(),
            event_publisher.clone(),
            group_shutdown_receiver,
        );

        let (index_thread, index_handle) = start_index_sync(
            PacketStub::new(network, me, keypair, index_receiver),
            catalog.clone(),
            kv_store,
            configuration.backup.suppliers.clone(),
            index_key,
            configuration.index_sync.clone(),
            event_publisher,
            index_shutdown_receiver,
        );

        let event_bus_thread =
            start_event_bus(handlers, event_subscriber, event_bus_shutdown_receiver);

        Node {
            catalog,
            identity_cache: cache,
            p2p: p2p_handle,
            group: group_handle,
            backup: backup_handle,
            index_sync: index_handle,
            subsystems: vec![
                (poller_shutdown, poller_thread),
                (p2p_shutdown, p2p_thread),
                (group_shutdown, group_thread),
                (backup_shutdown, backup_thread),
                (index_shutdown, index_thread),
                (event_bus_shutdown, event_bus_thread),
            ],
        }
    }
}

/// A running node.
pub struct Node {
    catalog: Catalog,
    identity_cache: IdentityCache,
    p2p: P2pHandle,
    group: GroupHandle,
    backup: BackupHandle,
    index_sync: IndexHandle,
    subsystems: Vec<(Sender<()>, JoinHandle<()>)>,
}

impl Node {
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn identity_cache(&self) -> &IdentityCache {
        &self.identity_cache
    }

    pub fn p2p(&self) -> &P2pHandle {
        &self.p2p
    }

    pub fn group(&self) -> &GroupHandle {
        &self.group
    }

    pub fn backup(&self) -> &BackupHandle {
        &self.backup
    }

    pub fn index_sync(&self) -> &IndexHandle {
        &self.index_sync
    }

    /// Signals every thread to stop and joins them. The group thread unsubscribes its queues
    /// on the way out.
    pub fn shutdown(self) {
        for (signal, _) in &self.subsystems {
            let _ = signal.send(());
        }
        for (_, thread) in self.subsystems {
            thread
                .join()
                .expect("subsystem thread panicked before shutdown");
        }
    }
}

/// Loads the node's identity document from the key-value store, or builds, signs and persists
/// a fresh one. A stored document whose key, canonical source or contacts no longer match the
/// configuration is superseded at the next revision.
fn local_identity<K: KVStore>(
    kv: &mut K,
    keypair: &Keypair,
    configuration: &Configuration,
) -> IdentityDocument {
    let stored = kv
        .get(&paths::LOCAL_IDENTITY)
        .and_then(|bytes| IdentityDocument::try_from_slice(&bytes).ok());
    if let Some(doc) = &stored {
        let current = doc.public_key == keypair.public_bytes()
            && doc.default_source() == Some(&configuration.my_idurl)
            && doc.contacts == configuration.my_contacts
            && doc.validate().is_ok();
        if current {
            return doc.clone();
        }
    }
    let revision = stored.map(|doc| doc.revision + 1).unwrap_or(1);
    let doc = IdentityDocument::new_signed(
        keypair,
        &configuration.my_name,
        vec![configuration.my_idurl.clone()],
        configuration.my_contacts.clone(),
        revision,
    );
    let bytes = doc
        .try_to_vec()
        .expect("serializing an identity document in memory cannot fail");
    kv.set(&paths::LOCAL_IDENTITY, &bytes);
    doc
}

/// Loads the catalog index encryption key, or generates and persists one. Losing this key
/// makes index copies stored at suppliers unreadable, so it lives in the key-value store.
fn index_key<K: KVStore>(kv: &mut K) -> GroupKey {
    if let Some(bytes) = kv.get(&paths::INDEX_KEY) {
        if let Ok(raw) = <[u8; 32]>::try_from(bytes.as_slice()) {
            return GroupKey::new(raw);
        }
        log::warn!("stored index key is malformed, generating a new one");
    }
    let key = GroupKey::generate();
    kv.set(&paths::INDEX_KEY, &key.bytes());
    key
}
