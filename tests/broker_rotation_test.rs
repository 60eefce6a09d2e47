/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Broker failover: the first hired broker stops acking `Produce`, so after the critical
//! number of push failures the node declares it dead, hires a replacement through the random
//! lookup, re-synchronizes and delivers the queued message through the new broker.

mod common;

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use bitdust_core::config::{Configuration, GroupConfiguration};
use bitdust_core::group::GroupKeyId;
use bitdust_core::node::NodeSpec;
use bitdust_core::types::basic::BrokerPos;
use bitdust_core::types::idurl::IdUrl;
use bitdust_core::types::keypair::Keypair;
use bitdust_core::types::symkey::GroupKey;

use common::{broker_behavior, expect_recv, Hub, MapIdentitySource, MemoryFragments, MemoryKV, Peer, ScriptedDht};

#[test]
fn rotates_to_a_new_broker_after_push_failures() {
    common::init_logger();

    let hub = Hub::new();
    let alice = IdUrl::new("http://idhost.org/alice.xml");

    let silent_broker = Peer::new(&hub, "http://idhost.org/broker-one.xml");
    let backup_broker = Peer::new(&hub, "http://idhost.org/broker-two.xml");
    let silent_idurl = silent_broker.io.idurl.clone();
    let backup_idurl = backup_broker.io.idurl.clone();

    let source = MapIdentitySource::new();
    source.insert(&silent_idurl, silent_broker.identity("broker-one"));
    source.insert(&backup_idurl, backup_broker.identity("broker-two"));

    let mut silent_cooperated = BTreeMap::new();
    silent_cooperated.insert(0u8, silent_idurl.clone());
    let silent_thread = silent_broker.run(broker_behavior(silent_cooperated, false));

    let mut backup_cooperated = BTreeMap::new();
    backup_cooperated.insert(0u8, backup_idurl.clone());
    let backup_thread = backup_broker.run(broker_behavior(backup_cooperated, true));

    let (synchronized_sender, synchronized) = mpsc::channel();
    let (failed_sender, failed) = mpsc::channel();
    let (pushed_sender, pushed) = mpsc::channel();
    let (message_sender, messages) = mpsc::channel();

    let dht = ScriptedDht::new();
    let lookup_target = backup_idurl.clone();
    let node = NodeSpec::builder()
        .network(hub.join(&alice))
        .dht(dht.clone())
        .kv_store(MemoryKV::new())
        .fragment_store(MemoryFragments::new())
        .identity_source(Arc::new(source))
        .keypair(Keypair::generate())
        .configuration(
            Configuration::builder()
                .my_idurl(alice.clone())
                .group(
                    GroupConfiguration::builder()
                        .brokers_required(1)
                        .preferred_brokers(vec![silent_idurl.clone()])
                        .critical_push_message_fails(1)
                        .message_ack_timeout(Duration::from_millis(300))
                        .tick_interval(Duration::from_millis(50))
                        .build(),
                )
                .build(),
        )
        .broker_lookup(Arc::new(move || vec![lookup_target.clone()]))
        .on_group_synchronized(move |event| {
            let _ = synchronized_sender.send(event.last_sequence_id);
        })
        .on_push_message_failed(move |event| {
            let _ = failed_sender.send(event.attempts);
        })
        .on_message_pushed(move |event| {
            let _ = pushed_sender.send(event.counter);
        })
        .on_message_in(move |event| {
            let _ = message_sender.send(event.payload.clone());
        })
        .build()
        .start();

    let group = GroupKeyId::new("family", alice.clone());
    node.group().join(&group, GroupKey::generate());

    // First synchronization goes through the preferred broker, which then swallows pushes.
    expect_recv(&synchronized, "first synchronization");
    node.group().push_message(&group, b"retry me");

    let attempts = expect_recv(&failed, "push failure");
    assert!(attempts >= 2);

    // The replacement was hired through the random lookup and the message went through it.
    expect_recv(&synchronized, "re-synchronization");
    expect_recv(&pushed, "message pushed after rotation");
    assert_eq!(expect_recv(&messages, "message in"), b"retry me".to_vec());

    assert_eq!(
        dht.brokers_of(&alice).get(&BrokerPos::ACTIVE),
        Some(&backup_idurl)
    );

    node.shutdown();
    silent_thread.stop();
    backup_thread.stop();
}
