/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Happy-path group messaging: a node joins a group it owns, hires its preferred broker,
//! publishes a message and consumes it back decrypted and in sequence.

mod common;

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;

use bitdust_core::config::{Configuration, GroupConfiguration};
use bitdust_core::group::GroupKeyId;
use bitdust_core::node::NodeSpec;
use bitdust_core::types::basic::BrokerPos;
use bitdust_core::types::idurl::IdUrl;
use bitdust_core::types::keypair::Keypair;
use bitdust_core::types::symkey::GroupKey;

use common::{broker_behavior, expect_recv, Hub, MapIdentitySource, MemoryFragments, MemoryKV, Peer, ScriptedDht};

#[test]
fn publish_and_consume_through_a_hired_broker() {
    common::init_logger();

    let hub = Hub::new();
    let alice = IdUrl::new("http://idhost.org/alice.xml");

    let broker = Peer::new(&hub, "http://idhost.org/broker-one.xml");
    let broker_idurl = broker.io.idurl.clone();
    let source = MapIdentitySource::new();
    source.insert(&broker_idurl, broker.identity("broker-one"));

    let mut cooperated = BTreeMap::new();
    cooperated.insert(0u8, broker_idurl.clone());
    let broker_thread = broker.run(broker_behavior(cooperated, true));

    let (connecting_sender, connecting) = mpsc::channel();
    let (brokers_sender, brokers_updated) = mpsc::channel();
    let (synchronized_sender, synchronized) = mpsc::channel();
    let (pushed_sender, pushed) = mpsc::channel();
    let (message_sender, messages) = mpsc::channel();

    let dht = ScriptedDht::new();
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
                        .preferred_brokers(vec![broker_idurl.clone()])
                        .tick_interval(std::time::Duration::from_millis(50))
                        .build(),
                )
                .build(),
        )
        .on_group_connecting(move |event| {
            let _ = connecting_sender.send(event.group.clone());
        })
        .on_group_brokers_updated(move |event| {
            let _ = brokers_sender.send((event.customer.clone(), event.brokers.clone()));
        })
        .on_group_synchronized(move |event| {
            let _ = synchronized_sender.send(event.last_sequence_id);
        })
        .on_message_pushed(move |event| {
            let _ = pushed_sender.send(event.counter);
        })
        .on_message_in(move |event| {
            let _ = message_sender.send((
                event.sequence_id,
                event.producer_id.clone(),
                event.payload.clone(),
            ));
        })
        .build()
        .start();

    let group = GroupKeyId::new("family", alice.clone());
    node.group().join(&group, GroupKey::generate());

    assert_eq!(expect_recv(&connecting, "group connecting"), group);

    let (customer, brokers) = expect_recv(&brokers_updated, "brokers updated");
    assert_eq!(customer, alice);
    assert!(brokers.iter().any(|entry| entry.idurl == broker_idurl));

    let last_sequence_id = expect_recv(&synchronized, "group synchronized");
    assert_eq!(last_sequence_id.int(), 0);

    node.group().push_message(&group, b"hello group");

    expect_recv(&pushed, "message pushed");
    let (sequence_id, producer_id, payload) = expect_recv(&messages, "message in");
    assert_eq!(sequence_id.int(), 1);
    assert_eq!(producer_id, "alice@idhost.org");
    assert_eq!(payload, b"hello group".to_vec());

    // The creator published the hired cooperation set to the DHT.
    assert_eq!(
        dht.brokers_of(&alice).get(&BrokerPos::ACTIVE),
        Some(&broker_idurl)
    );

    node.shutdown();
    broker_thread.stop();
}
