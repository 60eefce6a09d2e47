/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Identity propagation and rotation: a peer pushes its identity document to the node, then
//! pushes a higher revision signed with the same key but published at a new IDURL. The node
//! acks both, re-binds the key to the new IDURL and announces the rotation.

mod common;

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use bitdust_core::messages::Command;
use bitdust_core::node::NodeSpec;
use bitdust_core::types::identity::IdentityDocument;
use bitdust_core::types::idurl::IdUrl;
use bitdust_core::types::keypair::Keypair;

use common::{expect_recv, Hub, MapIdentitySource, MemoryFragments, MemoryKV, Peer, ScriptedDht};

#[test]
fn pushed_identity_with_new_source_rotates_the_binding() {
    common::init_logger();

    let hub = Hub::new();
    let alice = IdUrl::new("http://idhost.org/alice.xml");
    let old_idurl = IdUrl::new("http://idhost.org/bob.xml");
    let new_idurl = IdUrl::new("http://newhost.net/bob.xml");

    let mut bob = Peer::new(&hub, old_idurl.as_str());

    let (rotated_sender, rotated) = mpsc::channel();
    let node = NodeSpec::builder()
        .network(hub.join(&alice))
        .dht(ScriptedDht::new())
        .kv_store(MemoryKV::new())
        .fragment_store(MemoryFragments::new())
        .identity_source(Arc::new(MapIdentitySource::new()))
        .keypair(Keypair::generate())
        .configuration(
            bitdust_core::config::Configuration::builder()
                .my_idurl(alice.clone())
                .build(),
        )
        .on_identity_rotated(move |event| {
            let _ = rotated_sender.send((event.old_idurl.clone(), event.new_idurl.clone()));
        })
        .build()
        .start();

    // Revision 1, published at the old IDURL.
    let first = IdentityDocument::new_signed(
        &bob.io.keypair,
        "bob",
        vec![old_idurl.clone()],
        vec!["tcp://127.0.0.1:7771".to_string()],
        1,
    );
    bob.io
        .send(&alice, "p2p", "p2p:push:1", Command::Identity(first));
    let (_, reply) = bob
        .io
        .recv_wait(Duration::from_secs(10))
        .expect("first identity push went unanswered");
    assert_eq!(reply.packet_id, "p2p:push:1");
    assert!(matches!(reply.command, Command::Ack(_)));

    // Revision 2, same key, now published at the new IDURL.
    let second = IdentityDocument::new_signed(
        &bob.io.keypair,
        "bob",
        vec![new_idurl.clone()],
        vec!["tcp://127.0.0.1:7771".to_string()],
        2,
    );
    bob.io.idurl = new_idurl.clone();
    bob.io
        .send(&alice, "p2p", "p2p:push:2", Command::Identity(second));
    let (_, reply) = bob
        .io
        .recv_wait(Duration::from_secs(10))
        .expect("second identity push went unanswered");
    assert_eq!(reply.packet_id, "p2p:push:2");
    assert!(matches!(reply.command, Command::Ack(_)));

    let (old, new) = expect_recv(&rotated, "identity rotation");
    assert_eq!(old, old_idurl);
    assert_eq!(new, new_idurl);

    // Lookups through the old IDURL now resolve to the new one.
    assert_eq!(node.identity_cache().latest(&old_idurl), new_idurl);

    node.shutdown();
}
