/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Rust implementation of the BitDust core: the coordination subsystems of a peer-to-peer
//! encrypted storage and messaging node.
//!
//! ## The library
//!
//! A node built from this crate keeps two kinds of state alive against an unreliable fleet of
//! peers:
//! - **Backups**: files are erasure-coded into pieces and spread across a fixed fleet of
//!   *supplier* nodes. The [backup](crate::backup) subsystem tracks which piece is where, heals
//!   the spread after supplier failures, and the [index synchronizer](crate::index_sync)
//!   replicates the [catalog](crate::catalog) of everything backed up to the same fleet.
//! - **Groups**: message streams shared by several nodes, sequenced by hired *broker* nodes.
//!   The [group](crate::group) subsystem keeps a broker cooperation set alive per group,
//!   consumes the queue in strict order and publishes at most once.
//!
//! Underneath both sit the [identity cache](crate::identity_cache) (signed identity documents,
//! rotation detection), the [handshake](crate::handshake) and [service seeker](crate::seeker)
//! machines driven by the [p2p thread](crate::p2p), and the [packet layer](crate::messages) of
//! signed, channel-routed commands.
//!
//! ## Pluggability
//!
//! The crate contains no transport, no disk format and no DHT implementation. Users plug in a
//! [`Network`](crate::networking::Network), a [`Dht`](crate::dht::Dht), a
//! [`KVStore`](crate::pluggables::KVStore), a
//! [`FragmentStore`](crate::pluggables::FragmentStore) and an
//! [`IdentitySource`](crate::identity_cache::IdentitySource), then describe the node with a
//! [`NodeSpec`](crate::node::NodeSpec) and call
//! [`NodeSpec::start`](crate::node::NodeSpec::start). Progress surfaces as
//! [events](crate::events), to which users can register handlers.

pub mod backup;

pub mod catalog;

pub mod clock;

pub mod config;

pub mod dht;

pub mod event_bus;

pub mod events;

pub mod group;

pub mod handshake;

pub mod identity_cache;

pub mod index_sync;

pub mod logging;

pub mod messages;

pub mod networking;

pub mod node;

pub mod p2p;

pub mod pluggables;

pub mod seeker;

pub mod types;
