/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Configuration of a node, split into subsystem-specific config structs.
//!
//! All of these can be defined using the builder pattern, for example:
//!
//! ```ignore
//! let configuration = Configuration::builder()
//!     .my_idurl(IdUrl::new("http://idhost.org/alice.xml"))
//!     .backup(
//!         BackupConfiguration::builder()
//!             .suppliers(vec![s0, s1, s2, s3])
//!             .keep_local_copies(false)
//!             .build(),
//!     )
//!     .build();
//! ```
//!
//! Defaults follow the deployed constants: 15 s ack timeouts, 2 handshake/cache retries, 10
//! buffered queue messages, 2 critical push failures (overridable with the
//! `BITDUST_CRITICAL_PUSH_MESSAGE_FAILS` environment variable), 5 s monitor heartbeat, 60 s
//! full monitor cycle, 5 min index pull interval, outbox depth 8.

use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::types::idurl::IdUrl;

#[derive(Clone, TypedBuilder)]
pub struct Configuration {
    /// The IDURL at which this node publishes its identity document.
    pub my_idurl: IdUrl,

    /// The name recorded in this node's identity document.
    #[builder(default = String::from("node"))]
    pub my_name: String,

    /// Transport endpoints recorded in this node's identity document, e.g.
    /// `tcp://203.0.113.7:7771`. Peers use the protocol schemes for reachability filtering.
    #[builder(default = vec![String::from("tcp://127.0.0.1:7771")])]
    pub my_contacts: Vec<String>,

    #[builder(default = HandshakeConfiguration::builder().build())]
    pub handshake: HandshakeConfiguration,

    #[builder(default = GroupConfiguration::builder().build())]
    pub group: GroupConfiguration,

    #[builder(default = BackupConfiguration::builder().build())]
    pub backup: BackupConfiguration,

    #[builder(default = IndexSyncConfiguration::builder().build())]
    pub index_sync: IndexSyncConfiguration,

    /// Enables the default CSV loggers for every published event.
    #[builder(default = true)]
    pub log_events: bool,
}

#[derive(Clone, TypedBuilder)]
pub struct HandshakeConfiguration {
    /// Identity-cache attempts before giving up with `NoIdentity`.
    #[builder(default = 2)]
    pub cache_retries: u32,

    /// Re-sends of our identity after the first one times out.
    #[builder(default = 2)]
    pub ping_retries: u32,

    /// How long to wait for an `Ack`/`Fail` to one identity send.
    #[builder(default = Duration::from_secs(15))]
    pub ack_timeout: Duration,

    /// Timeout handed to the identity source for one fetch.
    #[builder(default = Duration::from_secs(10))]
    pub identity_fetch_timeout: Duration,
}

#[derive(Clone, TypedBuilder)]
pub struct GroupConfiguration {
    /// Size of a group's broker cooperation set.
    #[builder(default = 2)]
    pub brokers_required: u8,

    /// Push attempts beyond which a slot is declared failed and the active broker dead.
    #[builder(default = critical_push_message_fails_default())]
    pub critical_push_message_fails: u32,

    /// Cap on out-of-order queue messages held back for gap filling. Crossing it means the
    /// broker is reordering beyond repair.
    #[builder(default = 10)]
    pub max_buffered_messages: usize,

    /// Ack timeout for one `Produce`, and the minimum spacing between re-sends of a slot.
    #[builder(default = Duration::from_secs(15))]
    pub message_ack_timeout: Duration,

    /// Ack timeout for `queue-connect` service requests and broker pings.
    #[builder(default = Duration::from_secs(15))]
    pub broker_connect_timeout: Duration,

    /// Random-lookup iterations when hiring a broker.
    #[builder(default = 5)]
    pub broker_lookup_attempts: u32,

    /// Brokers to try before going to a random DHT lookup.
    #[builder(default = Vec::new())]
    pub preferred_brokers: Vec<IdUrl>,

    /// TTL for broker records we publish to the DHT.
    #[builder(default = Duration::from_secs(2 * 60 * 60))]
    pub broker_record_ttl: Duration,

    /// Granularity of the group thread's timer loop.
    #[builder(default = Duration::from_millis(100))]
    pub tick_interval: Duration,
}

fn critical_push_message_fails_default() -> u32 {
    std::env::var("BITDUST_CRITICAL_PUSH_MESSAGE_FAILS")
        .ok()
        .and_then(|text| text.parse().ok())
        .unwrap_or(2)
}

#[derive(Clone, TypedBuilder)]
pub struct BackupConfiguration {
    /// The supplier fleet, by position. `suppliers.len()` is the N of every presence matrix.
    #[builder(default = Vec::new())]
    pub suppliers: Vec<IdUrl>,

    /// Key aliases with locally registered keys. `K` scopes outside this set are rejected.
    #[builder(default = vec![String::from("master")])]
    pub registered_key_aliases: Vec<String>,

    /// Monitor timer granularity.
    #[builder(default = Duration::from_secs(5))]
    pub heartbeat: Duration,

    /// Interval between unforced full monitor cycles.
    #[builder(default = Duration::from_secs(60))]
    pub cycle_interval: Duration,

    /// Interval between unforced data-sender scans.
    #[builder(default = Duration::from_secs(60))]
    pub scan_interval: Duration,

    /// Maximum concurrent transfers queued per supplier; enqueues beyond it are rejected.
    #[builder(default = 8)]
    pub max_outbox_depth: usize,

    /// Consecutive failed sends after which a supplier is skipped until something succeeds.
    #[builder(default = 3)]
    pub dead_supplier_failures: usize,

    /// Length of the rolling per-supplier send-stat string.
    #[builder(default = 10)]
    pub stats_window: usize,

    /// Versions kept per catalog path when pruning.
    #[builder(default = 2)]
    pub keep_versions: usize,

    /// When true, local fragment copies are never erased after remote confirmation.
    #[builder(default = true)]
    pub keep_local_copies: bool,

    /// When true, local copies are kept while any supplier was offline in the last 24 h.
    #[builder(default = true)]
    pub wait_suppliers: bool,

    /// How long a supplier must have been continuously reachable before its offline history
    /// stops blocking local cleanup.
    #[builder(default = Duration::from_secs(24 * 60 * 60))]
    pub supplier_offline_window: Duration,

    /// Ack timeout for one fragment upload.
    #[builder(default = Duration::from_secs(15))]
    pub send_ack_timeout: Duration,

    /// Ack timeout for a `ListFiles` request.
    #[builder(default = Duration::from_secs(20))]
    pub list_files_timeout: Duration,
}

#[derive(Clone, TypedBuilder)]
pub struct IndexSyncConfiguration {
    /// Interval between unforced pulls while in sync.
    #[builder(default = Duration::from_secs(5 * 60))]
    pub pull_interval: Duration,

    /// Silence from every supplier for this long re-enters the request cycle.
    #[builder(default = Duration::from_secs(60))]
    pub request_retry_interval: Duration,

    /// Ack timeout for one push or retrieve.
    #[builder(default = Duration::from_secs(15))]
    pub ack_timeout: Duration,
}
