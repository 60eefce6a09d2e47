/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](Dht) for the pluggable distributed hash table client.
//!
//! The DHT itself is outside this crate; providers expose it as a key/value lookup and publish
//! service with TTL. The core uses two record families:
//! - `brokers:<customer_id>`: the JSON list of `{position, idurl}` entries naming a group
//!   creator's broker cooperation set;
//! - `identity:<idurl>`: a serialized identity document, published by identity servers.
//!
//! Calls are blocking with provider-internal timeouts; a failed read surfaces as a typed
//! [`DhtError`] which the calling state machine maps to its own retry policy.

use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::types::basic::BrokerPos;
use crate::types::idurl::IdUrl;

/// One position of a group's broker cooperation set, as stored in the DHT.
#[derive(
    Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize, Serialize, Deserialize,
)]
pub struct BrokerEntry {
    pub position: BrokerPos,
    pub idurl: IdUrl,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DhtError {
    /// The lookup did not complete within the provider's timeout.
    Timeout,
    /// The record exists but could not be decoded.
    MalformedRecord,
    /// The provider refused the write (e.g. lost a compare-and-swap on a position).
    WriteRefused,
}

impl Display for DhtError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let text = match self {
            DhtError::Timeout => "dht operation timed out",
            DhtError::MalformedRecord => "dht record is malformed",
            DhtError::WriteRefused => "dht write was refused",
        };
        f.write_str(text)
    }
}

pub trait Dht: Clone + Send + 'static {
    /// Reads the broker entries published for `customer` at the requested positions. An empty
    /// result is not an error: it means no brokers are currently published. With `use_cache`
    /// the provider may serve a recent cached copy instead of going to the network.
    fn read_brokers(
        &mut self,
        customer: &IdUrl,
        positions: &[BrokerPos],
        use_cache: bool,
    ) -> Result<Vec<BrokerEntry>, DhtError>;

    /// Publishes one broker entry for `customer`, compare-and-swapping on the position.
    fn write_broker(
        &mut self,
        customer: &IdUrl,
        entry: &BrokerEntry,
        ttl: Duration,
    ) -> Result<(), DhtError>;

    /// Removes the published entry at `position`, if it is there.
    fn erase_broker(&mut self, customer: &IdUrl, position: BrokerPos) -> Result<(), DhtError>;

    /// Drops any cached copy of `customer`'s broker record, so the next read with `use_cache`
    /// still goes to the network. Called when a dead broker is detected.
    fn clear_brokers_cache(&mut self, customer: &IdUrl);
}
