/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Inert newtypes used across the subsystems.
//!
//! These follow the newtype pattern: the inner representation is private, constructors and
//! accessors are explicit, and only the arithmetic that call sites actually need is implemented.

use std::fmt::{self, Display, Formatter};
use std::ops::{Add, AddAssign};

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

/// Position of a message inside a group queue. Assigned by the active broker, strictly
/// increasing, starting from 1. The value 0 means "nothing consumed yet".
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshDeserialize,
    BorshSerialize,
    Serialize,
    Deserialize,
)]
pub struct SequenceId(i64);

impl SequenceId {
    pub const fn new(int: i64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> i64 {
        self.0
    }

    pub fn next(&self) -> SequenceId {
        SequenceId(self.0 + 1)
    }
}

impl Display for SequenceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<i64> for SequenceId {
    type Output = SequenceId;
    fn add(self, rhs: i64) -> Self::Output {
        SequenceId(self.0 + rhs)
    }
}

impl AddAssign<i64> for SequenceId {
    fn add_assign(&mut self, rhs: i64) {
        self.0 += rhs
    }
}

/// Number of a block within one backup version.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshDeserialize,
    BorshSerialize,
    Serialize,
    Deserialize,
)]
pub struct BlockNumber(u32);

impl BlockNumber {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for BlockNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u32> for BlockNumber {
    type Output = BlockNumber;
    fn add(self, rhs: u32) -> Self::Output {
        BlockNumber(self.0 + rhs)
    }
}

/// Position of a supplier in a customer's supplier fleet, in `0..suppliers_count`.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshDeserialize,
    BorshSerialize,
    Serialize,
    Deserialize,
)]
pub struct SupplierPos(u32);

impl SupplierPos {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }

    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl Display for SupplierPos {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Position of a broker in a group's cooperation set, in `0..brokers_required`. Position 0 is
/// the active broker.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshDeserialize,
    BorshSerialize,
    Serialize,
    Deserialize,
)]
pub struct BrokerPos(u8);

impl BrokerPos {
    pub const ACTIVE: BrokerPos = BrokerPos(0);

    pub const fn new(int: u8) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u8 {
        self.0
    }

    pub const fn is_active(&self) -> bool {
        self.0 == 0
    }
}

impl Display for BrokerPos {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Revision of the backup catalog. Strictly increasing; 0 means "never synchronized".
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    BorshDeserialize,
    BorshSerialize,
    Serialize,
    Deserialize,
)]
pub struct Revision(u64);

impl Revision {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Revision {
        Revision(self.0 + 1)
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl AddAssign<u64> for Revision {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs
    }
}

/// An Ed25519 signature in its raw byte form.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureBytes({})", crate::logging::first_seven_base64_chars(&self.0))
    }
}

/// The raw bytes of an Ed25519 verifying key. Used wherever a public key has to be serialized
/// or used as a map key.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct VerifyingKeyBytes([u8; 32]);

impl VerifyingKeyBytes {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl fmt::Debug for VerifyingKeyBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "VerifyingKeyBytes({})", crate::logging::first_seven_base64_chars(&self.0))
    }
}

/// Name of a negotiable node service, e.g. `"service_message_broker"`.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize, Serialize, Deserialize,
)]
pub struct ServiceName(String);

impl ServiceName {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ServiceName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Name of a packet channel. The channel names a conversation: response packets carry the same
/// channel as the request that caused them, and the network poller routes inbound packets to
/// subsystem threads by channel.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize, Serialize, Deserialize,
)]
pub struct Channel(String);

impl Channel {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}
