/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types shared across the BitDust core subsystems.
//!
//! The types defined in [`crate::types::basic`] are "inert" newtypes that are sent around and
//! inspected but have no active behavior. The other modules define the domain vocabulary: the
//! packet-ID grammar ([`crate::types::packet_id`]), identity URLs and their rotation registry
//! ([`crate::types::idurl`]), signed identity documents ([`crate::types::identity`]), node
//! keypairs ([`crate::types::keypair`]), and symmetric group keys ([`crate::types::symkey`]).

pub mod basic;

pub mod idurl;

pub mod identity;

pub mod keypair;

pub mod packet_id;

pub mod symkey;
