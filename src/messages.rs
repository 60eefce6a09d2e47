/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the structured packets that are sent between nodes.
//!
//! Every packet travels as a [`SignedPacket`]: a borsh-serialized envelope carrying the sender's
//! IDURL, a correlation packet id, a channel name and one [`Command`]. The channel decides which
//! subsystem thread an inbound packet is routed to (see [`crate::networking`]); the packet id
//! correlates responses with requests. Response commands (`Ack`, `Fail`, `Files`, `Data`,
//! `QueueMessages`) echo the packet id and channel of the request that caused them.
//!
//! Commands whose bodies the wire protocol fixes as JSON (service parameters, broker replies,
//! queue message lists) carry those bodies as raw bytes; the typed JSON views live in
//! [`crate::group::messages`] and are parsed at the consuming subsystem.

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::dht::BrokerEntry;
use crate::types::basic::{Channel, SequenceId, ServiceName, SignatureBytes};
use crate::types::identity::IdentityDocument;
use crate::types::idurl::IdUrl;
use crate::types::keypair::Keypair;

/// A signed message must consist of:
/// 1. Message bytes [`SignedMessage::message_bytes`]: the values that the signature is over, and
/// 2. Signature bytes [`SignedMessage::signature_bytes`]: the signature in bytes.
///
/// Given the two values satisfying the above, and a public key of the signer, the signature can
/// be verified against the message.
pub trait SignedMessage {
    /// The values contained in the message that should be signed, as a vector of bytes.
    fn message_bytes(&self) -> Vec<u8>;

    /// The signature (in bytes) over [`Self::message_bytes`].
    fn signature_bytes(&self) -> SignatureBytes;

    /// Verifies the correctness of the signature given the values that should be signed.
    fn is_correct(&self, pk: &VerifyingKey) -> bool {
        let signature = Signature::from_bytes(&self.signature_bytes().bytes());
        pk.verify(&self.message_bytes(), &signature).is_ok()
    }
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct SignedPacket {
    /// Correlation id. Requests choose it; responses echo it.
    pub packet_id: String,
    /// Routing channel. Responses echo the request's channel.
    pub channel: Channel,
    /// IDURL of the sending node.
    pub creator: IdUrl,
    pub command: Command,
    pub signature: SignatureBytes,
}

impl SignedPacket {
    pub fn new(
        keypair: &Keypair,
        creator: IdUrl,
        channel: Channel,
        packet_id: String,
        command: Command,
    ) -> SignedPacket {
        let mut packet = SignedPacket {
            packet_id,
            channel,
            creator,
            command,
            signature: SignatureBytes::new([0u8; 64]),
        };
        packet.signature = keypair.sign(&packet.message_bytes());
        packet
    }

    /// Short command name for logs.
    pub fn command_name(&self) -> &'static str {
        match &self.command {
            Command::Identity(_) => "Identity",
            Command::Ack(_) => "Ack",
            Command::Fail(_) => "Fail",
            Command::RequestService(_) => "RequestService",
            Command::Consume(_) => "Consume",
            Command::Produce(_) => "Produce",
            Command::QueueMessages(_) => "QueueMessages",
            Command::QueueDisconnect(_) => "QueueDisconnect",
            Command::ArchiveRead(_) => "ArchiveRead",
            Command::Data(_) => "Data",
            Command::DeleteFile(_) => "DeleteFile",
            Command::ListFiles(_) => "ListFiles",
            Command::Files(_) => "Files",
            Command::Retrieve(_) => "Retrieve",
        }
    }
}

impl SignedMessage for SignedPacket {
    fn message_bytes(&self) -> Vec<u8> {
        let unsigned = (
            &self.packet_id,
            &self.channel,
            &self.creator,
            &self.command,
        );
        unsigned
            .try_to_vec()
            .expect("serializing a packet in memory cannot fail")
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub enum Command {
    /// The sender's identity document. Sent during handshakes and identity propagation.
    Identity(IdentityDocument),
    /// Positive response. The payload shape depends on the request command.
    Ack(AckInfo),
    /// Negative response.
    Fail(FailInfo),
    /// Ask the receiving node to start a named service for us.
    RequestService(RequestServiceInfo),
    /// Subscribe to a group queue starting after `last_sequence_id`.
    Consume(ConsumeRequest),
    /// Publish one encrypted message into a group queue.
    Produce(ProduceRequest),
    /// A chunk of queue messages streamed by a broker, live or archived.
    QueueMessages(QueueMessagesChunk),
    /// Unsubscribe from a group queue.
    QueueDisconnect(QueueDisconnectRequest),
    /// Ask the active broker for the archived range `from..=to`.
    ArchiveRead(ArchiveReadRequest),
    /// One stored piece: a fragment upload to a supplier, or a supplier's `Retrieve` response.
    Data(DataPacket),
    /// Ask a supplier to delete a stored path or piece.
    DeleteFile(DeleteFileRequest),
    /// Ask a supplier for its raw list of stored files.
    ListFiles(ListFilesRequest),
    /// A supplier's raw list-files report.
    Files(FilesReport),
    /// Ask a supplier to send back a stored packet (used for the catalog index file).
    Retrieve(RetrieveRequest),
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct AckInfo {
    pub payload: Vec<u8>,
}

impl AckInfo {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).to_string()
    }
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct FailInfo {
    pub reason: String,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct RequestServiceInfo {
    pub service: ServiceName,
    /// JSON-encoded service parameters, e.g. [`crate::group::messages::QueueConnectParams`].
    pub params_json: Vec<u8>,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct ConsumeRequest {
    pub queue_id: String,
    pub consumer_id: String,
    pub last_sequence_id: SequenceId,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct ProduceRequest {
    pub queue_id: String,
    pub producer_id: String,
    /// Encrypted with the group key.
    pub payload: Vec<u8>,
    /// The producer's view of the cooperation set, so the broker can detect divergence.
    pub known_brokers: Vec<BrokerEntry>,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct QueueMessagesChunk {
    pub queue_id: String,
    /// JSON list of [`crate::group::messages::QueueMessage`].
    pub messages_json: Vec<u8>,
    /// The queue's newest sequence id at the broker when this chunk was produced.
    pub latest_sequence_id: SequenceId,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct QueueDisconnectRequest {
    pub queue_id: String,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct ArchiveReadRequest {
    pub queue_id: String,
    pub from: SequenceId,
    pub to: SequenceId,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct DataPacket {
    pub packet_id: String,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct DeleteFileRequest {
    pub packet_id: String,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct ListFilesRequest {
    pub key_alias: String,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct FilesReport {
    /// Newline-delimited text with `Q`/`K`/`D`/`F`/`V` line prefixes.
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct RetrieveRequest {
    pub packet_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::basic::Channel;

    #[test]
    fn signed_packet_verifies_and_detects_tampering() {
        let keypair = Keypair::generate();
        let packet = SignedPacket::new(
            &keypair,
            IdUrl::new("http://idhost.org/alice.xml"),
            Channel::new("p2p"),
            "p2p:1:0:42".to_string(),
            Command::Fail(FailInfo {
                reason: "identity missing".to_string(),
            }),
        );
        assert!(packet.is_correct(&keypair.public()));

        let mut tampered = packet.clone();
        tampered.packet_id = "p2p:1:0:43".to_string();
        assert!(!tampered.is_correct(&keypair.public()));
    }

    #[test]
    fn borsh_roundtrip() {
        let keypair = Keypair::generate();
        let packet = SignedPacket::new(
            &keypair,
            IdUrl::new("http://idhost.org/bob.xml"),
            Channel::new("supplier"),
            "master$bob@idhost.org:0/1/F20240101120000PM/3-0-Data".to_string(),
            Command::Data(DataPacket {
                packet_id: "master$bob@idhost.org:0/1/F20240101120000PM/3-0-Data".to_string(),
                payload: vec![1, 2, 3],
            }),
        );
        let bytes = packet.try_to_vec().unwrap();
        let decoded = SignedPacket::try_from_slice(&bytes).unwrap();
        assert!(decoded.is_correct(&keypair.public()));
        assert_eq!(decoded.command_name(), "Data");
    }
}
