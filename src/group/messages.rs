/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Typed views of the JSON bodies the group protocol puts on the wire: the `queue-connect`
//! service parameters, the broker's text replies, and the queue message envelope.
//!
//! A broker answers `queue-connect` with a text payload in one of three shapes, distinguished
//! by prefix and preserved byte-for-byte on the wire:
//!
//! ```text
//! accepted:{"cooperated_brokers": {...}, "archive_folder_path": "..."}
//! mismatch:{"dht_brokers": {...}, "cooperated_brokers": {...}}
//! identity:<base64 identity document>
//! ```

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use borsh::BorshDeserialize;
use serde::{Deserialize, Serialize};

use crate::seeker::ServiceMismatch;
use crate::types::basic::SequenceId;
use crate::types::identity::IdentityDocument;
use crate::types::idurl::IdUrl;

/// Parameters of the `service_message_broker` / `queue-connect` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConnectParams {
    pub action: String,
    pub group_key_info: GroupKeyInfo,
    pub archive_folder_path: String,
    pub last_sequence_id: SequenceId,
    pub known_brokers: BTreeMap<u8, IdUrl>,
    /// The position we are asking this broker to take, when hiring for a specific slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u8>,
}

impl QueueConnectParams {
    pub const ACTION: &'static str = "queue-connect";
}

/// Identifies the group key to the broker without revealing it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupKeyInfo {
    /// `<alias>$<creator>`.
    pub key_id: String,
    pub fingerprint: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AcceptedReply {
    pub cooperated_brokers: BTreeMap<u8, IdUrl>,
    #[serde(default)]
    pub archive_folder_path: Option<String>,
}

/// A broker's parsed reply to `queue-connect`.
#[derive(Clone, Debug)]
pub enum BrokerReply {
    Accepted(AcceptedReply),
    Mismatch(ServiceMismatch),
    /// The broker pushed a fresher identity document; cache it and re-issue the request.
    Identity(IdentityDocument),
}

impl BrokerReply {
    /// Parses the text payload of a broker's ack by prefix. The `accepted:` case takes the raw
    /// body (the prefix is stripped by the seeker already); use [`BrokerReply::parse`] for a
    /// full prefixed payload.
    pub fn parse(text: &str) -> Option<BrokerReply> {
        if let Some(body) = text.strip_prefix("accepted:") {
            return Self::parse_accepted(body);
        }
        if let Some(body) = text.strip_prefix("mismatch:") {
            return ServiceMismatch::parse(body).map(BrokerReply::Mismatch);
        }
        if let Some(body) = text.strip_prefix("identity:") {
            let bytes = STANDARD.decode(body.trim()).ok()?;
            let doc = IdentityDocument::try_from_slice(&bytes).ok()?;
            return Some(BrokerReply::Identity(doc));
        }
        None
    }

    pub fn parse_accepted(body: &str) -> Option<BrokerReply> {
        serde_json::from_str(body).ok().map(BrokerReply::Accepted)
    }
}

/// One message inside a [`QueueMessagesChunk`](crate::messages::QueueMessagesChunk): the JSON
/// envelope a broker streams to consumers. The payload is the group-key-encrypted body,
/// base64-encoded for JSON transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub sequence_id: SequenceId,
    pub producer_id: String,
    pub payload: String,
}

impl QueueMessage {
    pub fn new(sequence_id: SequenceId, producer_id: &str, encrypted: &[u8]) -> QueueMessage {
        QueueMessage {
            sequence_id,
            producer_id: producer_id.to_string(),
            payload: STANDARD.encode(encrypted),
        }
    }

    pub fn encrypted_payload(&self) -> Option<Vec<u8>> {
        STANDARD.decode(&self.payload).ok()
    }

    pub fn encode_list(messages: &[QueueMessage]) -> Vec<u8> {
        serde_json::to_vec(messages).expect("serializing queue messages in memory cannot fail")
    }

    pub fn decode_list(bytes: &[u8]) -> Option<Vec<QueueMessage>> {
        serde_json::from_slice(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::keypair::Keypair;
    use borsh::BorshSerialize;

    #[test]
    fn queue_connect_params_roundtrip() {
        let params = QueueConnectParams {
            action: QueueConnectParams::ACTION.to_string(),
            group_key_info: GroupKeyInfo {
                key_id: "g1$alice@idhost.org".to_string(),
                fingerprint: "abc123".to_string(),
            },
            archive_folder_path: "archive/g1".to_string(),
            last_sequence_id: SequenceId::new(5),
            known_brokers: [(0u8, IdUrl::new("http://idhost.org/b0.xml"))]
                .into_iter()
                .collect(),
            position: Some(1),
        };
        let json = serde_json::to_string(&params).unwrap();
        let back: QueueConnectParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back.action, "queue-connect");
        assert_eq!(back.last_sequence_id, SequenceId::new(5));
        assert_eq!(back.position, Some(1));
        assert_eq!(
            back.known_brokers.get(&0),
            Some(&IdUrl::new("http://idhost.org/b0.xml"))
        );
    }

    #[test]
    fn broker_reply_prefixes() {
        let accepted = BrokerReply::parse(
            "accepted:{\"cooperated_brokers\": {\"0\": \"http://idhost.org/b0.xml\"}}",
        )
        .unwrap();
        let BrokerReply::Accepted(reply) = accepted else {
            panic!("expected Accepted");
        };
        assert_eq!(reply.cooperated_brokers.len(), 1);

        let mismatch =
            BrokerReply::parse("mismatch:{\"dht_brokers\": {\"1\": \"http://idhost.org/b1.xml\"}}")
                .unwrap();
        assert!(matches!(mismatch, BrokerReply::Mismatch(_)));

        assert!(BrokerReply::parse("denied").is_none());
    }

    #[test]
    fn identity_reply_decodes_document() {
        let keypair = Keypair::generate();
        let doc = IdentityDocument::new_signed(
            &keypair,
            "broker",
            vec![IdUrl::new("http://idhost.org/broker.xml")],
            vec!["tcp://203.0.113.7:7771".to_string()],
            1,
        );
        let encoded = STANDARD.encode(doc.try_to_vec().unwrap());
        let reply = BrokerReply::parse(&format!("identity:{}", encoded)).unwrap();
        let BrokerReply::Identity(decoded) = reply else {
            panic!("expected Identity");
        };
        assert_eq!(decoded.name, "broker");
    }

    #[test]
    fn queue_message_envelope_roundtrip() {
        let message = QueueMessage::new(SequenceId::new(7), "m1$alice@idhost.org", b"secret");
        let list = QueueMessage::encode_list(&[message.clone()]);
        let decoded = QueueMessage::decode_list(&list).unwrap();
        assert_eq!(decoded, vec![message.clone()]);
        assert_eq!(decoded[0].encrypted_payload().unwrap(), b"secret");
    }
}
