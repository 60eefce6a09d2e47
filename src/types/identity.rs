/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Signed peer identity documents.
//!
//! An identity document maps a peer to its public key, its transport endpoints and its mirror
//! sources. The signature covers a deterministic serialization of every other field; the
//! revision is strictly increasing for a given public key, which is what lets caches reject
//! stale copies and detect rotation (same public key, new first source).

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::VerifyingKey;

use crate::messages::SignedMessage;
use crate::types::basic::{SignatureBytes, VerifyingKeyBytes};
use crate::types::idurl::IdUrl;
use crate::types::keypair::Keypair;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdentityError {
    /// The document has no sources, an empty name, or an undecodable public key.
    Malformed,
    /// The signature does not verify against the document's own public key.
    BadSignature,
    /// The revision is not newer than an already cached copy.
    StaleRevision,
}

impl Display for IdentityError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let text = match self {
            IdentityError::Malformed => "malformed identity document",
            IdentityError::BadSignature => "identity signature is invalid",
            IdentityError::StaleRevision => "identity revision is stale",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct IdentityDocument {
    pub name: String,
    pub public_key: VerifyingKeyBytes,
    /// Every URL this identity is published at. The first source is the canonical IDURL.
    pub sources: Vec<IdUrl>,
    /// Transport endpoints, e.g. `tcp://203.0.113.7:7771`.
    pub contacts: Vec<String>,
    pub revision: u32,
    pub signature: SignatureBytes,
}

impl IdentityDocument {
    /// Builds and signs a document with `keypair`.
    pub fn new_signed(
        keypair: &Keypair,
        name: &str,
        sources: Vec<IdUrl>,
        contacts: Vec<String>,
        revision: u32,
    ) -> IdentityDocument {
        let mut doc = IdentityDocument {
            name: name.to_string(),
            public_key: keypair.public_bytes(),
            sources,
            contacts,
            revision,
            signature: SignatureBytes::new([0u8; 64]),
        };
        doc.signature = keypair.sign(&doc.message_bytes());
        doc
    }

    /// The canonical IDURL: the first source. `None` only for malformed documents.
    pub fn default_source(&self) -> Option<&IdUrl> {
        self.sources.first()
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, IdentityError> {
        VerifyingKey::from_bytes(&self.public_key.bytes()).map_err(|_| IdentityError::Malformed)
    }

    /// Full structural + signature validation. Documents that fail here are never cached.
    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.name.is_empty() || self.sources.is_empty() {
            return Err(IdentityError::Malformed);
        }
        let key = self.verifying_key()?;
        if !self.is_correct(&key) {
            return Err(IdentityError::BadSignature);
        }
        Ok(())
    }
}

impl SignedMessage for IdentityDocument {
    fn message_bytes(&self) -> Vec<u8> {
        let unsigned = (
            &self.name,
            &self.public_key,
            &self.sources,
            &self.contacts,
            self.revision,
        );
        unsigned
            .try_to_vec()
            .expect("serializing an identity document in memory cannot fail")
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_doc(keypair: &Keypair, revision: u32) -> IdentityDocument {
        IdentityDocument::new_signed(
            keypair,
            "alice",
            vec![IdUrl::new("http://idhost.org/alice.xml")],
            vec!["tcp://203.0.113.7:7771".to_string()],
            revision,
        )
    }

    #[test]
    fn signed_document_validates() {
        let keypair = Keypair::generate();
        let doc = signed_doc(&keypair, 1);
        assert!(doc.validate().is_ok());
        assert_eq!(
            doc.default_source(),
            Some(&IdUrl::new("http://idhost.org/alice.xml"))
        );
    }

    #[test]
    fn tampering_breaks_the_signature() {
        let keypair = Keypair::generate();
        let mut doc = signed_doc(&keypair, 1);
        doc.revision = 2;
        assert_eq!(doc.validate(), Err(IdentityError::BadSignature));
    }

    #[test]
    fn empty_sources_are_malformed() {
        let keypair = Keypair::generate();
        let mut doc = signed_doc(&keypair, 1);
        doc.sources.clear();
        assert_eq!(doc.validate(), Err(IdentityError::Malformed));
    }
}
