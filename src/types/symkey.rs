/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Symmetric group keys.
//!
//! Every group shares one AES-256-GCM key. Queue message payloads travel encrypted with it;
//! brokers only ever see ciphertext. Wire layout of an encrypted payload: 12-byte nonce
//! followed by the ciphertext.

use std::fmt::{self, Display, Formatter};

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupKeyError {
    /// Ciphertext too short to contain a nonce, or authentication failed.
    DecryptFailed,
    EncryptFailed,
}

impl Display for GroupKeyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let text = match self {
            GroupKeyError::DecryptFailed => "group payload failed to decrypt",
            GroupKeyError::EncryptFailed => "group payload failed to encrypt",
        };
        f.write_str(text)
    }
}

/// A group's shared symmetric key.
#[derive(Clone, PartialEq, Eq)]
pub struct GroupKey([u8; 32]);

impl GroupKey {
    pub const fn new(bytes: [u8; 32]) -> Self {
        GroupKey(bytes)
    }

    pub fn generate() -> Self {
        GroupKey(Aes256Gcm::generate_key(&mut OsRng).into())
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, GroupKeyError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| GroupKeyError::EncryptFailed)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, GroupKeyError> {
        if data.len() < NONCE_LEN {
            return Err(GroupKeyError::DecryptFailed);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| GroupKeyError::DecryptFailed)
    }

    /// A short stable fingerprint, used in queue-connect parameters and logs.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        crate::logging::first_seven_base64_chars(&digest)
    }
}

impl fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "GroupKey({})", self.fingerprint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt() {
        let key = GroupKey::generate();
        let plaintext = br#"{"text":"hi"}"#;
        let sealed = key.encrypt(plaintext).unwrap();
        assert_ne!(&sealed[NONCE_LEN..], plaintext.as_slice());
        assert_eq!(key.decrypt(&sealed).unwrap(), plaintext.to_vec());
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let sealed = GroupKey::generate().encrypt(b"payload").unwrap();
        assert_eq!(
            GroupKey::generate().decrypt(&sealed),
            Err(GroupKeyError::DecryptFailed)
        );
    }
}
