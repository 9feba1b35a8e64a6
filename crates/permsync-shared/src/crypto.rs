//! Sealing of subscription fetch credentials at rest.
//!
//! Passwords are encrypted with XChaCha20-Poly1305 under the instance's
//! credential key before they reach the store. The store and the merge
//! engine only ever see the sealed bytes.

use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::constants::{CREDENTIAL_KEY_SIZE, NONCE_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; CREDENTIAL_KEY_SIZE];

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; CREDENTIAL_KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// A credential as stored: nonce || ciphertext. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealedCredential(pub Vec<u8>);

impl fmt::Debug for SealedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SealedCredential(<redacted>)")
    }
}

/// Seals and opens fetch passwords with the instance credential key.
#[derive(Clone)]
pub struct CredentialCipher {
    aead: XChaCha20Poly1305,
}

impl CredentialCipher {
    pub fn new(key: SymmetricKey) -> Self {
        Self {
            aead: XChaCha20Poly1305::new(&key.into()),
        }
    }

    pub fn from_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let key: SymmetricKey = hex::decode(hex_key.trim())
            .map_err(|_| CryptoError::InvalidKeyLength)?
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self::new(key))
    }

    /// Encrypt `secret` under a fresh random nonce.
    pub fn seal(&self, secret: &str) -> Result<SealedCredential, CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .aead
            .encrypt(XNonce::from_slice(&nonce), secret.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut sealed = nonce.to_vec();
        sealed.extend(ciphertext);
        Ok(SealedCredential(sealed))
    }

    pub fn open(&self, sealed: &SealedCredential) -> Result<String, CryptoError> {
        if sealed.0.len() < NONCE_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let (nonce, ciphertext) = sealed.0.split_at(NONCE_SIZE);
        let plaintext = self
            .aead
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
    }
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialCipher(<redacted>)")
    }
}
