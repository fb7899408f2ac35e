//! Encryption at rest for stored payloads.
//!
//! Every payload blob in the local database is sealed with
//! ChaCha20-Poly1305 under a key obtained from the injected
//! [`KeyProvider`]. Blobs are laid out as `nonce || ciphertext` with a
//! fresh random nonce per seal, so identical plaintexts never produce
//! identical blobs.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde_json::Value;

use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;

/// Supplies the 256-bit key protecting the local database. The key comes
/// from outside the sync core (platform keystore, derived from account
/// credentials); the store never persists it.
pub trait KeyProvider: Send + Sync {
    fn encryption_key(&self) -> Result<[u8; 32]>;
}

/// A fixed in-memory key. Suitable for tests and callers that manage key
/// material themselves.
pub struct StaticKeyProvider(pub [u8; 32]);

impl KeyProvider for StaticKeyProvider {
    fn encryption_key(&self) -> Result<[u8; 32]> {
        Ok(self.0)
    }
}

/// Seals and opens payload blobs.
pub struct Cipher {
    aead: ChaCha20Poly1305,
}

impl Cipher {
    /// Build a cipher from the provider's current key.
    pub fn new(keys: &dyn KeyProvider) -> Result<Self> {
        let key = keys.encryption_key()?;
        Ok(Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(&key)),
        })
    }

    /// Encrypt a plaintext into a `nonce || ciphertext` blob.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| Error::Crypto(format!("seal failed: {e}")))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt a blob produced by [`Cipher::seal`]. Fails if the blob was
    /// tampered with or sealed under a different key.
    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < NONCE_LEN {
            return Err(Error::Corrupt("encrypted blob too short".into()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| Error::Crypto(format!("open failed: {e}")))
    }

    /// Seal a JSON value.
    pub fn seal_json(&self, value: &Value) -> Result<Vec<u8>> {
        let plaintext = serde_json::to_vec(value)
            .map_err(|e| Error::Corrupt(format!("payload not serializable: {e}")))?;
        self.seal(&plaintext)
    }

    /// Open a blob back into a JSON value.
    pub fn open_json(&self, blob: &[u8]) -> Result<Value> {
        let plaintext = self.open(blob)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| Error::Corrupt(format!("decrypted payload is not JSON: {e}")))
    }
}
