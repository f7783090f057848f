//! Authenticated encryption for environment secrets.
//!
//! A process-wide 32-byte master key drives an XChaCha20-Poly1305 AEAD. The
//! wire format is `base64(nonce || ciphertext || tag)` with a fresh random
//! 24-byte nonce per value. Decryption fails closed on any tampering or a
//! wrong key. Plaintext secret values only ever leave this module inside the
//! environment vector handed to the container runtime.

use std::collections::BTreeMap;
use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use rand::Rng;
use thiserror::Error;
use zeroize::Zeroizing;

const NONCE_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("master key must be 32 bytes of base64")]
    InvalidKey,
    #[error("encryption failed")]
    Encrypt,
    #[error("ciphertext rejected: tampered, truncated, or wrong key")]
    Tamper,
}

/// Process-wide secrets vault.
pub struct SecretsVault {
    cipher: XChaCha20Poly1305,
}

impl SecretsVault {
    pub fn new(key: [u8; 32]) -> Self {
        let key = Zeroizing::new(key);
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key.as_ref())),
        }
    }

    /// Loads the master key from its base64 configuration form.
    pub fn from_base64(encoded: &str) -> Result<Self, VaultError> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|_| VaultError::InvalidKey)?;
        let key: [u8; 32] = raw.try_into().map_err(|_| VaultError::InvalidKey)?;
        Ok(Self::new(key))
    }

    /// Random throwaway key for non-production runs. Anything encrypted with
    /// it is unreadable after restart.
    pub fn generate_ephemeral() -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill(key.as_mut_slice());
        Self::new(*key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill(nonce_bytes.as_mut_slice());
        let nonce = XNonce::from(nonce_bytes);

        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Encrypt)?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + sealed.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&sealed);
        Ok(STANDARD.encode(envelope))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<Zeroizing<String>, VaultError> {
        let envelope = STANDARD
            .decode(ciphertext.trim())
            .map_err(|_| VaultError::Tamper)?;
        if envelope.len() <= NONCE_LEN {
            return Err(VaultError::Tamper);
        }

        let (nonce_bytes, sealed) = envelope.split_at(NONCE_LEN);
        let nonce = XNonce::from_slice(nonce_bytes);
        let plain = Zeroizing::new(
            self.cipher
                .decrypt(nonce, sealed)
                .map_err(|_| VaultError::Tamper)?,
        );

        String::from_utf8(plain.to_vec())
            .map(Zeroizing::new)
            .map_err(|_| VaultError::Tamper)
    }

    /// Encrypts every value of a plaintext map.
    pub fn encrypt_map(
        &self,
        plain: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, VaultError> {
        plain
            .iter()
            .map(|(key, value)| Ok((key.clone(), self.encrypt(value)?)))
            .collect()
    }

    /// Decrypts every value of a ciphertext map. The result flows directly
    /// into a container environment vector and is never persisted or logged.
    pub fn decrypt_map(
        &self,
        sealed: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, VaultError> {
        sealed
            .iter()
            .map(|(key, value)| Ok((key.clone(), self.decrypt(value)?.to_string())))
            .collect()
    }
}

impl fmt::Debug for SecretsVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretsVault").finish()
    }
}
