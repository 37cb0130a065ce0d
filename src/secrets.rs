//! Symmetric encryption for stored provider keys.
//!
//! AES-256-GCM under a process-wide 32-byte master key. Ciphertext tokens are
//! URL-safe base64 of `version || nonce || ciphertext+tag`; every call uses a
//! fresh random nonce.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE},
    Engine as _,
};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

const TOKEN_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;

/// Errors from the secret store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretError {
    /// The master key is missing or not exactly 32 bytes once decoded
    #[error("invalid master key: {0}")]
    InvalidMasterKey(String),

    /// No stored secret exists for the requested provider
    #[error("secret not found")]
    NotFound,

    /// A stored secret exists but has been disabled
    #[error("secret disabled")]
    Disabled,

    /// Ciphertext was tampered with, malformed, or produced under another key
    #[error("decryption failed")]
    Decrypt,

    #[error("encryption failed")]
    Encrypt,
}

/// Process-wide cipher for provider secrets.
///
/// The key is wiped from memory on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretStore {
    key: [u8; 32],
}

impl SecretStore {
    /// Create a store from a raw 256-bit key
    pub fn from_key(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Create a store from a base64-encoded master key (standard or URL-safe alphabet)
    pub fn from_master_key_b64(encoded: &str) -> Result<Self, SecretError> {
        let encoded = encoded.trim();
        if encoded.is_empty() {
            return Err(SecretError::InvalidMasterKey("empty".to_string()));
        }

        let mut raw = STANDARD
            .decode(encoded)
            .or_else(|_| URL_SAFE.decode(encoded))
            .map_err(|e| SecretError::InvalidMasterKey(format!("not base64: {}", e)))?;

        if raw.len() != 32 {
            let len = raw.len();
            raw.zeroize();
            return Err(SecretError::InvalidMasterKey(format!(
                "must decode to exactly 32 bytes, got {}",
                len
            )));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&raw);
        raw.zeroize();
        Ok(Self { key })
    }

    fn cipher(&self) -> Result<Aes256Gcm, SecretError> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|_| SecretError::Encrypt)
    }

    /// Encrypt a plaintext secret into a portable token
    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| SecretError::Encrypt)?;

        let mut token = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        token.push(TOKEN_VERSION);
        token.extend_from_slice(&nonce_bytes);
        token.extend_from_slice(&ciphertext);

        Ok(URL_SAFE.encode(token))
    }

    /// Decrypt a token produced by [`SecretStore::encrypt`]
    pub fn decrypt(&self, token: &str) -> Result<String, SecretError> {
        let raw = URL_SAFE
            .decode(token.trim())
            .map_err(|_| SecretError::Decrypt)?;

        if raw.len() <= 1 + NONCE_LEN || raw[0] != TOKEN_VERSION {
            return Err(SecretError::Decrypt);
        }

        let (nonce, ciphertext) = raw[1..].split_at(NONCE_LEN);
        let plaintext = self
            .cipher()
            .map_err(|_| SecretError::Decrypt)?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SecretError::Decrypt)?;

        String::from_utf8(plaintext).map_err(|_| SecretError::Decrypt)
    }
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("key", &"[REDACTED]")
            .finish()
    }
}
