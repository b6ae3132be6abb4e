//! Field encryption for sensitive catalog columns
//!
//! Provider payloads and change-log snapshots are sealed with AES-256-GCM before
//! they reach SQLite. Sealed values are stored as `enc:v1:<nonce>:<ciphertext>`
//! with both parts base64 encoded.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;

use crate::error::{CatalogError, Result};

/// AES-256-GCM nonce size (96 bits = 12 bytes)
const NONCE_SIZE: usize = 12;
/// AES-256 key size (256 bits = 32 bytes)
const KEY_SIZE: usize = 32;
const SEALED_PREFIX: &str = "enc:v1:";

/// Cipher used by repositories that persist sensitive fields
#[derive(Clone)]
pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl FieldCipher {
    /// Create a cipher from raw key bytes. The key must be exactly 32 bytes.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(CatalogError::Config(format!(
                "encryption key must be {} bytes, got {}",
                KEY_SIZE,
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CatalogError::Encryption(format!("failed to create cipher: {}", e)))?;

        Ok(Self { cipher })
    }

    /// Create from a base64-encoded key
    pub fn from_base64_key(key_b64: &str) -> Result<Self> {
        Self::new(&Self::decode_key(key_b64)?)
    }

    /// Decode a base64 key and check it is a full AES-256 key
    pub fn decode_key(key_b64: &str) -> Result<Vec<u8>> {
        let key = BASE64
            .decode(key_b64.trim())
            .map_err(|e| CatalogError::Config(format!("invalid base64 encryption key: {}", e)))?;
        if key.len() != KEY_SIZE {
            return Err(CatalogError::Config(format!(
                "encryption key must decode to {} bytes, got {}",
                KEY_SIZE,
                key.len()
            )));
        }
        Ok(key)
    }

    /// Generate a random base64 key (for initial setup and tests)
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        BASE64.encode(key)
    }

    /// Encrypt a value for storage
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CatalogError::Encryption(format!("encryption failed: {}", e)))?;

        Ok(format!(
            "{}{}:{}",
            SEALED_PREFIX,
            BASE64.encode(nonce_bytes),
            BASE64.encode(ciphertext)
        ))
    }

    /// Decrypt a value produced by [seal](Self::seal)
    pub fn open(&self, sealed: &str) -> Result<String> {
        let body = sealed
            .strip_prefix(SEALED_PREFIX)
            .ok_or_else(|| CatalogError::Encryption("value is not sealed".into()))?;
        let (nonce_b64, data_b64) = body
            .split_once(':')
            .ok_or_else(|| CatalogError::Encryption("malformed sealed value".into()))?;

        let nonce_bytes = BASE64
            .decode(nonce_b64)
            .map_err(|e| CatalogError::Encryption(format!("invalid nonce: {}", e)))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(CatalogError::Encryption(format!(
                "invalid nonce length: expected {}, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            )));
        }
        let ciphertext = BASE64
            .decode(data_b64)
            .map_err(|e| CatalogError::Encryption(format!("invalid ciphertext: {}", e)))?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| CatalogError::Encryption(format!("decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| CatalogError::Encryption(format!("invalid UTF-8 in decrypted data: {}", e)))
    }

    pub fn seal_opt(&self, plaintext: Option<&str>) -> Result<Option<String>> {
        plaintext.map(|p| self.seal(p)).transpose()
    }

    pub fn open_opt(&self, sealed: Option<&str>) -> Result<Option<String>> {
        sealed.map(|s| self.open(s)).transpose()
    }
}

// Implement Debug without exposing the cipher
impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher")
            .field("cipher", &"[REDACTED]")
            .finish()
    }
}
