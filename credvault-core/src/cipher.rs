//! AES-256-GCM encryption for stored tokens.
//!
//! The key is derived from a configured secret with SHA-256, so the same
//! secret always yields the same key and ciphertexts stay readable across
//! restarts. Each ciphertext is `base64(nonce || ciphertext || tag)` and
//! carries everything needed to decrypt it.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the derived key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the GCM nonce in bytes (96 bits)
const NONCE_SIZE: usize = 12;

/// Error type for cipher operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// Plaintext could not be encrypted.
    #[error("encryption failed: {message}")]
    Encryption { message: String },

    /// Ciphertext is malformed, truncated, tampered with, or was produced
    /// under a different key.
    #[error("decryption failed: {message}")]
    Decryption { message: String },
}

impl CipherError {
    fn decryption(message: impl Into<String>) -> Self {
        Self::Decryption {
            message: message.into(),
        }
    }
}

/// Symmetric key material derived from a secret.
///
/// The bytes are wiped on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl PartialEq for EncryptionKey {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for EncryptionKey {}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

/// Derive a key from a secret string.
///
/// Deterministic: the same secret always produces the same key.
pub fn derive_key(secret: &str) -> EncryptionKey {
    let digest = Sha256::digest(secret.as_bytes());
    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&digest);
    EncryptionKey::from_bytes(bytes)
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
pub fn encrypt(plaintext: &str, key: &EncryptionKey) -> Result<String, CipherError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|e| CipherError::Encryption {
        message: format!("failed to create cipher: {e}"),
    })?;

    // Never reuse a nonce under the same key
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| CipherError::Encryption {
            message: e.to_string(),
        })?;

    let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(combined))
}

/// Decrypt a value produced by [`encrypt`].
///
/// Fails rather than returning garbage when the input is not a valid
/// ciphertext for `key`.
pub fn decrypt(ciphertext: &str, key: &EncryptionKey) -> Result<String, CipherError> {
    let combined = BASE64
        .decode(ciphertext)
        .map_err(|e| CipherError::decryption(format!("invalid base64: {e}")))?;

    if combined.len() <= NONCE_SIZE {
        return Err(CipherError::decryption("ciphertext too short"));
    }

    let (nonce_bytes, sealed) = combined.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CipherError::decryption(format!("failed to create cipher: {e}")))?;

    let plaintext = cipher
        .decrypt(nonce, sealed)
        .map_err(|_| CipherError::decryption("wrong key or corrupted data"))?;

    String::from_utf8(plaintext)
        .map_err(|_| CipherError::decryption("decrypted data is not valid UTF-8"))
}
