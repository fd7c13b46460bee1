//! Encryption glue between RPC payloads and the external cipher.
//!
//! Wire payloads are `base64(cipher.encrypt(json_bytes))`. The cipher itself
//! (key exchange, AEAD choice) belongs to the relay layer and is injected as a
//! [`Cipher`] implementation.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Key scheme a peer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EncryptionVariant {
    /// Shared secret from the original pairing
    Legacy,
    /// Per-session data encryption key
    DataKey,
}

/// Errors from encoding or decoding an RPC payload.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encrypt/decrypt by key and variant.
pub trait Cipher: Send + Sync {
    fn encrypt(
        &self,
        key: &[u8],
        variant: EncryptionVariant,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CodecError>;

    fn decrypt(
        &self,
        key: &[u8],
        variant: EncryptionVariant,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CodecError>;
}

/// Pass-through cipher for loopback transports and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCipher;

impl Cipher for IdentityCipher {
    fn encrypt(
        &self,
        _key: &[u8],
        _variant: EncryptionVariant,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CodecError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(
        &self,
        _key: &[u8],
        _variant: EncryptionVariant,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CodecError> {
        Ok(ciphertext.to_vec())
    }
}

/// A cipher bound to one peer's key and variant.
#[derive(Clone)]
pub struct EncryptionContext {
    cipher: Arc<dyn Cipher>,
    key: Arc<[u8]>,
    variant: EncryptionVariant,
}

impl std::fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionContext")
            .field("variant", &self.variant)
            .field("key_len", &self.key.len())
            .finish_non_exhaustive()
    }
}

impl EncryptionContext {
    pub fn new(cipher: Arc<dyn Cipher>, key: impl Into<Arc<[u8]>>, variant: EncryptionVariant) -> Self {
        Self {
            cipher,
            key: key.into(),
            variant,
        }
    }

    /// Loopback context with [`IdentityCipher`] and an empty key.
    pub fn plaintext() -> Self {
        Self::new(Arc::new(IdentityCipher), Vec::new(), EncryptionVariant::Legacy)
    }

    pub fn variant(&self) -> EncryptionVariant {
        self.variant
    }

    /// Serialize `value` to JSON, encrypt it and base64-encode the result.
    pub fn encrypt_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<String, CodecError> {
        let plain = serde_json::to_vec(value)?;
        let sealed = self.cipher.encrypt(&self.key, self.variant, &plain)?;
        Ok(STANDARD.encode(sealed))
    }

    /// Inverse of [`encrypt_json`](Self::encrypt_json).
    pub fn decrypt_json<T: DeserializeOwned>(&self, payload: &str) -> Result<T, CodecError> {
        let sealed = STANDARD.decode(payload.trim())?;
        let plain = self.cipher.decrypt(&self.key, self.variant, &sealed)?;
        Ok(serde_json::from_slice(&plain)?)
    }
}
