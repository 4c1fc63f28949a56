//! Envelope encryption for secret values.
//!
//! Values are sealed with a per-project data key using an AEAD cipher:
//! - AES-256-GCM (default) or ChaCha20-Poly1305
//! - A fresh random 12-byte IV per call
//! - Ciphertext is the cipher output followed by the 16-byte tag
//! - Empty associated data
//!
//! Binding the payload to its `(project, secret, environment)` context through
//! AAD is a possible hardening step. It is not applied, so payloads stay
//! portable for rollback copies and key rotation.

use std::fmt;
use std::sync::Arc;

use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::keys::{KeyManager, KeyStatus};
use crate::types::{KeyId, ProjectId, SecretValue};

/// Size of a data key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of the IV in bytes (96 bits).
pub const IV_SIZE: usize = 12;

/// Size of the authentication tag in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// AEAD cipher used by a data key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// AES-256 in Galois/Counter Mode.
    #[default]
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    /// ChaCha20 with Poly1305.
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl KeyAlgorithm {
    /// Returns the key type string stored on key records.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Aes256Gcm => "aes-256-gcm",
            Self::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Raw symmetric key material, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    bytes: [u8; KEY_SIZE],
    #[zeroize(skip)]
    algorithm: KeyAlgorithm,
}

impl DataKey {
    /// Generates a new random key for `algorithm`.
    #[must_use]
    pub fn generate(algorithm: KeyAlgorithm) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes, algorithm }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8], algorithm: KeyAlgorithm) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| Error::Encryption {
            reason: format!("key must be exactly {KEY_SIZE} bytes, got {}", bytes.len()),
        })?;
        Ok(Self { bytes, algorithm })
    }

    /// Returns the key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the cipher this key is used with.
    #[must_use]
    pub const fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKey")
            .field("algorithm", &self.algorithm)
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Seals `plaintext` under `key` with a fresh random IV.
///
/// Returns `(ciphertext || tag, iv)`.
///
/// # Errors
///
/// Returns [`Error::Encryption`] if the cipher rejects the input.
pub fn seal(key: &DataKey, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; IV_SIZE])> {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);

    let sealed = match key.algorithm {
        KeyAlgorithm::Aes256Gcm => Aes256Gcm::new_from_slice(&key.bytes)
            .map_err(|e| Error::Encryption {
                reason: format!("failed to create cipher: {e}"),
            })?
            .encrypt(nonce, plaintext),
        KeyAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(&key.bytes)
            .map_err(|e| Error::Encryption {
                reason: format!("failed to create cipher: {e}"),
            })?
            .encrypt(nonce, plaintext),
    };

    let ciphertext = sealed.map_err(|e| Error::Encryption {
        reason: format!("encryption failed: {e}"),
    })?;
    Ok((ciphertext, iv))
}

/// Opens a payload produced by [`seal`].
///
/// # Errors
///
/// Returns [`Error::DecryptionError`] if the IV or ciphertext is malformed or
/// the tag does not verify.
pub fn open(key: &DataKey, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    if iv.len() != IV_SIZE {
        return Err(Error::DecryptionError {
            reason: format!("iv must be {IV_SIZE} bytes, got {}", iv.len()),
        });
    }
    if ciphertext.len() < TAG_SIZE {
        return Err(Error::DecryptionError {
            reason: format!(
                "ciphertext too short: expected at least {TAG_SIZE} bytes, got {}",
                ciphertext.len()
            ),
        });
    }
    let nonce = Nonce::from_slice(iv);

    let opened = match key.algorithm {
        KeyAlgorithm::Aes256Gcm => Aes256Gcm::new_from_slice(&key.bytes)
            .map_err(|e| Error::DecryptionError {
                reason: format!("failed to create cipher: {e}"),
            })?
            .decrypt(nonce, ciphertext),
        KeyAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(&key.bytes)
            .map_err(|e| Error::DecryptionError {
                reason: format!("failed to create cipher: {e}"),
            })?
            .decrypt(nonce, ciphertext),
    };

    opened.map_err(|_| Error::DecryptionError {
        reason: "authentication tag mismatch".to_string(),
    })
}

/// An encrypted value together with the IV and the data key that sealed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Cipher output followed by the authentication tag.
    pub ciphertext: Vec<u8>,
    /// Random IV used for this payload.
    pub iv: Vec<u8>,
    /// Data key that sealed the payload.
    pub key_id: KeyId,
}

/// Stateless envelope cipher over the project's data keys.
#[derive(Debug, Clone)]
pub struct Encryptor {
    keys: Arc<KeyManager>,
}

impl Encryptor {
    /// Creates an encryptor backed by `keys`.
    #[must_use]
    pub const fn new(keys: Arc<KeyManager>) -> Self {
        Self { keys }
    }

    /// Returns the key manager.
    #[must_use]
    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// Encrypts `plaintext` under the project's active data key.
    ///
    /// # Errors
    ///
    /// Returns an error if no key can be obtained or sealing fails.
    pub fn encrypt(&self, plaintext: &[u8], project: ProjectId) -> Result<EncryptedPayload> {
        let (key_id, key) = self.keys.current_key(project)?;
        let (ciphertext, iv) = seal(&key, plaintext)?;
        Ok(EncryptedPayload {
            ciphertext,
            iv: iv.to_vec(),
            key_id,
        })
    }

    /// Decrypts a payload with whichever project key sealed it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DecryptionError`] on tag mismatch or an unknown key.
    pub fn decrypt(&self, payload: &EncryptedPayload, project: ProjectId) -> Result<SecretValue> {
        let key = self
            .keys
            .get_key(&payload.key_id, project)
            .map_err(|err| match err {
                Error::KeyNotFound { key_id } => Error::DecryptionError {
                    reason: format!("unknown key {key_id}"),
                },
                other => other,
            })?;
        open(&key, &payload.ciphertext, &payload.iv).map(SecretValue::new)
    }

    /// Moves a payload sealed by a non-active key onto the project's active
    /// key. Payloads already on the active key are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DecryptionError`] if the payload cannot be opened.
    pub fn reseal(&self, payload: EncryptedPayload, project: ProjectId) -> Result<EncryptedPayload> {
        if self.keys.key_status(&payload.key_id, project) == Some(KeyStatus::Active) {
            return Ok(payload);
        }
        let plaintext = self.decrypt(&payload, project)?;
        self.encrypt(plaintext.as_bytes(), project)
    }
}

/// Re-seals payloads from a retiring data key under its replacement.
pub struct Rekeyer {
    old_id: KeyId,
    old: DataKey,
    new_id: KeyId,
    new: DataKey,
}

impl Rekeyer {
    pub(crate) const fn new(old_id: KeyId, old: DataKey, new_id: KeyId, new: DataKey) -> Self {
        Self {
            old_id,
            old,
            new_id,
            new,
        }
    }

    /// The key being retired.
    #[must_use]
    pub const fn old_key_id(&self) -> &KeyId {
        &self.old_id
    }

    /// The replacement key.
    #[must_use]
    pub const fn new_key_id(&self) -> &KeyId {
        &self.new_id
    }

    /// Re-encrypts `payload` under the new key.
    ///
    /// Returns `None` when the payload is not sealed by the old key, which
    /// makes repeated runs over the same version a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DecryptionError`] if the payload does not open under
    /// the old key.
    pub fn rekey(&self, payload: &EncryptedPayload) -> Result<Option<EncryptedPayload>> {
        if payload.key_id != self.old_id {
            return Ok(None);
        }
        let plaintext = SecretValue::new(open(&self.old, &payload.ciphertext, &payload.iv)?);
        let (ciphertext, iv) = seal(&self.new, plaintext.as_bytes())?;
        Ok(Some(EncryptedPayload {
            ciphertext,
            iv: iv.to_vec(),
            key_id: self.new_id.clone(),
        }))
    }
}

impl fmt::Debug for Rekeyer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rekeyer")
            .field("old_id", &self.old_id)
            .field("new_id", &self.new_id)
            .finish_non_exhaustive()
    }
}
