//! Encryption of PHI event details at rest
//!
//! When a recorder is configured with an encryptor, the copy of a
//! `phiAccessed` event handed to the audit store carries an AES-256-GCM
//! envelope in place of its plaintext `details`. Key IDs allow rotation:
//! new events are sealed with the active key, older envelopes open with
//! any registered key.

use crate::error::{Result, SentinelError};
use crate::types::SecurityEvent;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// Encrypted details envelope stored in `event.details`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedDetails {
    /// Identifies which key sealed the details
    pub key_id: String,

    /// Base64-encoded 96-bit nonce
    pub nonce: String,

    /// Base64-encoded ciphertext
    pub ciphertext: String,

    /// Marker to identify encrypted details
    #[serde(default = "default_encrypted")]
    pub encrypted: bool,
}

fn default_encrypted() -> bool {
    true
}

impl EncryptedDetails {
    /// Check whether an event's details hold an encrypted envelope
    pub fn is_encrypted(details: &BTreeMap<String, serde_json::Value>) -> bool {
        details
            .get("encrypted")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    fn into_details(self) -> Result<BTreeMap<String, serde_json::Value>> {
        let value = serde_json::to_value(self)?;
        Ok(serde_json::from_value(value)?)
    }

    fn from_details(details: &BTreeMap<String, serde_json::Value>) -> Result<Self> {
        let value = serde_json::to_value(details)?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Trait for sealing and opening event details
pub trait DetailsEncryptor: Send + Sync {
    /// Encrypt a details map into an envelope
    fn encrypt(&self, details: &BTreeMap<String, serde_json::Value>) -> Result<EncryptedDetails>;

    /// Decrypt an envelope back into the original details map
    fn decrypt(&self, envelope: &EncryptedDetails) -> Result<BTreeMap<String, serde_json::Value>>;

    /// The key ID used for new envelopes
    fn active_key_id(&self) -> &str;

    /// Copy of `event` whose details are replaced by an envelope
    fn seal_event(&self, event: &SecurityEvent) -> Result<SecurityEvent> {
        let envelope = self.encrypt(&event.details)?;
        let mut sealed = event.clone();
        sealed.details = envelope.into_details()?;
        Ok(sealed)
    }

    /// Reverse of `seal_event`; events without an envelope pass through
    fn open_event(&self, event: &SecurityEvent) -> Result<SecurityEvent> {
        if !EncryptedDetails::is_encrypted(&event.details) {
            return Ok(event.clone());
        }
        let envelope = EncryptedDetails::from_details(&event.details)?;
        let mut opened = event.clone();
        opened.details = self.decrypt(&envelope)?;
        Ok(opened)
    }
}

/// AES-256-GCM encryptor with key rotation support
///
/// Encrypts with the active key, decrypts with any registered key.
pub struct Aes256GcmEncryptor {
    active_key_id: String,

    /// All registered keys (key_id → cipher)
    keys: RwLock<HashMap<String, Aes256Gcm>>,
}

impl Aes256GcmEncryptor {
    /// Create a new encryptor with a single 256-bit key
    pub fn new(key_id: impl Into<String>, key: &[u8; 32]) -> Self {
        let key_id = key_id.into();
        let mut keys = HashMap::new();
        keys.insert(key_id.clone(), Aes256Gcm::new(key.into()));

        Self {
            active_key_id: key_id,
            keys: RwLock::new(keys),
        }
    }

    /// Register a key for decryption (key rotation)
    pub fn add_key(&self, key_id: impl Into<String>, key: &[u8; 32]) -> Result<()> {
        let mut keys = self.keys.write().map_err(|e| {
            SentinelError::Encryption(format!("Failed to acquire key lock: {}", e))
        })?;
        keys.insert(key_id.into(), Aes256Gcm::new(key.into()));
        Ok(())
    }

    /// Rotate to a registered key
    pub fn rotate_to(&mut self, key_id: &str) -> Result<()> {
        let keys = self.keys.read().map_err(|e| {
            SentinelError::Encryption(format!("Failed to acquire key lock: {}", e))
        })?;
        if !keys.contains_key(key_id) {
            return Err(SentinelError::Encryption(format!(
                "Key '{}' not registered, add it first",
                key_id
            )));
        }
        drop(keys);
        self.active_key_id = key_id.to_string();
        Ok(())
    }

    pub fn key_ids(&self) -> Vec<String> {
        self.keys
            .read()
            .map(|keys| keys.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl DetailsEncryptor for Aes256GcmEncryptor {
    fn encrypt(&self, details: &BTreeMap<String, serde_json::Value>) -> Result<EncryptedDetails> {
        let plaintext = serde_json::to_vec(details)?;

        let keys = self.keys.read().map_err(|e| {
            SentinelError::Encryption(format!("Failed to acquire key lock: {}", e))
        })?;
        let cipher = keys.get(&self.active_key_id).ok_or_else(|| {
            SentinelError::Encryption(format!("Active key '{}' not found", self.active_key_id))
        })?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|e| SentinelError::Encryption(format!("Encryption failed: {}", e)))?;

        Ok(EncryptedDetails {
            key_id: self.active_key_id.clone(),
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
            encrypted: true,
        })
    }

    fn decrypt(&self, envelope: &EncryptedDetails) -> Result<BTreeMap<String, serde_json::Value>> {
        let keys = self.keys.read().map_err(|e| {
            SentinelError::Encryption(format!("Failed to acquire key lock: {}", e))
        })?;
        let cipher = keys.get(&envelope.key_id).ok_or_else(|| {
            SentinelError::Encryption(format!(
                "Decryption key '{}' not registered",
                envelope.key_id
            ))
        })?;

        let nonce_bytes = BASE64
            .decode(&envelope.nonce)
            .map_err(|e| SentinelError::Encryption(format!("Invalid nonce encoding: {}", e)))?;
        if nonce_bytes.len() != 12 {
            return Err(SentinelError::Encryption(format!(
                "Invalid nonce length: {}",
                nonce_bytes.len()
            )));
        }
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|e| SentinelError::Encryption(format!("Invalid ciphertext encoding: {}", e)))?;

        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|e| SentinelError::Encryption(format!("Decryption failed: {}", e)))?;

        serde_json::from_slice(&plaintext).map_err(Into::into)
    }

    fn active_key_id(&self) -> &str {
        &self.active_key_id
    }
}
