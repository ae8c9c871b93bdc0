//! Destination records, the directory that resolves them, and the codec
//! for their stored credentials.

use crate::model::{Credentials, Schema};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Identity of a destination: id plus deployment type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestinationKey {
    pub dest_id: String,
    #[serde(default = "default_dest_type")]
    pub dest_type: String,
}

fn default_dest_type() -> String {
    "prod".to_string()
}

impl DestinationKey {
    pub fn new(dest_id: impl Into<String>, dest_type: impl Into<String>) -> Self {
        Self {
            dest_id: dest_id.into(),
            dest_type: dest_type.into(),
        }
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dest_id, self.dest_type)
    }
}

/// A configured downstream registry or hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    #[serde(flatten)]
    pub key: DestinationKey,

    /// Endpoint URI
    pub dest_uri: String,

    /// Schema version spoken by the destination ("2011", "2014", "hub")
    #[serde(default)]
    pub dest_version: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    /// Password, encrypted with the configured credential key
    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub maintenance_start: Option<DateTime<Utc>>,

    #[serde(default)]
    pub maintenance_end: Option<DateTime<Utc>>,

    #[serde(default)]
    pub maintenance_reason: Option<String>,

    /// Bypass the circuit breaker gate for this destination
    #[serde(default)]
    pub skip_status_check: bool,
}

impl Destination {
    pub fn new(dest_id: impl Into<String>, dest_uri: impl Into<String>) -> Self {
        Self {
            key: DestinationKey::new(dest_id, default_dest_type()),
            dest_uri: dest_uri.into(),
            dest_version: None,
            username: None,
            password: None,
            maintenance_start: None,
            maintenance_end: None,
            maintenance_reason: None,
            skip_status_check: false,
        }
    }

    pub fn dest_id(&self) -> &str {
        &self.key.dest_id
    }

    /// Schema the destination speaks; 2014 when unspecified.
    pub fn schema(&self) -> Schema {
        self.dest_version
            .as_deref()
            .and_then(Schema::from_version)
            .unwrap_or(Schema::Iis2014)
    }

    pub fn is_hub(&self) -> bool {
        self.schema() == Schema::Hub
    }

    /// Inside `[maintenance_start, maintenance_end)`; an open end never closes.
    pub fn is_under_maintenance(&self, now: DateTime<Utc>) -> bool {
        match (self.maintenance_start, self.maintenance_end) {
            (Some(start), Some(end)) => start <= now && now < end,
            (Some(start), None) => start <= now,
            (None, _) => false,
        }
    }
}

/// Resolves destination ids to destination records.
#[async_trait]
pub trait DestinationDirectory: Send + Sync {
    async fn find(&self, dest_id: &str) -> Option<Destination>;
}

/// Directory backed by the configured destination list.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredDirectory {
    destinations: Arc<HashMap<String, Destination>>,
}

impl ConfiguredDirectory {
    pub fn new(destinations: impl IntoIterator<Item = Destination>) -> Self {
        let destinations = destinations
            .into_iter()
            .map(|d| (d.key.dest_id.clone(), d))
            .collect();
        Self {
            destinations: Arc::new(destinations),
        }
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}

#[async_trait]
impl DestinationDirectory for ConfiguredDirectory {
    async fn find(&self, dest_id: &str) -> Option<Destination> {
        self.destinations.get(dest_id).cloned()
    }
}

/// Credential codec errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("no credential key configured")]
    NotConfigured,

    #[error("invalid credential key: {0}")]
    InvalidKey(String),

    #[error("malformed ciphertext: {0}")]
    Malformed(String),

    #[error("decryption failed")]
    Decryption,

    #[error("encryption failed")]
    Encryption,
}

/// Encrypts and decrypts stored destination passwords.
pub trait CredentialCodec: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError>;

    fn decrypt(&self, ciphertext: &str) -> Result<String, CredentialError>;

    /// Credentials to send to `destination`. The stored password is
    /// decrypted and immediately resealed under the process key.
    fn credentials_for(&self, destination: &Destination) -> Result<Credentials, CredentialError> {
        let password = destination
            .password
            .as_deref()
            .map(|p| self.decrypt(p))
            .transpose()?;
        Credentials::seal(destination.username.clone(), password)
    }
}

/// AES-256-GCM codec; stored form is base64 of `nonce || ciphertext`.
#[derive(Clone)]
pub struct AesGcmCredentialCodec {
    cipher: Arc<Aes256Gcm>,
}

impl AesGcmCredentialCodec {
    pub fn new(key: &[u8]) -> Result<Self, CredentialError> {
        if key.len() != KEY_LEN {
            return Err(CredentialError::InvalidKey(format!(
                "expected {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
        Ok(Self {
            cipher: Arc::new(cipher),
        })
    }

    /// Codec under a fresh random key that lives only as long as the process.
    pub fn ephemeral() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        Self {
            cipher: Arc::new(Aes256Gcm::new(&key)),
        }
    }

    /// Build from a base64-encoded key.
    pub fn from_base64(key: &str) -> Result<Self, CredentialError> {
        let bytes = BASE64
            .decode(key.trim())
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
        Self::new(&bytes)
    }
}

impl fmt::Debug for AesGcmCredentialCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesGcmCredentialCodec").finish_non_exhaustive()
    }
}

impl CredentialCodec for AesGcmCredentialCodec {
    fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CredentialError::Encryption)?;

        let mut stored = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        stored.extend_from_slice(&nonce);
        stored.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(stored))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, CredentialError> {
        let data = BASE64
            .decode(ciphertext.trim())
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;
        if data.len() <= NONCE_LEN {
            return Err(CredentialError::Malformed("missing nonce".to_string()));
        }
        let (nonce, body) = data.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| CredentialError::Decryption)?;
        String::from_utf8(plaintext).map_err(|e| CredentialError::Malformed(e.to_string()))
    }
}

/// Codec used when no key is configured; any stored password is an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredCodec;

impl CredentialCodec for UnconfiguredCodec {
    fn encrypt(&self, _plaintext: &str) -> Result<String, CredentialError> {
        Err(CredentialError::NotConfigured)
    }

    fn decrypt(&self, _ciphertext: &str) -> Result<String, CredentialError> {
        Err(CredentialError::NotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn codec() -> AesGcmCredentialCodec {
        AesGcmCredentialCodec::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt() {
        let codec = codec();
        let stored = codec.encrypt("s3cret").unwrap();
        assert_ne!(stored, "s3cret");
        assert_eq!(codec.decrypt(&stored).unwrap(), "s3cret");
        // Fresh nonce each time.
        assert_ne!(codec.encrypt("s3cret").unwrap(), stored);
    }

    #[test]
    fn test_wrong_key_fails() {
        let stored = codec().encrypt("s3cret").unwrap();
        let other = AesGcmCredentialCodec::new(&[8u8; 32]).unwrap();
        assert_eq!(other.decrypt(&stored), Err(CredentialError::Decryption));
        assert!(matches!(other.decrypt("not base64!"), Err(CredentialError::Malformed(_))));
    }

    #[test]
    fn test_ephemeral_keys_differ() {
        let stored = AesGcmCredentialCodec::ephemeral().encrypt("pw").unwrap();
        assert_eq!(
            AesGcmCredentialCodec::ephemeral().decrypt(&stored),
            Err(CredentialError::Decryption)
        );
    }

    #[test]
    fn test_key_length_checked() {
        assert!(matches!(
            AesGcmCredentialCodec::new(&[0u8; 16]),
            Err(CredentialError::InvalidKey(_))
        ));
        let key = BASE64.encode([1u8; 32]);
        assert!(AesGcmCredentialCodec::from_base64(&key).is_ok());
    }

    #[test]
    fn test_credentials_for_destination() {
        let codec = codec();
        let mut destination = Destination::new("md", "https://md.example.org/iis");
        destination.username = Some("gateway".to_string());
        destination.password = Some(codec.encrypt("pw").unwrap());

        let creds = codec.credentials_for(&destination).unwrap();
        assert_eq!(creds.username().unwrap().as_deref(), Some("gateway"));
        assert_eq!(creds.password().unwrap().as_deref(), Some("pw"));

        assert_eq!(
            UnconfiguredCodec.credentials_for(&destination),
            Err(CredentialError::NotConfigured)
        );
        destination.password = None;
        assert!(UnconfiguredCodec.credentials_for(&destination).is_ok());
    }

    #[test]
    fn test_maintenance_window() {
        let now = Utc::now();
        let mut destination = Destination::new("md", "https://md.example.org/iis");
        assert!(!destination.is_under_maintenance(now));

        destination.maintenance_start = Some(now - Duration::hours(1));
        assert!(destination.is_under_maintenance(now));

        destination.maintenance_end = Some(now);
        assert!(!destination.is_under_maintenance(now));
    }

    #[test]
    fn test_schema_defaults_to_2014() {
        let mut destination = Destination::new("md", "https://md.example.org/iis");
        assert_eq!(destination.schema(), Schema::Iis2014);
        destination.dest_version = Some("2011".to_string());
        assert_eq!(destination.schema(), Schema::Iis2011);
        destination.dest_version = Some("hub".to_string());
        assert!(destination.is_hub());
    }

    #[tokio::test]
    async fn test_configured_directory() {
        let directory = ConfiguredDirectory::new([Destination::new("md", "https://md.example.org/iis")]);
        assert_eq!(directory.len(), 1);
        assert!(directory.find("md").await.is_some());
        assert!(directory.find("va").await.is_none());
    }
}
