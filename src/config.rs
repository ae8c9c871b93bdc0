//! Configuration types for the gateway.

use crate::destination::Destination;
use crate::error::GatewayError;
use crate::validator::ReaderLimits;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Config version
    pub version: String,

    /// General settings
    pub settings: SettingsConfig,

    /// Retry, timeout and circuit breaker settings
    pub dispatch: DispatchConfig,

    /// Outbound TLS material
    pub tls: TlsConfig,

    /// Stored credential encryption
    pub credentials: CredentialsConfig,

    /// Configured destinations
    pub destinations: Vec<Destination>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            settings: SettingsConfig::default(),
            dispatch: DispatchConfig::default(),
            tls: TlsConfig::default(),
            credentials: CredentialsConfig::default(),
            destinations: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Parse a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, GatewayError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Build from a JSON value, as pushed by a management plane.
    pub fn from_json(value: serde_json::Value) -> Result<Self, GatewayError> {
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a config file; `.json` files are JSON, anything else YAML.
    pub async fn load(path: &Path) -> Result<Self, GatewayError> {
        let content = tokio::fs::read_to_string(path).await?;
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json(serde_json::from_str(&content)?)
        } else {
            Self::from_yaml(&content)
        }
    }

    fn validate(&self) -> Result<(), GatewayError> {
        for pattern in &self.dispatch.status_check_exempt {
            glob::Pattern::new(pattern).map_err(|e| {
                GatewayError::Config(format!("invalid status_check_exempt pattern '{pattern}': {e}"))
            })?;
        }
        let mut seen = std::collections::HashSet::new();
        for destination in &self.destinations {
            if !seen.insert(&destination.key) {
                return Err(GatewayError::Config(format!(
                    "duplicate destination '{}'",
                    destination.key.dest_id
                )));
            }
        }
        Ok(())
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// Maximum request or response size to process (bytes)
    pub max_body_size: usize,

    /// Deployment environment; governs diagnostic filtering
    pub environment: Environment,

    /// Maximum element nesting depth
    pub max_depth: usize,

    /// Maximum number of elements in a document
    pub max_elements: usize,

    /// Upper bound on upstream content kept on a fault (bytes)
    pub original_body_limit: usize,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            max_body_size: 5_242_880, // 5MB
            environment: Environment::Production,
            max_depth: 32,
            max_elements: 10_000,
            original_body_limit: 4096,
        }
    }
}

impl SettingsConfig {
    pub fn reader_limits(&self) -> ReaderLimits {
        ReaderLimits {
            max_body_size: self.max_body_size,
            max_depth: self.max_depth,
            max_elements: self.max_elements,
        }
    }
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Staging,
    Development,
    Test,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

/// Dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Retries after the first attempt before giving up
    pub max_retries: u32,

    /// Per-attempt connect timeout (milliseconds)
    pub connect_timeout_ms: u64,

    /// Per-attempt read timeout (milliseconds)
    pub read_timeout_ms: u64,

    /// Pause between attempts
    pub retry_policy: RetryPolicy,

    /// Destination id globs exempt from the circuit breaker gate
    pub status_check_exempt: Vec<String>,

    /// Name recorded as `status_by` on status records
    pub node_name: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            connect_timeout_ms: 10_000,
            read_timeout_ms: 60_000,
            retry_policy: RetryPolicy::Immediate,
            status_check_exempt: Vec::new(),
            node_name: "iis-hub-gateway".to_string(),
        }
    }
}

impl DispatchConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Whether `dest_id` matches an exemption glob.
    pub fn is_status_check_exempt(&self, dest_id: &str) -> bool {
        self.status_check_exempt.iter().any(|pattern| {
            glob::Pattern::new(pattern).is_ok_and(|p| p.matches(dest_id))
        })
    }
}

/// Pause between send attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Retry straight away
    #[default]
    Immediate,
    /// Wait a fixed delay
    FixedDelay { delay_ms: u64 },
}

impl RetryPolicy {
    pub fn delay(self) -> Duration {
        match self {
            Self::Immediate => Duration::ZERO,
            Self::FixedDelay { delay_ms } => Duration::from_millis(delay_ms),
        }
    }

    pub async fn pause(self) {
        let delay = self.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Outbound TLS material.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM bundle of extra trusted roots
    pub ca_bundle: Option<PathBuf>,

    /// PEM file with the client certificate chain and private key
    pub identity: Option<PathBuf>,

    /// Seconds between reloads of the material
    pub reload_interval_secs: u64,

    /// Reject destination URIs that are not https
    pub require_https: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_bundle: None,
            identity: None,
            reload_interval_secs: 300,
            require_https: true,
        }
    }
}

/// Stored credential encryption.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Base64 AES-256 key for stored destination passwords
    pub key: Option<String>,
}
