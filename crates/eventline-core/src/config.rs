//! Configuration surface consumed by the broker and communicator
//!
//! Loading and provisioning are the host application's concern; the core
//! takes an explicit, already-populated `EventlineConfig` and validates it.
//! Validation failures are the fatal error class: callers report them once
//! and exit before binding any socket.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

// ----------------------------------------------------------------------------
// Environment
// ----------------------------------------------------------------------------

/// Deployment environment, selecting the snapshot debounce window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Short (1 s) debounce for quick feedback while developing
    Development,
    /// Standard (2 s) debounce
    Production,
}

impl Default for Environment {
    fn default() -> Self {
        Self::Production
    }
}

impl Environment {
    /// Debounce window for queue snapshot saves
    pub fn save_debounce(&self) -> Duration {
        match self {
            Self::Development => Duration::from_secs(1),
            Self::Production => Duration::from_secs(2),
        }
    }
}

// ----------------------------------------------------------------------------
// Storage Configuration
// ----------------------------------------------------------------------------

/// Backing file paths for the two role-bound queues
///
/// The roles never share a file: the broker owns the failed snapshot, the
/// communicator owns the pending snapshot. The broker additionally reads
/// (never writes) the pending snapshot during replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Communicator-side pending queue snapshot
    pub pending_path: PathBuf,
    /// Broker-side failed queue snapshot
    pub failed_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pending_path: PathBuf::from("storage/eventline/pending.json"),
            failed_path: PathBuf::from("storage/eventline/failed.json"),
        }
    }
}

// ----------------------------------------------------------------------------
// Eventline Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for both roles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventlineConfig {
    /// Shared secret; hashed before it touches the wire
    pub secret_key: String,
    /// Broker host the communicator dials
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Reconnect automatically when the link drops
    pub keep_alive: bool,
    /// Log event arguments on receipt
    pub log_args: bool,
    /// Optional communicator display name, echoed in broker logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Deployment environment
    #[serde(default)]
    pub environment: Environment,
    /// Queue snapshot locations
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for EventlineConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            host: "127.0.0.1".to_string(),
            port: 7000,
            keep_alive: true,
            log_args: false,
            name: None,
            environment: Environment::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl EventlineConfig {
    /// Validate the settings both roles require
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret_key.trim().is_empty() {
            return Err(ConfigError::MissingSecretKey);
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.storage.pending_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingStoragePath { role: "pending" });
        }
        if self.storage.failed_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingStoragePath { role: "failed" });
        }
        Ok(())
    }

    /// Address the broker listens on and the communicator dials
    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Debounce window for this environment
    pub fn save_debounce(&self) -> Duration {
        self.environment.save_debounce()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> EventlineConfig {
        EventlineConfig {
            secret_key: "secret".into(),
            ..EventlineConfig::default()
        }
    }

    #[test]
    fn default_config_needs_a_secret() {
        assert!(matches!(
            EventlineConfig::default().validate(),
            Err(ConfigError::MissingSecretKey)
        ));
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut config = valid();
        config.port = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPort)));

        let mut config = valid();
        config.host = "  ".into();
        assert!(matches!(config.validate(), Err(ConfigError::MissingHost)));

        let mut config = valid();
        config.storage.failed_path = PathBuf::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingStoragePath { role: "failed" })
        ));
    }

    #[test]
    fn debounce_follows_the_environment() {
        let mut config = valid();
        assert_eq!(config.save_debounce(), Duration::from_secs(2));

        config.environment = Environment::Development;
        assert_eq!(config.save_debounce(), Duration::from_secs(1));
    }

    #[test]
    fn broker_addr_joins_host_and_port() {
        let config = valid();
        assert_eq!(config.broker_addr(), "127.0.0.1:7000");
    }
}
