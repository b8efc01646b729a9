//! Configuration Module
//!
//! Centralized configuration for the cluster authority: cluster identity,
//! keystore backing, second-factor and lockout policy, session caps, and
//! rotation scheduling.

use crate::types::SecondFactorPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Authority configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Name of this cluster; certificate authorities are identified by
    /// (type, cluster_name)
    pub cluster_name: String,

    /// UUID of this auth instance; scopes HSM keys to their creator
    pub host_id: Uuid,

    /// Whether enterprise-gated features (resource-scoped certificates)
    /// are available on this build
    pub enterprise: bool,

    /// Keystore backing selection
    pub keystore: KeyStoreBackingConfig,

    /// Cluster-wide second factor policy
    pub second_factor: SecondFactorPolicy,

    /// Cluster-wide private key policy, combined with role policies at
    /// issuance (strictest wins). Wire values: `none`, `hardware_key`,
    /// `hardware_key_touch`.
    pub private_key_policy: crate::types::PrivateKeyPolicy,

    /// Login lockout policy
    pub lockout: LockoutConfig,

    /// Session issuance caps
    pub session: SessionConfig,

    /// Rotation grace period applied when a rotation request does not
    /// specify one
    #[serde(with = "humantime_secs")]
    pub rotation_grace: Duration,

    /// Whether issuance pins the client IP even when roles do not demand it
    pub pin_source_ip: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cluster_name: "localcluster".to_string(),
            host_id: Uuid::new_v4(),
            enterprise: false,
            keystore: KeyStoreBackingConfig::default(),
            second_factor: SecondFactorPolicy::Optional,
            private_key_policy: crate::types::PrivateKeyPolicy::None,
            lockout: LockoutConfig::default(),
            session: SessionConfig::default(),
            rotation_grace: Duration::from_secs(6 * 3600),
            pin_source_ip: false,
        }
    }
}

/// Which backing the keystore mints new CA keys in
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyStoreBackingConfig {
    /// Software keys stored inline in the CA record
    #[default]
    Software,
    /// Keys resident in a PKCS#11 token, scoped to this host
    Hsm {
        /// Token slot new keys are created in
        slot: u32,
    },
    /// Keys resident in a cloud KMS keyring
    Kms {
        /// Fully qualified keyring resource name
        keyring: String,
    },
}

/// Login lockout policy for [`crate::mfa::MfaService::with_user_lock`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockoutConfig {
    /// Consecutive failures that trigger a lock
    pub max_attempts: u32,

    /// Window within which failures are counted
    #[serde(with = "humantime_secs")]
    pub attempt_window: Duration,

    /// How long a triggered lock lasts
    #[serde(with = "humantime_secs")]
    pub lock_interval: Duration,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            attempt_window: Duration::from_secs(30 * 60),
            lock_interval: Duration::from_secs(20 * 60),
        }
    }
}

/// Web session issuance caps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Upper bound on bearer token lifetime; the effective bearer TTL is
    /// `min(session_ttl, max_bearer_ttl)`
    #[serde(with = "humantime_secs")]
    pub max_bearer_ttl: Duration,

    /// Idle timeout recorded on new web sessions; zero disables
    #[serde(with = "humantime_secs")]
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_bearer_ttl: Duration::from_secs(10 * 60),
            idle_timeout: Duration::ZERO,
        }
    }
}

mod humantime_secs {
    //! Durations serialized as whole seconds
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl AuthConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: AuthConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &PathBuf) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster_name.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "cluster name cannot be empty".to_string(),
            ));
        }

        if self.cluster_name.contains('/') {
            return Err(ConfigError::InvalidConfig(format!(
                "cluster name {:?} may not contain '/'",
                self.cluster_name
            )));
        }

        if self.lockout.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "lockout.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.session.max_bearer_ttl.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "session.max_bearer_ttl cannot be zero".to_string(),
            ));
        }

        if let KeyStoreBackingConfig::Kms { keyring } = &self.keystore {
            if keyring.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "keystore.keyring cannot be empty for the KMS backing".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AuthConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lockout.max_attempts, 5);
        assert_eq!(config.session.max_bearer_ttl, Duration::from_secs(600));
    }

    #[test]
    fn test_config_validation() {
        let mut config = AuthConfig::default();

        config.cluster_name = String::new();
        assert!(config.validate().is_err());

        config.cluster_name = "example.com".to_string();
        assert!(config.validate().is_ok());

        config.keystore = KeyStoreBackingConfig::Kms {
            keyring: String::new(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = AuthConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("cluster_name"));
        assert!(toml_str.contains("second_factor"));

        let parsed: AuthConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.cluster_name, config.cluster_name);
        assert_eq!(parsed.rotation_grace, config.rotation_grace);
    }
}
