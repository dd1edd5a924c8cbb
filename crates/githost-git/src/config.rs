//! Service configuration types.

use crate::pack::PackLimits;
use githost_storage::StorageConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The YAML did not parse.
    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Object and reference storage.
    pub storage: StorageConfig,
    /// Wire protocol limits.
    pub protocol: ProtocolConfig,
}

impl Config {
    /// Parses and validates YAML.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&yaml)?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Rejects zero limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.protocol.validate()
    }
}

/// Limits applied to every protocol session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Largest single object accepted in a pack, in bytes.
    pub max_object_size: u64,
    /// Largest pack stream accepted, in bytes.
    pub max_pack_bytes: u64,
    /// Pushes with at least this many objects are stored as a pack.
    pub unpack_limit: usize,
    /// Per-request deadline, in seconds.
    pub request_timeout: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        let limits = PackLimits::default();
        Self {
            max_object_size: limits.max_object_size,
            max_pack_bytes: limits.max_pack_bytes,
            unpack_limit: 100,
            request_timeout: 300,
        }
    }
}

impl ProtocolConfig {
    /// Decoder limits.
    pub fn pack_limits(&self) -> PackLimits {
        PackLimits {
            max_object_size: self.max_object_size,
            max_pack_bytes: self.max_pack_bytes,
        }
    }

    /// `request_timeout` as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("max_object_size", self.max_object_size == 0),
            ("max_pack_bytes", self.max_pack_bytes == 0),
            ("unpack_limit", self.unpack_limit == 0),
            ("request_timeout", self.request_timeout == 0),
        ];
        match checks.iter().find(|(_, zero)| *zero) {
            Some((field, _)) => Err(ConfigError::Invalid(format!(
                "protocol.{} must be greater than zero",
                field
            ))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use githost_storage::{CompressionLevel, HashAlgorithm};

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.protocol.max_object_size, 100 * 1024 * 1024);
        assert_eq!(config.protocol.max_pack_bytes, 1024 * 1024 * 1024);
        assert_eq!(config.protocol.unpack_limit, 100);
        assert_eq!(config.protocol.timeout(), Duration::from_secs(300));
        assert!(config.storage.fsync);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
storage:
  hash_algorithm: sha256
  compression: best
protocol:
  unpack_limit: 10
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.storage.hash_algorithm, HashAlgorithm::Sha256);
        assert_eq!(config.storage.compression, CompressionLevel::Best);
        assert_eq!(config.protocol.unpack_limit, 10);
        assert_eq!(config.protocol.request_timeout, 300);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(Config::from_yaml_str("{}").unwrap(), Config::default());
    }

    #[test]
    fn test_zero_limit_rejected() {
        let err = Config::from_yaml_str("protocol:\n  max_pack_bytes: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("max_pack_bytes")));
    }

    #[test]
    fn test_bad_yaml() {
        assert!(matches!(
            Config::from_yaml_str("protocol: [1, 2"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("githost.yaml");
        std::fs::write(&path, "protocol:\n  request_timeout: 30\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.protocol.timeout(), Duration::from_secs(30));

        assert!(matches!(
            Config::load(dir.path().join("missing.yaml")),
            Err(ConfigError::Io(_))
        ));
    }
}
