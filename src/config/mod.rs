//! Application configuration.
//!
//! Loaded from YAML files and `SPILLWAY__*` environment variables.

mod buffer;

pub use buffer::{
    BufferConfig, ListenerConfig, DEFAULT_CHANNEL_CAPACITY, DEFAULT_LEASE_SIZE,
    DEFAULT_MAX_RECORD_BYTES, DEFAULT_MAX_SIZE_BYTES,
};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "spillway.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "SPILLWAY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "SPILLWAY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "SPILLWAY_LOG";

use serde::Deserialize;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Main configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Spool buffer tuning.
    pub buffer: BufferConfig,
    /// Listener delivery defaults.
    pub listener: ListenerConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources, later overriding earlier:
    /// 1. `spillway.yaml` in the current directory (if present)
    /// 2. File given by `path` (if provided)
    /// 3. File named by `SPILLWAY_CONFIG` (if set)
    /// 4. `SPILLWAY__SECTION__KEY` environment variables
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.buffer.validate()?;
        self.listener.validate()
    }

    /// Create config for testing: small limits, spool under `dir`.
    pub fn for_test(dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            buffer: BufferConfig::default()
                .with_max_size(1024 * 1024)
                .with_spool_dir(dir),
            listener: ListenerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.buffer.max_size_bytes, DEFAULT_MAX_SIZE_BYTES);
        assert_eq!(config.buffer.lease_size, DEFAULT_LEASE_SIZE);
        assert_eq!(config.listener.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
    }

    #[test]
    fn test_from_yaml_partial() {
        let config = Config::from_yaml(
            r#"
buffer:
  max_size_bytes: 2048
  lease_size: 10
listener:
  disable_file_buffering: true
"#,
        )
        .unwrap();

        assert_eq!(config.buffer.max_size_bytes, 2048);
        assert_eq!(config.buffer.lease_size, 10);
        assert_eq!(config.buffer.max_record_bytes, DEFAULT_MAX_RECORD_BYTES);
        assert!(config.listener.disable_file_buffering);
        assert_eq!(config.listener.channel_capacity, 1);
    }

    #[test]
    fn test_from_yaml_rejects_invalid() {
        let result = Config::from_yaml("buffer:\n  lease_size: 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    #[serial]
    fn test_load_from_file_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.yaml");
        std::fs::write(&path, "buffer:\n  lease_size: 25\n").unwrap();

        std::env::set_var("SPILLWAY__BUFFER__MAX_SIZE_BYTES", "4096");
        let config = Config::load(Some(path.to_str().unwrap()));
        std::env::remove_var("SPILLWAY__BUFFER__MAX_SIZE_BYTES");

        let config = config.unwrap();
        assert_eq!(config.buffer.lease_size, 25);
        assert_eq!(config.buffer.max_size_bytes, 4096);
    }

    #[test]
    #[serial]
    fn test_load_missing_explicit_file_fails() {
        let result = Config::load(Some("/nonexistent/spillway.yaml"));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_for_test_uses_dir() {
        let config = Config::for_test("/tmp/spill-test");
        assert_eq!(
            config.buffer.spool_dir,
            Some(std::path::PathBuf::from("/tmp/spill-test"))
        );
        assert!(config.validate().is_ok());
    }
}
