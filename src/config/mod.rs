//! Configuration management for Audrey
//!
//! Settings are layered, lowest priority first:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables
//!
//! # Usage
//!
//! ```no_run
//! use audrey::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Working directory: {}", config.resolved_working_dir().display());
//! ```
//!
//! # Environment Variables
//!
//! Any setting can be overridden with `AUDREY__<section>__<key>`:
//! - `AUDREY__BURN__DEVICE=/dev/sr0`
//! - `AUDREY__BUILD__MAX_SIZE=700MB`
//! - `AUDREY__FEED__INTERVAL=30m`
//!
//! # Configuration File
//!
//! Loaded from `config/audrey.toml` unless `AUDREY_CONFIG` points elsewhere.

mod models;
mod sources;
mod validation;

pub use crate::humanize::{ByteSize, HumanDuration};
pub use models::{
    BuildConfig, BurnConfig, Config, ControllerConfig, FeedCheckConfig, FeedEndpointConfig,
    FetchConfig,
};
pub use sources::config_path;
pub use validation::{ValidationError, is_valid_feed_name};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),

    #[error("Failed to render configuration: {0}")]
    RenderError(#[from] toml::ser::Error),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// # Errors
    ///
    /// Returns an error if the file is malformed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path, still layering `.env` and
    /// the environment on top
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_layered(path, None)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Effective configuration rendered back to TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_minimal_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        fs::write(
            &config_path,
            r#"
[feeds.default]
url = "https://example.com/feed.xml"
        "#,
        )
        .unwrap();

        let config = Config::load_from_path(config_path).unwrap();
        assert_eq!(config.feeds.len(), 1);
    }

    #[test]
    fn test_validation_catches_bad_thresholds() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        fs::write(
            &config_path,
            r#"
[build]
hard_size = "650MB"
max_size = "600MB"
        "#,
        )
        .unwrap();

        let result = Config::load_from_path(config_path);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::ValidationError(ValidationError::HardSizeUnreachable { .. })
        ));
    }

    #[test]
    fn test_to_toml_round_trip() {
        let config = Config::default();
        let rendered = config.to_toml().unwrap();

        assert!(rendered.contains("max_size = \"600MB\""));
        assert!(rendered.contains("interval = \"1h\""));

        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.build.max_size, config.build.max_size);
        assert_eq!(parsed.burn.settle, config.burn.settle);
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("audrey.toml");
        fs::write(&config_path, include_str!("../../config/audrey.toml")).unwrap();

        let config = Config::load_from_path(config_path).unwrap();
        let defaults = Config::default();
        assert_eq!(config.build.max_size, defaults.build.max_size);
        assert_eq!(config.burn.settle, defaults.burn.settle);
        assert_eq!(config.fetch.timeout, defaults.fetch.timeout);
        assert!(config.feeds.is_empty());
    }
}
