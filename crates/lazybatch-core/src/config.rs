//! Loader configuration.
//!
//! Settings are layered:
//! 1. Default values
//! 2. Configuration file (YAML)
//! 3. Environment variables (override)
//!
//! Environment variables are prefixed with `LAZYBATCH_` and use `__` as the
//! nested key separator, e.g. `LAZYBATCH_DETECTION__THRESHOLD=25`.
//!
//! # Example
//!
//! ```ignore
//! use lazybatch_core::config::LoaderConfig;
//!
//! let config = LoaderConfig::load("lazybatch.yaml")?;
//! lazybatch_core::observability::configure(&config);
//! ```

use std::path::Path;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

/// Loader configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct LoaderConfig {
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Unbatched access detection settings
    #[serde(default)]
    pub detection: DetectionSettings,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingSettings {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Use JSON format (true for production, false for development)
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Detection of derived attributes resolved one entity at a time.
///
/// # Example YAML Configuration
///
/// ```yaml
/// detection:
///   warn_unbatched: true
///   threshold: 10
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DetectionSettings {
    /// Warn once per derivation when unbatched resolutions reach `threshold`.
    ///
    /// Environment variable: `LAZYBATCH_DETECTION__WARN_UNBATCHED`
    #[serde(default)]
    pub warn_unbatched: bool,

    /// Number of single-element fallbacks of one derivation before warning.
    ///
    /// Environment variable: `LAZYBATCH_DETECTION__THRESHOLD`
    #[serde(default = "default_threshold")]
    pub threshold: u64,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            warn_unbatched: false,
            threshold: default_threshold(),
        }
    }
}

fn default_threshold() -> u64 {
    10
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),

    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

impl LoaderConfig {
    /// Load configuration from a YAML file with environment variable overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigLoadError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let config = Config::builder()
            .add_source(Config::try_from(&LoaderConfig::default())?)
            .add_source(File::from(path).format(FileFormat::Yaml))
            .add_source(env_source())
            .build()?;

        let loader_config: LoaderConfig = config.try_deserialize()?;
        loader_config.validate()?;

        Ok(loader_config)
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let config = Config::builder()
            .add_source(Config::try_from(&LoaderConfig::default())?)
            .add_source(env_source())
            .build()?;

        let loader_config: LoaderConfig = config.try_deserialize()?;
        loader_config.validate()?;

        Ok(loader_config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigLoadError::Invalid {
                message: format!(
                    "logging.level must be one of: {:?}, got: {}",
                    valid_levels, self.logging.level
                ),
            });
        }

        if self.detection.threshold == 0 {
            return Err(ConfigLoadError::Invalid {
                message: "detection.threshold must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

// LAZYBATCH_DETECTION__THRESHOLD -> detection.threshold
fn env_source() -> Environment {
    Environment::with_prefix("LAZYBATCH")
        .prefix_separator("_")
        .separator("__")
}
