//! Configuration loading and parsing.
//!
//! The service reads a single YAML document. The parsed [`ServiceConfig`]
//! is built once in `main` and handed to constructors; nothing in the
//! library reads configuration on its own.

mod error;
mod types;

pub use error::ConfigError;
pub use types::{ApiSettings, ProbeSeed, ServiceConfig, StorageConfig};

use std::collections::HashSet;
use std::path::Path;

/// YAML configuration loader.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<ServiceConfig, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&content)
    }

    /// Load from `path` if given, otherwise return the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<ServiceConfig, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(ServiceConfig::default()),
        }
    }

    /// Parse and validate configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<ServiceConfig, ConfigError> {
        // serde_yaml rejects an empty document, treat it as all defaults
        let config: ServiceConfig = if yaml.trim().is_empty() {
            ServiceConfig::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &ServiceConfig) -> Result<(), ConfigError> {
        if let StorageConfig::Sqlite { path } = &config.storage {
            if path.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "sqlite storage requires a path".into(),
                ));
            }
        }

        if config.api.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("api.host cannot be empty".into()));
        }

        let mut seen = HashSet::new();
        for probe in &config.probes {
            if probe.id.trim().is_empty() {
                return Err(ConfigError::InvalidConfig("probe id cannot be empty".into()));
            }
            if probe.country.trim().is_empty() || probe.platform.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "probe '{}' needs a country and a platform",
                    probe.id
                )));
            }
            if !seen.insert(probe.id.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate probe id '{}'",
                    probe.id
                )));
            }
        }

        Ok(())
    }
}
