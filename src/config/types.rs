//! Service configuration structures.
//!
//! Every field has a default, so an empty document (or no file at all)
//! yields a working in-memory service on `127.0.0.1:8080`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Storage backend.
    pub storage: StorageConfig,
    /// HTTP listener.
    pub api: ApiSettings,
    /// How long shutdown waits for in-flight firings, in seconds.
    pub shutdown_timeout_secs: u64,
    /// Probes registered at startup.
    pub probes: Vec<ProbeSeed>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            api: ApiSettings::default(),
            shutdown_timeout_secs: 30,
            probes: Vec::new(),
        }
    }
}

impl ServiceConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// A probe to register on startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSeed {
    pub id: String,
    pub country: String,
    pub platform: String,
}
