//! Configuration for the idempotency guard

use serde::{Deserialize, Serialize};

/// Idempotency configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// How long records are kept before `purge_expired` removes them (seconds)
    pub retention_secs: u64,

    /// Purge period when run from the node (seconds)
    pub purge_interval_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            retention_secs: 24 * 60 * 60,
            purge_interval_secs: 15 * 60,
        }
    }
}

impl IdempotencyConfig {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("IDEMPOTENCY_RETENTION_SECS") {
            config.retention_secs = value
                .parse()
                .map_err(|e| crate::Error::Config(format!("IDEMPOTENCY_RETENTION_SECS: {}", e)))?;
        }

        Ok(config)
    }

    /// Retention as a chrono duration
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs.min(i64::MAX as u64) as i64)
    }
}
