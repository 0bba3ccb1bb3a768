//! Configuration for the webhook engine

use serde::{Deserialize, Serialize};

/// Webhook engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Per-request timeout (seconds)
    pub request_timeout_secs: u64,

    /// Worker poll period (milliseconds)
    pub poll_interval_ms: u64,

    /// Deliveries attempted in parallel
    pub max_concurrency: usize,

    /// Deliveries picked up per poll
    pub batch_size: usize,

    /// Retry ladder in seconds
    pub retry_ladder_secs: Vec<i64>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
            poll_interval_ms: 1000,
            max_concurrency: 16,
            batch_size: 100,
            retry_ladder_secs: crate::schedule::DEFAULT_LADDER_SECS.to_vec(),
        }
    }
}

impl WebhookConfig {
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

        if let Ok(value) = std::env::var("WEBHOOK_TIMEOUT_SECS") {
            config.request_timeout_secs = value
                .parse()
                .map_err(|e| crate::Error::Config(format!("WEBHOOK_TIMEOUT_SECS: {}", e)))?;
        }
        if let Ok(value) = std::env::var("WEBHOOK_MAX_CONCURRENCY") {
            config.max_concurrency = value
                .parse()
                .map_err(|e| crate::Error::Config(format!("WEBHOOK_MAX_CONCURRENCY: {}", e)))?;
        }

        Ok(config)
    }
}
