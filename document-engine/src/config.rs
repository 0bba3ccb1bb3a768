//! Configuration for the document engine

use crate::types::DocumentKind;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which wallet pays for a sent document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargingModel {
    /// Pay-as-you-go: tenant `main` wallet
    #[default]
    Direct,
    /// Pre-purchased pool credits: tenant `e_credit` wallet
    Pooled,
}

/// Price per sent document, by kind (zero = not billable)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceTable {
    /// Invoice price
    pub invoice: Decimal,
    /// Voucher price
    pub voucher: Decimal,
    /// Despatch price
    pub despatch: Decimal,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            invoice: Decimal::ONE,
            voucher: Decimal::ONE,
            despatch: Decimal::ZERO,
        }
    }
}

impl PriceTable {
    /// Price of one document of `kind`
    pub fn price(&self, kind: DocumentKind) -> Decimal {
        match kind {
            DocumentKind::Invoice => self.invoice,
            DocumentKind::Voucher => self.voucher,
            DocumentKind::Despatch => self.despatch,
        }
    }
}

/// Dispatch worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Documents dispatched in parallel
    pub concurrency: usize,

    /// Poll period (milliseconds)
    pub poll_interval_ms: u64,

    /// Documents claimed per poll
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            poll_interval_ms: 500,
            batch_size: 100,
        }
    }
}

/// HTTP provider gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Provider base URL
    pub base_url: String,

    /// Request timeout (seconds)
    pub timeout_secs: u64,

    /// Bearer token, if the provider needs one
    pub api_key: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9000".to_string(),
            timeout_secs: 30,
            api_key: None,
        }
    }
}

/// Document engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Charging model
    pub charging: ChargingModel,

    /// Prices
    pub pricing: PriceTable,

    /// Transient failures tolerated before a document is dead-lettered
    pub max_retries: u32,

    /// Backoff ladder in seconds; the last step holds past its end
    pub retry_ladder_secs: Vec<i64>,

    /// Worker
    pub worker: WorkerConfig,

    /// Gateway
    pub gateway: GatewayConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            charging: ChargingModel::Direct,
            pricing: PriceTable::default(),
            max_retries: 5,
            retry_ladder_secs: webhook_engine::schedule::DEFAULT_LADDER_SECS.to_vec(),
            worker: WorkerConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl EngineConfig {
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

        if let Ok(value) = std::env::var("DOCUMENT_CHARGING_MODEL") {
            config.charging = match value.as_str() {
                "direct" => ChargingModel::Direct,
                "pooled" => ChargingModel::Pooled,
                other => {
                    return Err(crate::Error::Config(format!(
                        "DOCUMENT_CHARGING_MODEL: unknown model {}",
                        other
                    )))
                }
            };
        }

        if let Ok(value) = std::env::var("DOCUMENT_MAX_RETRIES") {
            config.max_retries = value
                .parse()
                .map_err(|e| crate::Error::Config(format!("DOCUMENT_MAX_RETRIES: {}", e)))?;
        }

        if let Ok(url) = std::env::var("PROVIDER_BASE_URL") {
            config.gateway.base_url = url;
        }

        if let Ok(key) = std::env::var("PROVIDER_API_KEY") {
            config.gateway.api_key = Some(key);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.charging, ChargingModel::Direct);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.pricing.price(DocumentKind::Despatch), Decimal::ZERO);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
            charging = "pooled"
            max_retries = 2

            [pricing]
            invoice = "2.5"
            voucher = "1"
            despatch = "0"
            "#,
        )
        .unwrap();

        assert_eq!(config.charging, ChargingModel::Pooled);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.pricing.price(DocumentKind::Invoice), Decimal::new(25, 1));
        assert_eq!(config.worker.concurrency, 8);
    }
}
