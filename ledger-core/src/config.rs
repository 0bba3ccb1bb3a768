//! Configuration for the ledger

use crate::types::TenantId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process-local ordered maps
    Memory,
    /// RocksDB under `data_dir` (requires the `rocksdb` feature)
    RocksDb,
}

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Storage backend
    pub backend: StorageBackend,

    /// Unit recorded on new wallets (currency code or "credits")
    pub default_unit: String,

    /// Tenant that owns the shared pool wallet
    pub operator_tenant_id: Uuid,

    /// Actor mailbox capacity (backpressure bound)
    pub mailbox_capacity: usize,

    /// Pool reservation configuration
    pub reservations: ReservationConfig,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/ledger"),
            service_name: "ledger-core".to_string(),
            backend: StorageBackend::Memory,
            default_unit: "credits".to_string(),
            operator_tenant_id: Uuid::nil(),
            mailbox_capacity: 1000,
            reservations: ReservationConfig::default(),
            rocksdb: RocksDBConfig::default(),
        }
    }
}

impl Config {
    /// Operator tenant as a typed ID
    pub fn operator_tenant(&self) -> TenantId {
        TenantId(self.operator_tenant_id)
    }
}

/// Pool reservation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservationConfig {
    /// Hold lifetime when the caller does not pass one (seconds)
    pub default_ttl_secs: u64,

    /// Background sweep period (seconds)
    pub sweep_interval_secs: u64,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 1800, // 30 minutes
            sweep_interval_secs: 60,
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Sync the WAL on every batch
    pub sync_writes: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            sync_writes: true,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
            config.backend = StorageBackend::RocksDb;
        }

        if let Ok(operator) = std::env::var("LEDGER_OPERATOR_TENANT") {
            config.operator_tenant_id = Uuid::parse_str(&operator)
                .map_err(|e| crate::Error::Config(format!("LEDGER_OPERATOR_TENANT: {}", e)))?;
        }

        if let Ok(unit) = std::env::var("LEDGER_DEFAULT_UNIT") {
            config.default_unit = unit;
        }

        Ok(config)
    }
}
