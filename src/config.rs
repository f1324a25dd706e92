//! Configuration for the FeatureHub system.
//!
//! One TOML file configures all four subsystems; environment variables
//! override the fields that differ between deployments. Defaults match the
//! documented operating parameters.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::Level;

/// Top-level configuration for the entire FeatureHub system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureHubConfig {
    pub metadata_db_path: String,
    pub log_level: String,
    pub router: RouterConfig,
    pub metadata: MetadataConfig,
    pub migration: MigrationConfig,
    pub cleanup: CleanupConfig,
    pub bus: BusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub port: u16,
    /// Per-request deadline applied to every backend call, overridable per call.
    pub request_timeout_default_ms: u64,
    pub max_batch_size: usize,
    pub max_key_length: usize,
    /// Capacity of the bounded async stat-update queue (drop-oldest on overflow).
    pub stat_queue_capacity: usize,
    /// Per-IP request budget for mutating endpoints.
    pub rate_limit_per_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    pub port: u16,
    pub cache_ttl_min: u64,
    pub cache_capacity: u64,
    pub pool_size: u32,
    /// Max wait for a pooled connection, in seconds.
    pub pool_acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    pub port: u16,
    pub hot_to_cold_idle_ms: i64,
    pub cold_to_hot_access_threshold: i64,
    pub cold_to_hot_recent_ms: i64,
    pub migration_batch_size: usize,
    pub batch_interval_ms: u64,
    pub max_migration_size: usize,
    pub max_recall_size: usize,
    pub hot_sweep_interval_secs: u64,
    pub cold_sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    pub port: u16,
    pub cleanup_batch_size: usize,
    pub batch_interval_ms: u64,
    pub expired_retention_days: u64,
    pub orphan_cleanup_enabled: bool,
    /// Keys fetched per SCAN iteration during the orphan sweep.
    pub orphan_scan_count: usize,
    pub expiry_sweep_interval_secs: u64,
    pub orphan_sweep_interval_secs: u64,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Partitions per topic; events for one key always land in one partition.
    pub partitions: usize,
    pub buffer_size: usize,
}

impl Default for FeatureHubConfig {
    fn default() -> Self {
        Self {
            metadata_db_path: "featurehub_metadata.db".to_string(),
            log_level: "info".to_string(),
            router: RouterConfig {
                port: 8080,
                request_timeout_default_ms: 5_000,
                max_batch_size: 1_000,
                max_key_length: 255,
                stat_queue_capacity: 10_000,
                rate_limit_per_minute: 600,
            },
            metadata: MetadataConfig {
                port: 8081,
                cache_ttl_min: 30,
                cache_capacity: 100_000,
                pool_size: 10,
                pool_acquire_timeout_secs: 3,
            },
            migration: MigrationConfig {
                port: 8082,
                hot_to_cold_idle_ms: 7 * 24 * 60 * 60 * 1000,
                cold_to_hot_access_threshold: 10,
                cold_to_hot_recent_ms: 24 * 60 * 60 * 1000,
                migration_batch_size: 1_000,
                batch_interval_ms: 1_000,
                max_migration_size: 10_000,
                max_recall_size: 1_000,
                hot_sweep_interval_secs: 300,
                cold_sweep_interval_secs: 600,
            },
            cleanup: CleanupConfig {
                port: 8083,
                cleanup_batch_size: 1_000,
                batch_interval_ms: 1_000,
                expired_retention_days: 30,
                orphan_cleanup_enabled: true,
                orphan_scan_count: 500,
                expiry_sweep_interval_secs: 24 * 60 * 60,
                orphan_sweep_interval_secs: 7 * 24 * 60 * 60,
                dry_run: false,
            },
            bus: BusConfig {
                partitions: 16,
                buffer_size: 1_024,
            },
        }
    }
}

impl FeatureHubConfig {
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: FeatureHubConfig = toml::from_str(&contents)?;

        // Deployment-specific overrides come from the environment.
        if let Ok(db_path) = std::env::var("FEATUREHUB_DB_PATH") {
            config.metadata_db_path = db_path;
        }
        if let Ok(level) = std::env::var("FEATUREHUB_LOG_LEVEL") {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.metadata_db_path.is_empty() {
            anyhow::bail!("metadata_db_path must not be empty");
        }
        if self.router.max_batch_size == 0 {
            anyhow::bail!("router.max_batch_size must be positive");
        }
        if self.router.max_key_length == 0 {
            anyhow::bail!("router.max_key_length must be positive");
        }
        if self.migration.migration_batch_size == 0 {
            anyhow::bail!("migration.migration_batch_size must be positive");
        }
        if self.cleanup.cleanup_batch_size == 0 {
            anyhow::bail!("cleanup.cleanup_batch_size must be positive");
        }
        if self.bus.partitions == 0 {
            anyhow::bail!("bus.partitions must be positive");
        }
        Ok(())
    }

    pub fn init_logging(&self) {
        let level = match self.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        tracing_subscriber::fmt().with_max_level(level).init();
    }
}
