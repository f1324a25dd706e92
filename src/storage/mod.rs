//! Physical store abstraction for the HOT and COLD tiers.
//!
//! Both tiers expose the same Redis-shaped capability set; routing selects a
//! backend by tier tag, never by concrete type. The in-memory implementation
//! backs local development and tests; production deployments plug in real
//! protocol clients behind the same trait.

mod memory;
mod metrics;

pub use memory::MemoryKv;
pub use metrics::{AccessOutcome, StoreMetrics, StoreMetricsSnapshot, TierAccessSnapshot};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::types::StorageTier;

/// String key-value backend contract shared by HOT and COLD.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value with an optional TTL in seconds.
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()>;

    /// Multi-get; absent keys are simply missing from the returned map.
    async fn mget(&self, keys: &[String]) -> Result<HashMap<String, String>>;

    /// Returns true if the key existed.
    async fn del(&self, key: &str) -> Result<bool>;

    async fn del_many(&self, keys: &[String]) -> Result<u64>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remaining TTL in seconds; `None` when the key has no expiry or is absent.
    async fn ttl(&self, key: &str) -> Result<Option<u64>>;

    /// Returns true if the key existed and the expiry was applied.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool>;

    /// Bounded iteration over the keyspace. Pass cursor 0 to start; a returned
    /// cursor of 0 means the scan is complete. Used by the orphan sweep only.
    async fn scan(&self, cursor: u64, count: usize) -> Result<(u64, Vec<String>)>;

    async fn key_count(&self) -> Result<u64>;

    /// Cheap liveness probe for health reporting.
    async fn ping(&self) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// The HOT/COLD backend pair, selected by tier tag.
#[derive(Clone)]
pub struct TieredStores {
    hot: Arc<dyn KvBackend>,
    cold: Arc<dyn KvBackend>,
}

impl TieredStores {
    pub fn new(hot: Arc<dyn KvBackend>, cold: Arc<dyn KvBackend>) -> Self {
        Self { hot, cold }
    }

    pub fn tier(&self, tier: StorageTier) -> &Arc<dyn KvBackend> {
        match tier {
            StorageTier::Hot => &self.hot,
            StorageTier::Cold => &self.cold,
        }
    }

    pub fn hot(&self) -> &Arc<dyn KvBackend> {
        &self.hot
    }

    pub fn cold(&self) -> &Arc<dyn KvBackend> {
        &self.cold
    }
}
