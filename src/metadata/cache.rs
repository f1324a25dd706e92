//! Read-through cache for metadata rows.
//!
//! Entries expire after the configured TTL; the cache is never authoritative
//! and every miss falls through to the store. Cache operations cannot fail,
//! which keeps the "cache errors are non-fatal" rule structural.

use moka::future::Cache;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::types::FeatureMetadata;

pub struct MetadataCache {
    cache: Cache<String, Arc<FeatureMetadata>>,
}

impl MetadataCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub async fn get(&self, key: &str) -> Option<FeatureMetadata> {
        self.cache.get(key).await.map(|arc| (*arc).clone())
    }

    /// One logical multi-get: every hit in a single pass.
    pub async fn multi_get(&self, keys: &[String]) -> HashMap<String, FeatureMetadata> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(meta) = self.cache.get(key).await {
                out.insert(key.clone(), (*meta).clone());
            }
        }
        out
    }

    pub async fn insert(&self, meta: &FeatureMetadata) {
        self.cache
            .insert(meta.key_name.clone(), Arc::new(meta.clone()))
            .await;
    }

    /// One logical multi-set for freshly fetched rows.
    pub async fn multi_insert(&self, rows: &[FeatureMetadata]) {
        for meta in rows {
            self.insert(meta).await;
        }
    }

    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}
