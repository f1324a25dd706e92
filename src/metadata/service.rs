//! Metadata service: the system of record for key placement.
//!
//! Wraps the authoritative store with a read-through cache and exposes the
//! contract every other subsystem uses. All metadata mutations in the system
//! flow through here; nothing else writes the underlying table.

use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::cache::MetadataCache;
use super::store::{MetadataStore, PlacementStats, UpsertOutcome};
use crate::error::Result;
use crate::types::{now_ms, FeatureMetadata, StorageTier};

/// Aggregated metadata statistics for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MetadataStats {
    pub storage_stats: HashMap<String, i64>,
    pub total_keys: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail_stats: Option<PlacementStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_stats: Option<PlacementStats>,
    pub active_keys_24h: i64,
    pub timestamp: i64,
}

pub struct MetadataService {
    store: MetadataStore,
    cache: MetadataCache,
}

impl MetadataService {
    pub fn new(store: MetadataStore, cache: MetadataCache) -> Self {
        Self { store, cache }
    }

    /// Read-through lookup: cache first, store on miss, populate on hit.
    pub async fn get(&self, key: &str) -> Result<Option<FeatureMetadata>> {
        if let Some(cached) = self.cache.get(key).await {
            debug!("Metadata cache hit for key: {}", key);
            return Ok(Some(cached));
        }

        let meta = self.store.get(key).await?;
        if let Some(ref m) = meta {
            self.cache.insert(m).await;
        }
        Ok(meta)
    }

    /// Store-only lookup, bypassing the cache. The cleanup engine uses this to
    /// re-validate orphan candidates before deleting.
    pub async fn get_authoritative(&self, key: &str) -> Result<Option<FeatureMetadata>> {
        self.store.get(key).await
    }

    /// Batch resolution in three logical round trips: one cache multi-get, one
    /// store IN-list query for the misses, one cache multi-set. Duplicate
    /// input keys are deduplicated before backend I/O.
    pub async fn batch_get(&self, keys: &[String]) -> Result<HashMap<String, FeatureMetadata>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut unique: Vec<String> = Vec::with_capacity(keys.len());
        let mut seen = std::collections::HashSet::with_capacity(keys.len());
        for key in keys {
            if seen.insert(key.as_str()) {
                unique.push(key.clone());
            }
        }

        let mut resolved = self.cache.multi_get(&unique).await;

        let missed: Vec<String> = unique
            .iter()
            .filter(|k| !resolved.contains_key(*k))
            .cloned()
            .collect();

        if !missed.is_empty() {
            let fetched = self.store.batch_get(&missed).await?;
            self.cache.multi_insert(&fetched).await;
            for meta in fetched {
                resolved.insert(meta.key_name.clone(), meta);
            }
        }

        Ok(resolved)
    }

    /// Insert or update a placement record. A created row is cached as-is; an
    /// updated row is invalidated so the next read refetches the merged truth.
    pub async fn upsert(&self, record: &FeatureMetadata) -> Result<UpsertOutcome> {
        let outcome = self.store.upsert(record).await?;

        if outcome.created {
            self.cache.insert(record).await;
            info!("Created metadata for key: {}", record.key_name);
        } else {
            self.cache.invalidate(&record.key_name).await;
            debug!("Updated metadata for key: {}", record.key_name);
        }
        Ok(outcome)
    }

    /// Full-row update; no-op returning false when the key is absent.
    pub async fn update(&self, record: &FeatureMetadata) -> Result<bool> {
        let updated = self.store.update(record).await?;
        if updated {
            self.cache.invalidate(&record.key_name).await;
        } else {
            warn!("No metadata found to update for key: {}", record.key_name);
        }
        Ok(updated)
    }

    pub async fn batch_update(
        &self,
        records: &[FeatureMetadata],
    ) -> Result<HashMap<String, bool>> {
        let mut results = HashMap::with_capacity(records.len());
        for record in records {
            let ok = match self.update(record).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("Batch update failed for key: {}: {}", record.key_name, e);
                    false
                }
            };
            results.insert(record.key_name.clone(), ok);
        }
        Ok(results)
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let deleted = self.store.delete(key).await?;
        if deleted {
            self.cache.invalidate(key).await;
            info!("Deleted metadata for key: {}", key);
        }
        Ok(deleted)
    }

    /// Advisory access-stat bump from the router's async path.
    pub async fn record_access(&self, key: &str) -> Result<bool> {
        let updated = self.store.record_access(key, now_ms()).await?;
        if updated {
            self.cache.invalidate(key).await;
        }
        Ok(updated)
    }

    /// CAS claim {STABLE, FAILED} -> MIGRATING. The store is the only arbiter;
    /// at most one concurrent caller wins.
    pub async fn claim_for_migration(&self, key: &str) -> Result<bool> {
        let claimed = self.store.claim_for_migration(key, now_ms()).await?;
        if claimed {
            self.cache.invalidate(key).await;
        }
        Ok(claimed)
    }

    pub async fn mark_migration_failed(&self, key: &str) -> Result<bool> {
        let updated = self.store.mark_migration_failed(key, now_ms()).await?;
        if updated {
            self.cache.invalidate(key).await;
        }
        Ok(updated)
    }

    pub async fn finalize_migration(&self, key: &str, new_tier: StorageTier) -> Result<bool> {
        let updated = self.store.finalize_migration(key, new_tier, now_ms()).await?;
        if updated {
            self.cache.invalidate(key).await;
        }
        Ok(updated)
    }

    pub async fn select_for_hot_to_cold(
        &self,
        now: i64,
        idle_threshold_ms: i64,
        limit: usize,
    ) -> Result<Vec<FeatureMetadata>> {
        self.store
            .select_for_hot_to_cold(now, idle_threshold_ms, limit)
            .await
    }

    pub async fn select_for_cold_to_hot(
        &self,
        access_count_threshold: i64,
        recent_access_since: i64,
        limit: usize,
    ) -> Result<Vec<FeatureMetadata>> {
        self.store
            .select_for_cold_to_hot(access_count_threshold, recent_access_since, limit)
            .await
    }

    pub async fn select_expired(&self, now: i64, limit: usize) -> Result<Vec<String>> {
        self.store.select_expired(now, limit).await
    }

    /// Remove every expired row, invalidating cache entries as it goes.
    /// Each selected batch is deleted before the next selection, so the scan
    /// terminates no matter how many rows have expired. Returns the number of
    /// rows removed.
    pub async fn cleanup_expired(&self, now: i64, batch_limit: usize) -> Result<u64> {
        let mut total_deleted = 0u64;
        loop {
            let batch = self.store.select_expired(now, batch_limit).await?;
            if batch.is_empty() {
                break;
            }

            total_deleted += self.store.delete_many(&batch).await?;
            for key in &batch {
                self.cache.invalidate(key).await;
            }

            if batch.len() < batch_limit {
                break;
            }
        }

        if total_deleted == 0 {
            info!("No expired metadata found");
        } else {
            info!("Cleaned up {} expired metadata records", total_deleted);
        }
        Ok(total_deleted)
    }

    pub async fn count_by_tier(&self) -> Result<HashMap<StorageTier, i64>> {
        self.store.count_by_tier().await
    }

    pub async fn total_count(&self) -> Result<i64> {
        self.store.total_count().await
    }

    pub async fn stats(
        &self,
        storage_type: Option<StorageTier>,
        business_tag: Option<&str>,
    ) -> Result<MetadataStats> {
        let counts = self.store.count_by_tier().await?;
        let storage_stats: HashMap<String, i64> = counts
            .iter()
            .map(|(tier, count)| (tier.as_str().to_string(), *count))
            .collect();
        let total_keys = counts.values().sum();

        let detail_stats = match storage_type {
            Some(tier) => Some(self.store.stats_by_tier(tier).await?),
            None => None,
        };
        let business_stats = match business_tag {
            Some(tag) => Some(self.store.stats_by_tag(tag).await?),
            None => None,
        };

        let yesterday = now_ms() - 24 * 60 * 60 * 1000;
        let active_keys_24h = self.store.count_active_since(yesterday).await?;

        Ok(MetadataStats {
            storage_stats,
            total_keys,
            detail_stats,
            business_stats,
            active_keys_24h,
            timestamp: now_ms(),
        })
    }

    pub async fn reset_access_counts(&self) -> Result<u64> {
        let reset = self.store.reset_access_counts(now_ms()).await?;
        info!("Reset access counts on {} metadata rows", reset);
        Ok(reset)
    }

    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }
}
