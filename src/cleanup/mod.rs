//! Cleanup engine: reconciles metadata, HOT, and COLD.
//!
//! Two sweeps keep the three surfaces consistent. The expiry sweep removes
//! keys whose metadata `expire_time` has passed, deleting the value from the
//! recorded tier and then the metadata row. The orphan sweep scans both
//! stores for keys with no metadata row and removes them; a candidate is only
//! deleted after a second, cache-bypassing metadata read confirms the row is
//! really absent. Dry-run suppresses deletes and reports the would-delete
//! list instead.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::bus::{CleanupEvent, EventBus};
use crate::config::CleanupConfig;
use crate::error::Result;
use crate::metadata::MetadataService;
use crate::storage::TieredStores;
use crate::types::{now_ms, CleanupRecord, CleanupType, StorageTier, TaskStatus};

const RECORD_HISTORY_LIMIT: usize = 100;

/// Sweep result: the audit record plus, in dry-run, the keys that would have
/// been deleted.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupOutcome {
    pub record: CleanupRecord,
    pub dry_run: bool,
    pub would_delete: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupStatistics {
    pub hot_key_count: u64,
    pub cold_key_count: u64,
    pub metadata_count: i64,
    pub recent_records: Vec<CleanupRecord>,
}

pub struct CleanupEngine {
    metadata: Arc<MetadataService>,
    stores: TieredStores,
    bus: Arc<EventBus>,
    config: CleanupConfig,
    records: RwLock<Vec<CleanupRecord>>,
    expiry_gate: Mutex<()>,
    orphan_gate: Mutex<()>,
}

impl CleanupEngine {
    pub fn new(
        metadata: Arc<MetadataService>,
        stores: TieredStores,
        bus: Arc<EventBus>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            metadata,
            stores,
            bus,
            config,
            records: RwLock::new(Vec::new()),
            expiry_gate: Mutex::new(()),
            orphan_gate: Mutex::new(()),
        }
    }

    /// One expiry sweep; ticks landing mid-sweep are dropped.
    pub async fn run_expired_sweep(&self, dry_run: bool) -> Option<CleanupOutcome> {
        let Ok(_gate) = self.expiry_gate.try_lock() else {
            debug!("Expiry sweep already running, dropping tick");
            return None;
        };

        info!("Starting expired-data sweep (dry_run: {})", dry_run);
        let mut record = CleanupRecord::new(CleanupType::Expired);
        let mut would_delete = Vec::new();
        let now = now_ms();

        if dry_run {
            match self
                .metadata
                .select_expired(now, self.config.cleanup_batch_size * 10)
                .await
            {
                Ok(keys) => {
                    info!("Dry run: {} expired keys would be cleaned", keys.len());
                    would_delete = keys;
                }
                Err(e) => {
                    record.status = TaskStatus::Failed;
                    record.error_message = Some(e.to_string());
                }
            }
            if record.status != TaskStatus::Failed {
                record.status = TaskStatus::Completed;
            }
            record.end_time = Some(now_ms());
            return Some(self.finish(record, dry_run, would_delete).await);
        }

        let mut processed: HashSet<String> = HashSet::new();
        loop {
            let batch = match self
                .metadata
                .select_expired(now, self.config.cleanup_batch_size)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("Expired-key selection failed: {}", e);
                    record.status = TaskStatus::Failed;
                    record.error_message = Some(e.to_string());
                    break;
                }
            };

            // Keys that already failed once stay in metadata; don't spin on them.
            let batch: Vec<String> = batch
                .into_iter()
                .filter(|k| !processed.contains(k))
                .collect();
            if batch.is_empty() {
                record.status = TaskStatus::Completed;
                break;
            }

            for key in &batch {
                processed.insert(key.clone());
                match self.cleanup_expired_key(key).await {
                    Ok(true) => record.cleaned_count += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Failed to clean expired key: {}: {}", key, e);
                        record.failed_count += 1;
                    }
                }
            }

            time::sleep(Duration::from_millis(self.config.batch_interval_ms)).await;
        }

        record.end_time = Some(now_ms());
        info!(
            "Expired-data sweep finished, cleaned: {}, failed: {}",
            record.cleaned_count, record.failed_count
        );
        Some(self.finish(record, dry_run, would_delete).await)
    }

    /// Delete one expired key from its recorded tier, then its metadata row.
    /// Returns Ok(false) when the metadata row vanished concurrently.
    async fn cleanup_expired_key(&self, key: &str) -> Result<bool> {
        let Some(meta) = self.metadata.get(key).await? else {
            warn!("Metadata missing for expired key, skipping: {}", key);
            return Ok(false);
        };

        self.stores.tier(meta.storage_tier).del(key).await?;
        self.metadata.delete(key).await?;

        self.bus.publish_cleanup_event(
            key,
            &CleanupEvent::KeyCleaned {
                key: key.to_string(),
                tier: meta.storage_tier,
                reason: CleanupType::Expired,
                timestamp_ms: now_ms(),
            },
        );
        Ok(true)
    }

    /// One orphan sweep over both stores; ticks landing mid-sweep are dropped.
    pub async fn run_orphan_sweep(&self, dry_run: bool) -> Option<CleanupOutcome> {
        let Ok(_gate) = self.orphan_gate.try_lock() else {
            debug!("Orphan sweep already running, dropping tick");
            return None;
        };
        if !self.config.orphan_cleanup_enabled {
            info!("Orphan cleanup disabled, skipping sweep");
            return None;
        }

        info!("Starting orphan-data sweep (dry_run: {})", dry_run);
        let mut record = CleanupRecord::new(CleanupType::Orphan);
        let mut would_delete = Vec::new();

        for tier in [StorageTier::Hot, StorageTier::Cold] {
            if let Err(e) = self
                .sweep_store_orphans(tier, dry_run, &mut record, &mut would_delete)
                .await
            {
                warn!("Orphan sweep failed on {}: {}", tier, e);
                record.status = TaskStatus::Failed;
                record.error_message = Some(e.to_string());
            }
        }

        if record.status != TaskStatus::Failed {
            record.status = TaskStatus::Completed;
        }
        record.end_time = Some(now_ms());
        info!(
            "Orphan-data sweep finished, cleaned: {}, failed: {}",
            record.cleaned_count, record.failed_count
        );
        Some(self.finish(record, dry_run, would_delete).await)
    }

    async fn sweep_store_orphans(
        &self,
        tier: StorageTier,
        dry_run: bool,
        record: &mut CleanupRecord,
        would_delete: &mut Vec<String>,
    ) -> Result<()> {
        let store = self.stores.tier(tier);
        let mut cursor = 0u64;

        loop {
            let (next, keys) = store.scan(cursor, self.config.orphan_scan_count).await?;

            for key in &keys {
                if self.metadata.get(key).await?.is_some() {
                    continue;
                }
                // A cache miss is not proof of absence; confirm against the
                // authoritative store before calling the key an orphan.
                if self.metadata.get_authoritative(key).await?.is_some() {
                    continue;
                }

                if dry_run {
                    would_delete.push(key.clone());
                    continue;
                }

                match store.del(key).await {
                    Ok(true) => {
                        record.cleaned_count += 1;
                        debug!("Removed orphan key from {}: {}", tier, key);
                        self.bus.publish_cleanup_event(
                            key,
                            &CleanupEvent::KeyCleaned {
                                key: key.clone(),
                                tier,
                                reason: CleanupType::Orphan,
                                timestamp_ms: now_ms(),
                            },
                        );
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Failed to remove orphan key: {}: {}", key, e);
                        record.failed_count += 1;
                    }
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
            time::sleep(Duration::from_millis(self.config.batch_interval_ms)).await;
        }
        Ok(())
    }

    /// Manual trigger with explicit keys.
    ///
    /// Expired cleanup resolves each key's tier through metadata; orphan
    /// cleanup still refuses to touch any key that has a metadata row.
    pub async fn trigger(&self, cleanup_type: CleanupType, keys: &[String]) -> CleanupOutcome {
        info!(
            "Manual {} cleanup for {} keys",
            cleanup_type.as_str(),
            keys.len()
        );
        let mut record = CleanupRecord::new(cleanup_type);
        let dry_run = self.config.dry_run;
        let mut would_delete = Vec::new();

        for key in keys {
            let outcome = match cleanup_type {
                CleanupType::Expired => {
                    if dry_run {
                        would_delete.push(key.clone());
                        continue;
                    }
                    self.cleanup_expired_key(key).await
                }
                CleanupType::Orphan => self.cleanup_orphan_key(key, dry_run, &mut would_delete).await,
            };
            match outcome {
                Ok(true) => record.cleaned_count += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Manual cleanup failed for key: {}: {}", key, e);
                    record.failed_count += 1;
                }
            }
        }

        record.status = TaskStatus::Completed;
        record.end_time = Some(now_ms());
        self.finish(record, dry_run, would_delete).await
    }

    async fn cleanup_orphan_key(
        &self,
        key: &str,
        dry_run: bool,
        would_delete: &mut Vec<String>,
    ) -> Result<bool> {
        if self.metadata.get_authoritative(key).await?.is_some() {
            warn!("Refusing orphan cleanup, metadata exists for key: {}", key);
            return Ok(false);
        }
        if dry_run {
            would_delete.push(key.to_string());
            return Ok(false);
        }

        let mut cleaned = false;
        for tier in [StorageTier::Hot, StorageTier::Cold] {
            if self.stores.tier(tier).del(key).await? {
                cleaned = true;
                self.bus.publish_cleanup_event(
                    key,
                    &CleanupEvent::KeyCleaned {
                        key: key.to_string(),
                        tier,
                        reason: CleanupType::Orphan,
                        timestamp_ms: now_ms(),
                    },
                );
            }
        }
        Ok(cleaned)
    }

    async fn finish(
        &self,
        record: CleanupRecord,
        dry_run: bool,
        would_delete: Vec<String>,
    ) -> CleanupOutcome {
        self.bus.publish_cleanup_event(
            &record.task_id,
            &CleanupEvent::SweepCompleted {
                record: record.clone(),
            },
        );

        let mut records = self.records.write().await;
        records.push(record.clone());
        // History is bounded both by count and by age.
        let retention_cutoff =
            now_ms() - self.config.expired_retention_days as i64 * 24 * 60 * 60 * 1000;
        records.retain(|r| r.start_time >= retention_cutoff);
        if records.len() > RECORD_HISTORY_LIMIT {
            let excess = records.len() - RECORD_HISTORY_LIMIT;
            records.drain(0..excess);
        }

        CleanupOutcome {
            record,
            dry_run,
            would_delete,
        }
    }

    pub async fn records(&self) -> Vec<CleanupRecord> {
        self.records.read().await.clone()
    }

    pub async fn statistics(&self) -> CleanupStatistics {
        let hot_key_count = self.stores.hot().key_count().await.unwrap_or(0);
        let cold_key_count = self.stores.cold().key_count().await.unwrap_or(0);
        let metadata_count = self.metadata.total_count().await.unwrap_or(0);

        let records = self.records.read().await;
        let recent_records = records.iter().rev().take(10).cloned().collect();

        CleanupStatistics {
            hot_key_count,
            cold_key_count,
            metadata_count,
            recent_records,
        }
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    /// Start the periodic expiry and orphan loops.
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let expiry_engine = Arc::clone(&self);
        let expiry_loop = tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_secs(
                expiry_engine.config.expiry_sweep_interval_secs,
            ));
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let dry_run = expiry_engine.config.dry_run;
                expiry_engine.run_expired_sweep(dry_run).await;
            }
        });

        let orphan_engine = self;
        let orphan_loop = tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_secs(
                orphan_engine.config.orphan_sweep_interval_secs,
            ));
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let dry_run = orphan_engine.config.dry_run;
                orphan_engine.run_orphan_sweep(dry_run).await;
            }
        });

        vec![expiry_loop, orphan_loop]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureHubConfig;
    use crate::metadata::{MetadataCache, MetadataStore};
    use crate::storage::MemoryKv;
    use crate::types::FeatureMetadata;

    async fn test_engine() -> (Arc<CleanupEngine>, Arc<MetadataService>, TieredStores) {
        let db_path = format!("/tmp/featurehub_cleanup_test_{}.db", rand::random::<u64>());
        let store = MetadataStore::connect(&db_path, 5, 3).await.unwrap();
        let cache = MetadataCache::new(1_000, Duration::from_secs(60));
        let metadata = Arc::new(MetadataService::new(store, cache));

        let stores = TieredStores::new(
            Arc::new(MemoryKv::new("hot")),
            Arc::new(MemoryKv::new("cold")),
        );
        let bus = Arc::new(EventBus::new(4, 256));
        let mut config = FeatureHubConfig::default().cleanup;
        config.batch_interval_ms = 1;
        let engine = Arc::new(CleanupEngine::new(
            Arc::clone(&metadata),
            stores.clone(),
            bus,
            config,
        ));
        (engine, metadata, stores)
    }

    #[tokio::test]
    async fn expiry_sweep_removes_value_and_metadata() {
        let (engine, metadata, stores) = test_engine().await;

        let mut meta = FeatureMetadata::new("x", StorageTier::Hot);
        meta.expire_time = Some(now_ms() - 1);
        metadata.upsert(&meta).await.unwrap();
        stores.hot().set("x", "v", None).await.unwrap();

        let outcome = engine.run_expired_sweep(false).await.unwrap();
        assert_eq!(outcome.record.cleaned_count, 1);
        assert_eq!(outcome.record.failed_count, 0);
        assert_eq!(outcome.record.status, TaskStatus::Completed);

        assert!(!stores.hot().exists("x").await.unwrap());
        assert!(metadata.get("x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expiry_sweep_ignores_live_keys() {
        let (engine, metadata, stores) = test_engine().await;

        let mut meta = FeatureMetadata::new("alive", StorageTier::Hot);
        meta.expire_time = Some(now_ms() + 60_000);
        metadata.upsert(&meta).await.unwrap();
        stores.hot().set("alive", "v", None).await.unwrap();

        let outcome = engine.run_expired_sweep(false).await.unwrap();
        assert_eq!(outcome.record.cleaned_count, 0);
        assert!(stores.hot().exists("alive").await.unwrap());
    }

    #[tokio::test]
    async fn orphan_sweep_removes_unrecorded_keys() {
        let (engine, metadata, stores) = test_engine().await;

        // Value in COLD with no metadata row.
        stores.cold().set("y", "v", None).await.unwrap();
        // Value with metadata must survive.
        metadata
            .upsert(&FeatureMetadata::new("kept", StorageTier::Cold))
            .await
            .unwrap();
        stores.cold().set("kept", "v", None).await.unwrap();

        let outcome = engine.run_orphan_sweep(false).await.unwrap();
        assert_eq!(outcome.record.cleaned_count, 1);

        assert!(!stores.cold().exists("y").await.unwrap());
        assert!(stores.cold().exists("kept").await.unwrap());

        // Running again is a no-op.
        let outcome = engine.run_orphan_sweep(false).await.unwrap();
        assert_eq!(outcome.record.cleaned_count, 0);
    }

    #[tokio::test]
    async fn orphan_sweep_spares_keys_with_cold_cache() {
        let (engine, metadata, stores) = test_engine().await;

        // Row exists only in the authoritative store; the cache has never
        // seen this key. The sweep must still find it and spare the value.
        stores.hot().set("uncached", "v", None).await.unwrap();
        metadata
            .upsert(&FeatureMetadata::new("uncached", StorageTier::Hot))
            .await
            .unwrap();

        let outcome = engine.run_orphan_sweep(false).await.unwrap();
        assert_eq!(outcome.record.cleaned_count, 0);
        assert!(stores.hot().exists("uncached").await.unwrap());
    }

    #[tokio::test]
    async fn dry_run_reports_without_deleting() {
        let (engine, metadata, stores) = test_engine().await;

        stores.cold().set("orphan", "v", None).await.unwrap();
        let mut meta = FeatureMetadata::new("expired", StorageTier::Hot);
        meta.expire_time = Some(now_ms() - 1);
        metadata.upsert(&meta).await.unwrap();
        stores.hot().set("expired", "v", None).await.unwrap();

        let orphan = engine.run_orphan_sweep(true).await.unwrap();
        assert!(orphan.dry_run);
        assert_eq!(orphan.would_delete, vec!["orphan".to_string()]);
        assert_eq!(orphan.record.cleaned_count, 0);
        assert!(stores.cold().exists("orphan").await.unwrap());

        let expired = engine.run_expired_sweep(true).await.unwrap();
        assert_eq!(expired.would_delete, vec!["expired".to_string()]);
        assert!(stores.hot().exists("expired").await.unwrap());
        assert!(metadata.get("expired").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn manual_orphan_trigger_refuses_recorded_keys() {
        let (engine, metadata, stores) = test_engine().await;

        metadata
            .upsert(&FeatureMetadata::new("recorded", StorageTier::Hot))
            .await
            .unwrap();
        stores.hot().set("recorded", "v", None).await.unwrap();
        stores.hot().set("stray", "v", None).await.unwrap();

        let outcome = engine
            .trigger(
                CleanupType::Orphan,
                &["recorded".to_string(), "stray".to_string()],
            )
            .await;

        assert_eq!(outcome.record.cleaned_count, 1);
        assert!(stores.hot().exists("recorded").await.unwrap());
        assert!(!stores.hot().exists("stray").await.unwrap());
    }

    #[tokio::test]
    async fn manual_expired_trigger_uses_recorded_tier() {
        let (engine, metadata, stores) = test_engine().await;

        let mut meta = FeatureMetadata::new("k", StorageTier::Cold);
        meta.expire_time = Some(now_ms() - 1);
        metadata.upsert(&meta).await.unwrap();
        stores.cold().set("k", "v", None).await.unwrap();

        let outcome = engine
            .trigger(CleanupType::Expired, &["k".to_string()])
            .await;
        assert_eq!(outcome.record.cleaned_count, 1);
        assert!(!stores.cold().exists("k").await.unwrap());
        assert!(metadata.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn statistics_report_counts_and_history() {
        let (engine, metadata, stores) = test_engine().await;

        stores.hot().set("h", "v", None).await.unwrap();
        stores.cold().set("c", "v", None).await.unwrap();
        metadata
            .upsert(&FeatureMetadata::new("h", StorageTier::Hot))
            .await
            .unwrap();

        engine.run_expired_sweep(false).await.unwrap();

        let stats = engine.statistics().await;
        assert_eq!(stats.hot_key_count, 1);
        assert_eq!(stats.cold_key_count, 1);
        assert_eq!(stats.metadata_count, 1);
        assert_eq!(stats.recent_records.len(), 1);
    }
}
