//! Migration engine: moves feature keys between HOT and COLD.
//!
//! Two periodic sweeps select candidates from metadata and run the per-key
//! protocol: claim via CAS, copy source to target, verify bytes, delete
//! source, finalize placement. The CAS on `migration_status` is the only
//! per-key lock in the system; a lost claim means another migrator owns the
//! key and the sweep skips it. Failed keys park in FAILED and are reclaimed
//! by a later sweep.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, MigrationEvent};
use crate::config::MigrationConfig;
use crate::error::{Error, Result};
use crate::metadata::MetadataService;
use crate::storage::TieredStores;
use crate::types::{now_ms, MigrationRecord, MigrationType, StorageTier, TaskStatus};

/// Most recent task records kept for the statistics endpoints.
const RECORD_HISTORY_LIMIT: usize = 100;

/// Aggregates over the retained migration records.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatistics {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub hot_to_cold_tasks: usize,
    pub cold_to_hot_tasks: usize,
    pub total_keys_migrated: usize,
    pub total_keys_failed: usize,
    pub last_task_time: Option<i64>,
    pub paused: bool,
}

/// Candidate counts for a prospective sweep; no mutation.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationEstimate {
    pub hot_to_cold_candidates: usize,
    pub cold_to_hot_candidates: usize,
    pub batch_size: usize,
}

/// Manual trigger request.
#[derive(Debug, Clone)]
pub struct MigrationTask {
    pub task_type: MigrationType,
    pub keys: Vec<String>,
}

pub struct MigrationEngine {
    metadata: Arc<MetadataService>,
    stores: TieredStores,
    bus: Arc<EventBus>,
    config: MigrationConfig,
    records: RwLock<Vec<MigrationRecord>>,
    paused: AtomicBool,
    hot_sweep_gate: Mutex<()>,
    cold_sweep_gate: Mutex<()>,
}

impl MigrationEngine {
    pub fn new(
        metadata: Arc<MetadataService>,
        stores: TieredStores,
        bus: Arc<EventBus>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            metadata,
            stores,
            bus,
            config,
            records: RwLock::new(Vec::new()),
            paused: AtomicBool::new(false),
            hot_sweep_gate: Mutex::new(()),
            cold_sweep_gate: Mutex::new(()),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("Migration engine paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("Migration engine resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// One HOT->COLD sweep. Returns None when a sweep is already in flight
    /// (the tick is dropped, not queued) or the engine is paused.
    pub async fn run_hot_to_cold_sweep(&self) -> Option<MigrationRecord> {
        let Ok(_gate) = self.hot_sweep_gate.try_lock() else {
            debug!("HOT->COLD sweep already running, dropping tick");
            return None;
        };
        if self.is_paused() {
            debug!("Migration paused, skipping HOT->COLD sweep");
            return None;
        }
        Some(self.run_sweep(MigrationType::HotToCold).await)
    }

    /// One COLD->HOT sweep, same at-most-once semantics.
    pub async fn run_cold_to_hot_sweep(&self) -> Option<MigrationRecord> {
        let Ok(_gate) = self.cold_sweep_gate.try_lock() else {
            debug!("COLD->HOT sweep already running, dropping tick");
            return None;
        };
        if self.is_paused() {
            debug!("Migration paused, skipping COLD->HOT sweep");
            return None;
        }
        Some(self.run_sweep(MigrationType::ColdToHot).await)
    }

    async fn run_sweep(&self, task_type: MigrationType) -> MigrationRecord {
        info!("Starting {} sweep", task_type.as_str());
        let mut record = MigrationRecord::new(task_type);

        let candidates = match self.select_candidates(task_type).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Candidate selection failed for {}: {}", task_type.as_str(), e);
                record.status = TaskStatus::Failed;
                record.error_message = Some(e.to_string());
                record.end_time = Some(now_ms());
                self.store_record(record.clone()).await;
                return record;
            }
        };

        if candidates.is_empty() {
            info!("No candidates for {} sweep", task_type.as_str());
            record.status = TaskStatus::Completed;
            record.end_time = Some(now_ms());
            self.store_record(record.clone()).await;
            return record;
        }

        info!(
            "Found {} candidates for {} sweep",
            candidates.len(),
            task_type.as_str()
        );
        let keys: Vec<String> = candidates.into_iter().map(|m| m.key_name).collect();
        self.process_keys(task_type, &keys, &mut record).await;

        record.status = TaskStatus::Completed;
        record.end_time = Some(now_ms());
        info!(
            "{} sweep completed, migrated: {}, failed: {}",
            task_type.as_str(),
            record.success_count,
            record.fail_count
        );

        self.bus.publish_migration_event(
            &record.task_id,
            &MigrationEvent::SweepCompleted {
                record: record.clone(),
            },
        );
        self.store_record(record.clone()).await;
        record
    }

    async fn select_candidates(
        &self,
        task_type: MigrationType,
    ) -> Result<Vec<crate::types::FeatureMetadata>> {
        let now = now_ms();
        match task_type {
            MigrationType::HotToCold => {
                self.metadata
                    .select_for_hot_to_cold(
                        now,
                        self.config.hot_to_cold_idle_ms,
                        self.config.max_migration_size,
                    )
                    .await
            }
            MigrationType::ColdToHot => {
                self.metadata
                    .select_for_cold_to_hot(
                        self.config.cold_to_hot_access_threshold,
                        now - self.config.cold_to_hot_recent_ms,
                        self.config.max_recall_size,
                    )
                    .await
            }
        }
    }

    /// Migrate keys in batches, pausing between batches to throttle sweep
    /// pressure. A pause request takes effect at the next batch boundary.
    async fn process_keys(
        &self,
        task_type: MigrationType,
        keys: &[String],
        record: &mut MigrationRecord,
    ) {
        record.total = keys.len();
        let batches: Vec<&[String]> = keys.chunks(self.config.migration_batch_size).collect();
        let total_batches = batches.len();

        for (i, batch) in batches.into_iter().enumerate() {
            if self.is_paused() {
                warn!("Migration paused mid-sweep after {} batches", i);
                record.error_message = Some("paused before completion".to_string());
                break;
            }

            for key in batch {
                match self.migrate_key(key, task_type).await {
                    Ok(()) => record.success_count += 1,
                    Err(Error::Conflict(_)) => {
                        // Another migrator owns the key; not a failure.
                        debug!("Skipping key with lost claim: {}", key);
                    }
                    Err(e) => {
                        record.fail_count += 1;
                        record.failed_keys.push(key.clone());
                        warn!("Migration failed for key: {}: {}", key, e);
                    }
                }
            }

            info!(
                "{} progress: {}/{} batches",
                task_type.as_str(),
                i + 1,
                total_batches
            );
            if i + 1 < total_batches {
                time::sleep(Duration::from_millis(self.config.batch_interval_ms)).await;
            }
        }
    }

    /// Per-key migration protocol.
    ///
    /// claim -> read source -> write target -> verify -> delete source ->
    /// finalize. Any abort parks the row in FAILED with the source copy
    /// intact; the next sweep reclaims it.
    pub async fn migrate_key(&self, key: &str, task_type: MigrationType) -> Result<()> {
        let source = task_type.source();
        let target = task_type.target();

        if !self.metadata.claim_for_migration(key).await? {
            return Err(Error::Conflict(key.to_string()));
        }

        let value = match self.stores.tier(source).get(key).await {
            Ok(Some(v)) => v,
            Ok(None) => {
                return self
                    .abort(key, source, target, "source value missing")
                    .await;
            }
            Err(e) => {
                return self
                    .abort(key, source, target, &format!("source read: {e}"))
                    .await;
            }
        };

        // Carry the remaining TTL across tiers when one is set.
        let ttl = self.stores.tier(source).ttl(key).await.unwrap_or(None);

        if let Err(e) = self.stores.tier(target).set(key, &value, ttl).await {
            return self
                .abort(key, source, target, &format!("target write: {e}"))
                .await;
        }

        // Byte-compare the copy before touching the source.
        match self.stores.tier(target).get(key).await {
            Ok(Some(copied)) if copied == value => {}
            Ok(_) => {
                return self
                    .abort(key, source, target, "verification mismatch")
                    .await;
            }
            Err(e) => {
                return self
                    .abort(key, source, target, &format!("verification read: {e}"))
                    .await;
            }
        }

        if let Err(e) = self.stores.tier(source).del(key).await {
            return self
                .abort(key, source, target, &format!("source delete: {e}"))
                .await;
        }

        if !self.metadata.finalize_migration(key, target).await? {
            warn!("Finalize found no MIGRATING row for key: {}", key);
        }

        debug!("Migrated key: {} {} -> {}", key, source, target);
        self.bus.publish_migration_event(
            key,
            &MigrationEvent::KeyMigrated {
                key: key.to_string(),
                source,
                target,
                timestamp_ms: now_ms(),
            },
        );
        Ok(())
    }

    async fn abort(
        &self,
        key: &str,
        source: StorageTier,
        target: StorageTier,
        reason: &str,
    ) -> Result<()> {
        if let Err(e) = self.metadata.mark_migration_failed(key).await {
            warn!("Failed to mark migration FAILED for key: {}: {}", key, e);
        }
        self.bus.publish_migration_event(
            key,
            &MigrationEvent::KeyFailed {
                key: key.to_string(),
                source,
                target,
                reason: reason.to_string(),
                timestamp_ms: now_ms(),
            },
        );
        Err(Error::internal(format!("migration aborted: {reason}")))
    }

    /// Manual trigger: bypasses candidate selection and migrates the given
    /// keys directly.
    pub async fn trigger(&self, task: MigrationTask) -> MigrationRecord {
        info!(
            "Manual {} migration for {} keys",
            task.task_type.as_str(),
            task.keys.len()
        );
        let mut record = MigrationRecord::new(task.task_type);
        self.process_keys(task.task_type, &task.keys, &mut record)
            .await;
        record.status = TaskStatus::Completed;
        record.end_time = Some(now_ms());

        self.bus.publish_migration_event(
            &record.task_id,
            &MigrationEvent::SweepCompleted {
                record: record.clone(),
            },
        );
        self.store_record(record.clone()).await;
        record
    }

    /// Manual trigger in the background; the returned record is a RUNNING
    /// snapshot, the completed record lands in the history.
    pub fn trigger_async(self: &Arc<Self>, task: MigrationTask) -> MigrationRecord {
        let mut snapshot = MigrationRecord::new(task.task_type);
        snapshot.total = task.keys.len();

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.trigger(task).await;
        });
        snapshot
    }

    async fn store_record(&self, record: MigrationRecord) {
        let mut records = self.records.write().await;
        records.push(record);
        if records.len() > RECORD_HISTORY_LIMIT {
            let excess = records.len() - RECORD_HISTORY_LIMIT;
            records.drain(0..excess);
        }
    }

    pub async fn records(&self) -> Vec<MigrationRecord> {
        self.records.read().await.clone()
    }

    pub async fn statistics(&self) -> MigrationStatistics {
        let records = self.records.read().await;
        MigrationStatistics {
            total_tasks: records.len(),
            completed_tasks: records
                .iter()
                .filter(|r| r.status == TaskStatus::Completed)
                .count(),
            failed_tasks: records
                .iter()
                .filter(|r| r.status == TaskStatus::Failed)
                .count(),
            hot_to_cold_tasks: records
                .iter()
                .filter(|r| r.task_type == MigrationType::HotToCold)
                .count(),
            cold_to_hot_tasks: records
                .iter()
                .filter(|r| r.task_type == MigrationType::ColdToHot)
                .count(),
            total_keys_migrated: records.iter().map(|r| r.success_count).sum(),
            total_keys_failed: records.iter().map(|r| r.fail_count).sum(),
            last_task_time: records.last().map(|r| r.start_time),
            paused: self.is_paused(),
        }
    }

    /// Candidate counts for both directions with the configured thresholds.
    pub async fn estimate(&self) -> Result<MigrationEstimate> {
        let now = now_ms();
        let hot_to_cold = self
            .metadata
            .select_for_hot_to_cold(
                now,
                self.config.hot_to_cold_idle_ms,
                self.config.max_migration_size,
            )
            .await?
            .len();
        let cold_to_hot = self
            .metadata
            .select_for_cold_to_hot(
                self.config.cold_to_hot_access_threshold,
                now - self.config.cold_to_hot_recent_ms,
                self.config.max_recall_size,
            )
            .await?
            .len();

        Ok(MigrationEstimate {
            hot_to_cold_candidates: hot_to_cold,
            cold_to_hot_candidates: cold_to_hot,
            batch_size: self.config.migration_batch_size,
        })
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Start both sweep loops. Ticks landing while the previous sweep is
    /// still running are dropped by the per-direction gates.
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let hot_engine = Arc::clone(&self);
        let hot_loop = tokio::spawn(async move {
            let mut ticker =
                time::interval(Duration::from_secs(hot_engine.config.hot_sweep_interval_secs));
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                hot_engine.run_hot_to_cold_sweep().await;
            }
        });

        let cold_engine = self;
        let cold_loop = tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_secs(
                cold_engine.config.cold_sweep_interval_secs,
            ));
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                cold_engine.run_cold_to_hot_sweep().await;
            }
        });

        vec![hot_loop, cold_loop]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureHubConfig;
    use crate::metadata::{MetadataCache, MetadataStore};
    use crate::storage::MemoryKv;
    use crate::types::{FeatureMetadata, MigrationStatus};

    async fn test_engine() -> (Arc<MigrationEngine>, Arc<MetadataService>, TieredStores) {
        let db_path = format!("/tmp/featurehub_mig_test_{}.db", rand::random::<u64>());
        let store = MetadataStore::connect(&db_path, 5, 3).await.unwrap();
        let cache = MetadataCache::new(1_000, Duration::from_secs(60));
        let metadata = Arc::new(MetadataService::new(store, cache));

        let stores = TieredStores::new(
            Arc::new(MemoryKv::new("hot")),
            Arc::new(MemoryKv::new("cold")),
        );
        let bus = Arc::new(EventBus::new(4, 256));
        let engine = Arc::new(MigrationEngine::new(
            Arc::clone(&metadata),
            stores.clone(),
            bus,
            FeatureHubConfig::default().migration,
        ));
        (engine, metadata, stores)
    }

    async fn seed_idle_hot_key(
        metadata: &MetadataService,
        stores: &TieredStores,
        key: &str,
        idle_days: i64,
    ) {
        let mut meta = FeatureMetadata::new(key, StorageTier::Hot);
        meta.last_access_time = now_ms() - idle_days * 24 * 60 * 60 * 1000;
        metadata.upsert(&meta).await.unwrap();
        stores.hot().set(key, "payload", None).await.unwrap();
    }

    #[tokio::test]
    async fn hot_to_cold_sweep_moves_idle_key() {
        let (engine, metadata, stores) = test_engine().await;
        seed_idle_hot_key(&metadata, &stores, "k", 8).await;

        let record = engine.run_hot_to_cold_sweep().await.unwrap();
        assert_eq!(record.total, 1);
        assert_eq!(record.success_count, 1);
        assert_eq!(record.fail_count, 0);
        assert_eq!(record.status, TaskStatus::Completed);

        assert!(!stores.hot().exists("k").await.unwrap());
        assert_eq!(
            stores.cold().get("k").await.unwrap(),
            Some("payload".to_string())
        );

        let meta = metadata.get("k").await.unwrap().unwrap();
        assert_eq!(meta.storage_tier, StorageTier::Cold);
        assert_eq!(meta.migration_status, MigrationStatus::Stable);
    }

    #[tokio::test]
    async fn fresh_keys_are_not_selected() {
        let (engine, metadata, stores) = test_engine().await;
        seed_idle_hot_key(&metadata, &stores, "fresh", 1).await;

        let record = engine.run_hot_to_cold_sweep().await.unwrap();
        assert_eq!(record.total, 0);
        assert!(stores.hot().exists("fresh").await.unwrap());
    }

    #[tokio::test]
    async fn cold_to_hot_sweep_recalls_hot_key() {
        let (engine, metadata, stores) = test_engine().await;

        let mut meta = FeatureMetadata::new("busy", StorageTier::Cold);
        meta.access_count = 50;
        meta.last_access_time = now_ms() - 1_000;
        metadata.upsert(&meta).await.unwrap();
        stores.cold().set("busy", "v", None).await.unwrap();

        let record = engine.run_cold_to_hot_sweep().await.unwrap();
        assert_eq!(record.success_count, 1);

        assert!(stores.hot().exists("busy").await.unwrap());
        assert!(!stores.cold().exists("busy").await.unwrap());
        let meta = metadata.get("busy").await.unwrap().unwrap();
        assert_eq!(meta.storage_tier, StorageTier::Hot);
    }

    #[tokio::test]
    async fn missing_source_parks_key_in_failed() {
        let (engine, metadata, stores) = test_engine().await;

        // Metadata says HOT but the store has no value.
        let mut meta = FeatureMetadata::new("ghost", StorageTier::Hot);
        meta.last_access_time = now_ms() - 8 * 24 * 60 * 60 * 1000;
        metadata.upsert(&meta).await.unwrap();

        let record = engine.run_hot_to_cold_sweep().await.unwrap();
        assert_eq!(record.fail_count, 1);
        assert_eq!(record.failed_keys, vec!["ghost".to_string()]);

        let meta = metadata.get("ghost").await.unwrap().unwrap();
        assert_eq!(meta.migration_status, MigrationStatus::Failed);
        assert_eq!(meta.storage_tier, StorageTier::Hot);
        assert!(!stores.cold().exists("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn failed_key_is_reclaimed_by_next_sweep() {
        let (engine, metadata, stores) = test_engine().await;
        seed_idle_hot_key(&metadata, &stores, "retry", 8).await;

        // First attempt fails: no value in the source store yet.
        stores.hot().del("retry").await.unwrap();
        let record = engine.run_hot_to_cold_sweep().await.unwrap();
        assert_eq!(record.fail_count, 1);

        // Fault removed; the FAILED row is eligible again.
        stores.hot().set("retry", "payload", None).await.unwrap();
        let record = engine.run_hot_to_cold_sweep().await.unwrap();
        assert_eq!(record.success_count, 1);

        let meta = metadata.get("retry").await.unwrap().unwrap();
        assert_eq!(meta.storage_tier, StorageTier::Cold);
        assert_eq!(meta.migration_status, MigrationStatus::Stable);
        assert_eq!(
            stores.cold().get("retry").await.unwrap(),
            Some("payload".to_string())
        );
    }

    #[tokio::test]
    async fn claim_conflict_skips_key() {
        let (engine, metadata, stores) = test_engine().await;
        seed_idle_hot_key(&metadata, &stores, "claimed", 8).await;

        // Another migrator holds the claim.
        metadata.claim_for_migration("claimed").await.unwrap();

        let err = engine
            .migrate_key("claimed", MigrationType::HotToCold)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // The value is untouched.
        assert!(stores.hot().exists("claimed").await.unwrap());
    }

    #[tokio::test]
    async fn manual_trigger_bypasses_selection() {
        let (engine, metadata, stores) = test_engine().await;

        // Recently accessed: the sweep would not pick this key.
        let mut meta = FeatureMetadata::new("manual", StorageTier::Hot);
        meta.last_access_time = now_ms();
        metadata.upsert(&meta).await.unwrap();
        stores.hot().set("manual", "v", None).await.unwrap();

        let record = engine
            .trigger(MigrationTask {
                task_type: MigrationType::HotToCold,
                keys: vec!["manual".to_string()],
            })
            .await;

        assert_eq!(record.success_count, 1);
        assert!(stores.cold().exists("manual").await.unwrap());
    }

    #[tokio::test]
    async fn migration_carries_remaining_ttl() {
        let (engine, metadata, stores) = test_engine().await;

        let mut meta = FeatureMetadata::new("ttl-key", StorageTier::Hot);
        meta.last_access_time = now_ms() - 8 * 24 * 60 * 60 * 1000;
        metadata.upsert(&meta).await.unwrap();
        stores.hot().set("ttl-key", "v", Some(3600)).await.unwrap();

        engine
            .migrate_key("ttl-key", MigrationType::HotToCold)
            .await
            .unwrap();

        let ttl = stores.cold().ttl("ttl-key").await.unwrap();
        assert!(ttl.is_some());
        assert!(ttl.unwrap() <= 3600);
    }

    #[tokio::test]
    async fn paused_engine_skips_sweeps() {
        let (engine, metadata, stores) = test_engine().await;
        seed_idle_hot_key(&metadata, &stores, "k", 8).await;

        engine.pause();
        assert!(engine.run_hot_to_cold_sweep().await.is_none());
        assert!(stores.hot().exists("k").await.unwrap());

        engine.resume();
        let record = engine.run_hot_to_cold_sweep().await.unwrap();
        assert_eq!(record.success_count, 1);
    }

    #[tokio::test]
    async fn estimate_counts_without_mutating() {
        let (engine, metadata, stores) = test_engine().await;
        seed_idle_hot_key(&metadata, &stores, "a", 8).await;
        seed_idle_hot_key(&metadata, &stores, "b", 9).await;

        let estimate = engine.estimate().await.unwrap();
        assert_eq!(estimate.hot_to_cold_candidates, 2);
        assert_eq!(estimate.cold_to_hot_candidates, 0);

        // Nothing moved.
        assert!(stores.hot().exists("a").await.unwrap());
        assert!(stores.hot().exists("b").await.unwrap());
    }

    #[tokio::test]
    async fn statistics_aggregate_history() {
        let (engine, metadata, stores) = test_engine().await;
        seed_idle_hot_key(&metadata, &stores, "k", 8).await;

        engine.run_hot_to_cold_sweep().await.unwrap();
        engine.run_cold_to_hot_sweep().await.unwrap();

        let stats = engine.statistics().await;
        assert_eq!(stats.total_tasks, 2);
        assert_eq!(stats.completed_tasks, 2);
        assert_eq!(stats.total_keys_migrated, 1);
        assert_eq!(stats.hot_to_cold_tasks, 1);
        assert_eq!(stats.cold_to_hot_tasks, 1);
        assert!(stats.last_task_time.is_some());
    }
}
