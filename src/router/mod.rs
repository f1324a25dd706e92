//! Query/write router.
//!
//! Translates feature keys to the right physical backend using metadata,
//! fans batch reads out across both tiers in parallel, and feeds the
//! telemetry surfaces: query logs on the bus, advisory access stats through
//! the bounded updater, and in-process request counters.

mod stats;

pub use stats::StatUpdater;

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::config::RouterConfig;
use crate::error::{Error, Result};
use crate::metadata::MetadataService;
use crate::storage::{AccessOutcome, StoreMetrics, StoreMetricsSnapshot, TieredStores};
use crate::types::{
    now_ms, FeatureMetadata, FeatureResult, MigrationStatus, PutOutcome, QueryLog, QueryOptions,
    QuerySummary, StorageTier,
};

const TIMEOUT_ERROR: &str = "timeout";

/// In-process request counters, mirrored on /health and /metrics.
#[derive(Debug, Default)]
pub struct RouterMetrics {
    total_requests: AtomicU64,
    hot_requests: AtomicU64,
    cold_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterMetricsSnapshot {
    pub total_requests: u64,
    pub hot_requests: u64,
    pub cold_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate_percent: f64,
}

impl RouterMetrics {
    fn snapshot(&self) -> RouterMetricsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let successful = self.successful_requests.load(Ordering::Relaxed);
        let success_rate_percent = if total > 0 {
            successful as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        RouterMetricsSnapshot {
            total_requests: total,
            hot_requests: self.hot_requests.load(Ordering::Relaxed),
            cold_requests: self.cold_requests.load(Ordering::Relaxed),
            successful_requests: successful,
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            success_rate_percent,
        }
    }
}

/// Combined request and per-tier telemetry for the /metrics surface.
#[derive(Debug, Clone, Serialize)]
pub struct RouterTelemetry {
    pub requests: RouterMetricsSnapshot,
    pub tiers: StoreMetricsSnapshot,
}

pub struct QueryRouter {
    metadata: Arc<MetadataService>,
    stores: TieredStores,
    bus: Arc<EventBus>,
    stats: Arc<StatUpdater>,
    metrics: RouterMetrics,
    store_metrics: StoreMetrics,
    config: RouterConfig,
}

impl QueryRouter {
    pub fn new(
        metadata: Arc<MetadataService>,
        stores: TieredStores,
        bus: Arc<EventBus>,
        stats: Arc<StatUpdater>,
        config: RouterConfig,
    ) -> Self {
        Self {
            metadata,
            stores,
            bus,
            stats,
            metrics: RouterMetrics::default(),
            store_metrics: StoreMetrics::new(),
            config,
        }
    }

    fn validate_key(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::validation("key must not be empty"));
        }
        if key.len() > self.config.max_key_length {
            return Err(Error::validation(format!(
                "key length {} exceeds maximum {}",
                key.len(),
                self.config.max_key_length
            )));
        }
        Ok(())
    }

    fn deadline(&self, opts: &QueryOptions) -> Duration {
        Duration::from_millis(
            opts.timeout_ms
                .unwrap_or(self.config.request_timeout_default_ms),
        )
    }

    /// Single-key read. Metadata decides the tier; a key mid-migration is
    /// looked up in its source tier first, then the target, so either stage of
    /// a dual-write copy is tolerated. Metadata outages degrade to HOT-only
    /// access instead of failing the read.
    pub async fn get(&self, key: &str, opts: &QueryOptions) -> Result<FeatureResult> {
        self.validate_key(key)?;
        let start = Instant::now();
        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);

        // The deadline covers metadata resolution and the data read alike.
        let resolved = timeout(self.deadline(opts), async {
            let meta = match self.metadata.get(key).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(
                        "Metadata lookup failed for key: {}, falling back to HOT: {}",
                        key, e
                    );
                    None
                }
            };
            let result = self.read_routed(key, meta.as_ref()).await;
            (meta, result)
        })
        .await;

        let (meta, mut result) = match resolved {
            Ok(pair) => pair,
            Err(_) => (None, FeatureResult::error(key, StorageTier::Hot, TIMEOUT_ERROR)),
        };
        result.query_time_ms = start.elapsed().as_millis() as u64;

        if result.found {
            self.metrics
                .successful_requests
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.failed_requests.fetch_add(1, Ordering::Relaxed);
        }

        self.emit_query_log(&result, meta.as_ref(), opts);
        self.stats.enqueue(key.to_string());

        if opts.include_metadata {
            result.metadata = meta;
        }
        Ok(result)
    }

    async fn read_routed(&self, key: &str, meta: Option<&FeatureMetadata>) -> FeatureResult {
        match meta {
            // No metadata: default to the HOT tier.
            None => self.read_tier(key, StorageTier::Hot).await,
            Some(m) if m.migration_status == MigrationStatus::Migrating => {
                self.read_dual(key, m.storage_tier).await
            }
            Some(m) => {
                let result = self.read_tier(key, m.storage_tier).await;
                if result.found || result.error.is_some() {
                    return result;
                }
                // A miss on the recorded tier can mean a migration completed
                // between metadata resolution and the store read. Re-resolve
                // against the authoritative store before reporting NotFound.
                match self.recheck_on_miss(key, m.storage_tier).await {
                    Some(found) => found,
                    None => result,
                }
            }
        }
    }

    /// Source tier first, then target, tolerating either stage of a
    /// dual-write migration.
    async fn read_dual(&self, key: &str, source: StorageTier) -> FeatureResult {
        let first = self.read_tier(key, source).await;
        if first.found {
            return first;
        }
        debug!(
            "Key {} mid-migration missed {}, trying {}",
            key,
            source,
            source.other()
        );
        self.read_tier(key, source.other()).await
    }

    /// After a miss under STABLE metadata, consult the authoritative store
    /// once: if the key moved or is now migrating, chase the fresh placement.
    async fn recheck_on_miss(&self, key: &str, observed_tier: StorageTier) -> Option<FeatureResult> {
        let fresh = match self.metadata.get_authoritative(key).await {
            Ok(Some(fresh)) => fresh,
            _ => return None,
        };

        if fresh.migration_status == MigrationStatus::Migrating {
            let result = self.read_dual(key, fresh.storage_tier).await;
            return result.found.then_some(result);
        }
        if fresh.storage_tier != observed_tier {
            let result = self.read_tier(key, fresh.storage_tier).await;
            return result.found.then_some(result);
        }
        None
    }

    async fn read_tier(&self, key: &str, tier: StorageTier) -> FeatureResult {
        match tier {
            StorageTier::Hot => self.metrics.hot_requests.fetch_add(1, Ordering::Relaxed),
            StorageTier::Cold => self.metrics.cold_requests.fetch_add(1, Ordering::Relaxed),
        };

        let start = Instant::now();
        let read = self.stores.tier(tier).get(key).await;
        let duration_us = start.elapsed().as_micros() as u64;

        let (outcome, result) = match read {
            Ok(Some(value)) => (AccessOutcome::Hit, FeatureResult::found(key, value, tier)),
            Ok(None) => (AccessOutcome::Miss, FeatureResult::not_found(key, tier)),
            Err(e) => {
                warn!("Error querying {} for key: {}: {}", tier, key, e);
                (
                    AccessOutcome::Error,
                    FeatureResult::error(key, tier, e.to_string()),
                )
            }
        };
        self.store_metrics
            .record_access(tier, duration_us, outcome)
            .await;
        result
    }

    /// Batch read: one metadata resolution, one multi-get per tier issued
    /// concurrently, results merged back into input order. One key's failure
    /// never fails the batch.
    pub async fn batch_get(
        &self,
        keys: &[String],
        opts: &QueryOptions,
    ) -> Result<(Vec<FeatureResult>, QuerySummary)> {
        if keys.len() > self.config.max_batch_size {
            return Err(Error::validation(format!(
                "batch size {} exceeds maximum {}",
                keys.len(),
                self.config.max_batch_size
            )));
        }
        for key in keys {
            self.validate_key(key)?;
        }

        let start = Instant::now();
        self.metrics
            .total_requests
            .fetch_add(keys.len() as u64, Ordering::Relaxed);

        if keys.is_empty() {
            return Ok((
                Vec::new(),
                QuerySummary {
                    total: 0,
                    found: 0,
                    not_found: 0,
                    hot_hits: 0,
                    cold_hits: 0,
                    total_time_ms: 0,
                },
            ));
        }

        // Metadata resolution and both multi-gets share one deadline.
        let resolved = timeout(self.deadline(opts), async {
            let metadata_map = match self.metadata.batch_get(keys).await {
                Ok(map) => map,
                Err(e) => {
                    warn!("Batch metadata lookup failed, defaulting all keys to HOT: {}", e);
                    HashMap::new()
                }
            };
            let results = self.batch_read(keys, &metadata_map).await;
            (metadata_map, results)
        })
        .await;

        let (metadata_map, results) = match resolved {
            Ok(pair) => pair,
            Err(_) => (
                HashMap::new(),
                keys.iter()
                    .map(|key| FeatureResult::error(key, StorageTier::Hot, TIMEOUT_ERROR))
                    .collect(),
            ),
        };

        let mut found = 0;
        let mut not_found = 0;
        let mut hot_hits = 0;
        let mut cold_hits = 0;
        for result in &results {
            if result.found {
                found += 1;
                match result.source {
                    StorageTier::Hot => hot_hits += 1,
                    StorageTier::Cold => cold_hits += 1,
                }
            } else {
                not_found += 1;
            }
            self.emit_query_log(result, metadata_map.get(&result.key), opts);
        }

        self.metrics
            .successful_requests
            .fetch_add(found as u64, Ordering::Relaxed);
        self.metrics
            .failed_requests
            .fetch_add(not_found as u64, Ordering::Relaxed);

        // Bulk stat update for the distinct keys in the batch.
        let mut unique: Vec<String> = keys.to_vec();
        unique.sort();
        unique.dedup();
        self.stats.enqueue_all(unique);

        let mut results = results;
        if opts.include_metadata {
            for result in &mut results {
                result.metadata = metadata_map.get(&result.key).cloned();
            }
        }

        let summary = QuerySummary {
            total: keys.len(),
            found,
            not_found,
            hot_hits,
            cold_hits,
            total_time_ms: start.elapsed().as_millis() as u64,
        };
        Ok((results, summary))
    }

    async fn batch_read(
        &self,
        keys: &[String],
        metadata_map: &HashMap<String, FeatureMetadata>,
    ) -> Vec<FeatureResult> {
        // Partition distinct keys by recorded tier; unknown keys default HOT.
        let mut hot_group: Vec<String> = Vec::new();
        let mut cold_group: Vec<String> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for key in keys {
            if !seen.insert(key.as_str()) {
                continue;
            }
            let tier = metadata_map
                .get(key)
                .map(|m| m.storage_tier)
                .unwrap_or(StorageTier::Hot);
            match tier {
                StorageTier::Hot => hot_group.push(key.clone()),
                StorageTier::Cold => cold_group.push(key.clone()),
            }
        }

        if !hot_group.is_empty() {
            self.metrics.hot_requests.fetch_add(1, Ordering::Relaxed);
        }
        if !cold_group.is_empty() {
            self.metrics.cold_requests.fetch_add(1, Ordering::Relaxed);
        }

        let hot_read = async {
            let start = Instant::now();
            let values = self.stores.hot().mget(&hot_group).await;
            (start.elapsed().as_micros() as u64, values)
        };
        let cold_read = async {
            let start = Instant::now();
            let values = self.stores.cold().mget(&cold_group).await;
            (start.elapsed().as_micros() as u64, values)
        };
        let ((hot_us, hot_values), (cold_us, cold_values)) = tokio::join!(hot_read, cold_read);

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let meta = metadata_map.get(key);
            let tier = meta.map(|m| m.storage_tier).unwrap_or(StorageTier::Hot);
            let (group, group_us) = match tier {
                StorageTier::Hot => (&hot_values, hot_us),
                StorageTier::Cold => (&cold_values, cold_us),
            };

            let (outcome, result) = match group {
                Ok(values) => match values.get(key) {
                    Some(value) => (
                        AccessOutcome::Hit,
                        FeatureResult::found(key, value.clone(), tier),
                    ),
                    None => {
                        // Dual-tier fallback for keys caught mid-migration; a
                        // miss under STABLE metadata gets one authoritative
                        // re-check in case a migration just completed.
                        let result = match meta {
                            Some(m) if m.migration_status == MigrationStatus::Migrating => {
                                self.read_tier(key, tier.other()).await
                            }
                            Some(_) => self
                                .recheck_on_miss(key, tier)
                                .await
                                .unwrap_or_else(|| FeatureResult::not_found(key, tier)),
                            None => FeatureResult::not_found(key, tier),
                        };
                        (AccessOutcome::Miss, result)
                    }
                },
                Err(e) => (
                    AccessOutcome::Error,
                    FeatureResult::error(key, tier, e.to_string()),
                ),
            };
            self.store_metrics
                .record_access(tier, group_us, outcome)
                .await;
            out.push(result);
        }
        out
    }

    /// Write a feature value.
    ///
    /// The storage hint picks the tier only when the write creates the key; an
    /// existing record keeps its recorded tier. If the upsert reveals the key
    /// previously lived STABLE in the other tier, the stale copy is removed.
    pub async fn put(
        &self,
        key: &str,
        value: &str,
        ttl_secs: Option<u64>,
        hint: Option<StorageTier>,
    ) -> Result<PutOutcome> {
        self.validate_key(key)?;

        let deadline = Duration::from_millis(self.config.request_timeout_default_ms);
        timeout(deadline, self.put_inner(key, value, ttl_secs, hint))
            .await
            .map_err(|_| Error::Timeout(self.config.request_timeout_default_ms))?
    }

    async fn put_inner(
        &self,
        key: &str,
        value: &str,
        ttl_secs: Option<u64>,
        hint: Option<StorageTier>,
    ) -> Result<PutOutcome> {
        let existing = self.metadata.get(key).await?;
        let target = existing
            .as_ref()
            .map(|m| m.storage_tier)
            .unwrap_or_else(|| hint.unwrap_or(StorageTier::Hot));

        self.stores.tier(target).set(key, value, ttl_secs).await?;

        let now = now_ms();
        let record = match existing {
            Some(mut m) => {
                m.storage_tier = target;
                m.data_size = value.len() as i64;
                m.update_time = now;
                m.expire_time = ttl_secs.map(|ttl| now + ttl as i64 * 1000);
                m
            }
            None => {
                let mut m = FeatureMetadata::new(key, target);
                m.data_size = value.len() as i64;
                m.expire_time = ttl_secs.map(|ttl| now + ttl as i64 * 1000);
                m
            }
        };

        let outcome = self.metadata.upsert(&record).await?;

        // A record that pointed at the other tier while STABLE leaves a stale
        // copy there; remove it.
        if let (Some(prev_tier), Some(MigrationStatus::Stable)) =
            (outcome.previous_tier, outcome.previous_status)
        {
            if prev_tier != target {
                if let Err(e) = self.stores.tier(prev_tier).del(key).await {
                    warn!("Failed to delete stale {} copy of key: {}: {}", prev_tier, key, e);
                }
            }
        }

        Ok(PutOutcome {
            key: key.to_string(),
            storage: target,
            created: outcome.created,
            ttl: ttl_secs,
        })
    }

    fn emit_query_log(
        &self,
        result: &FeatureResult,
        meta: Option<&FeatureMetadata>,
        opts: &QueryOptions,
    ) {
        let log = QueryLog {
            key: result.key.clone(),
            timestamp_ms: now_ms(),
            source_tier: result.source,
            client_ip: opts.client_ip.clone(),
            user_id: opts.user_id.clone(),
            success: result.found,
            query_time_ms: result.query_time_ms,
            error: result.error.clone(),
            business_tag: meta.and_then(|m| m.business_tag.clone()),
        };
        self.bus.publish_query_log(&log);
    }

    pub fn metrics_snapshot(&self) -> RouterMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn telemetry(&self) -> RouterTelemetry {
        RouterTelemetry {
            requests: self.metrics.snapshot(),
            tiers: self.store_metrics.snapshot().await,
        }
    }

    pub async fn health(&self) -> serde_json::Value {
        let hot = self.stores.hot().ping().await.is_ok();
        let cold = self.stores.cold().ping().await.is_ok();
        let metadata = self.metadata.ping().await.is_ok();

        let status = if hot && cold && metadata {
            "healthy"
        } else {
            "degraded"
        };

        serde_json::json!({
            "status": status,
            "timestamp": now_ms(),
            "dependencies": {
                "hot": if hot { "healthy" } else { "unhealthy" },
                "cold": if cold { "healthy" } else { "unhealthy" },
                "metadata": if metadata { "healthy" } else { "unhealthy" },
            },
            "metrics": self.metrics.snapshot(),
            "tiers": self.store_metrics.snapshot().await,
        })
    }
}
