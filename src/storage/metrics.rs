//! Per-tier access metrics for the physical stores.
//!
//! The router records every data-plane read here; snapshots feed the
//! /metrics endpoint and health reporting.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::types::StorageTier;

/// Outcome of one store read, as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOutcome {
    Hit,
    Miss,
    Error,
}

#[derive(Debug, Default)]
struct TierAccessStats {
    access_count: u64,
    hit_count: u64,
    miss_count: u64,
    error_count: u64,
    // Recent access times for percentile calculation
    access_times_us: Vec<u64>,
}

/// Point-in-time view of one tier's access statistics.
#[derive(Debug, Clone, Serialize)]
pub struct TierAccessSnapshot {
    pub access_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub error_count: u64,
    pub avg_access_time_us: u64,
    pub p95_access_time_us: u64,
    pub p99_access_time_us: u64,
    pub hit_rate_percent: f64,
}

/// Snapshot across both tiers.
#[derive(Debug, Clone, Serialize)]
pub struct StoreMetricsSnapshot {
    pub hot: TierAccessSnapshot,
    pub cold: TierAccessSnapshot,
}

/// Collector for HOT/COLD access statistics.
pub struct StoreMetrics {
    hot: Arc<RwLock<TierAccessStats>>,
    cold: Arc<RwLock<TierAccessStats>>,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self {
            hot: Arc::new(RwLock::new(TierAccessStats::default())),
            cold: Arc::new(RwLock::new(TierAccessStats::default())),
        }
    }

    fn tier_stats(&self, tier: StorageTier) -> &Arc<RwLock<TierAccessStats>> {
        match tier {
            StorageTier::Hot => &self.hot,
            StorageTier::Cold => &self.cold,
        }
    }

    pub async fn record_access(&self, tier: StorageTier, duration_us: u64, outcome: AccessOutcome) {
        let mut stats = self.tier_stats(tier).write().await;
        stats.access_count += 1;
        match outcome {
            AccessOutcome::Hit => stats.hit_count += 1,
            AccessOutcome::Miss => stats.miss_count += 1,
            AccessOutcome::Error => stats.error_count += 1,
        }

        // Keep only the last 1000 samples for percentile calculation
        stats.access_times_us.push(duration_us);
        if stats.access_times_us.len() > 1000 {
            stats.access_times_us.remove(0);
        }
    }

    fn calculate_percentile(sorted_times: &[u64], percentile: f64) -> u64 {
        if sorted_times.is_empty() {
            return 0;
        }
        let index = ((sorted_times.len() as f64 - 1.0) * percentile / 100.0) as usize;
        sorted_times[index]
    }

    async fn tier_snapshot(&self, tier: StorageTier) -> TierAccessSnapshot {
        let stats = self.tier_stats(tier).read().await;

        let mut sorted_times = stats.access_times_us.clone();
        sorted_times.sort_unstable();

        let avg_access_time_us = if !sorted_times.is_empty() {
            sorted_times.iter().sum::<u64>() / sorted_times.len() as u64
        } else {
            0
        };

        let hit_rate_percent = if stats.access_count > 0 {
            stats.hit_count as f64 / stats.access_count as f64 * 100.0
        } else {
            0.0
        };

        TierAccessSnapshot {
            access_count: stats.access_count,
            hit_count: stats.hit_count,
            miss_count: stats.miss_count,
            error_count: stats.error_count,
            avg_access_time_us,
            p95_access_time_us: Self::calculate_percentile(&sorted_times, 95.0),
            p99_access_time_us: Self::calculate_percentile(&sorted_times, 99.0),
            hit_rate_percent,
        }
    }

    pub async fn snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            hot: self.tier_snapshot(StorageTier::Hot).await,
            cold: self.tier_snapshot(StorageTier::Cold).await,
        }
    }
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_hits_misses_and_errors_per_tier() {
        let metrics = StoreMetrics::new();

        metrics
            .record_access(StorageTier::Hot, 100, AccessOutcome::Hit)
            .await;
        metrics
            .record_access(StorageTier::Hot, 200, AccessOutcome::Miss)
            .await;
        metrics
            .record_access(StorageTier::Cold, 900, AccessOutcome::Error)
            .await;

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.hot.access_count, 2);
        assert_eq!(snapshot.hot.hit_count, 1);
        assert_eq!(snapshot.hot.miss_count, 1);
        assert_eq!(snapshot.hot.hit_rate_percent, 50.0);
        assert_eq!(snapshot.cold.access_count, 1);
        assert_eq!(snapshot.cold.error_count, 1);
    }

    #[tokio::test]
    async fn percentiles_come_from_recent_samples() {
        let metrics = StoreMetrics::new();

        for us in [10, 20, 30, 40, 1000] {
            metrics
                .record_access(StorageTier::Hot, us, AccessOutcome::Hit)
                .await;
        }

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.hot.avg_access_time_us, 220);
        assert_eq!(snapshot.hot.p99_access_time_us, 1000);
        assert!(snapshot.hot.p95_access_time_us >= 40);
    }

    #[tokio::test]
    async fn empty_metrics_snapshot_is_zeroed() {
        let metrics = StoreMetrics::new();
        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.hot.access_count, 0);
        assert_eq!(snapshot.hot.avg_access_time_us, 0);
        assert_eq!(snapshot.cold.hit_rate_percent, 0.0);
    }
}
