//! Authoritative metadata store on SQLite.
//!
//! Every placement fact lives here; the cache in front of it is never
//! authoritative. The store provides the atomic operations the rest of the
//! system leans on: compare-and-swap on `migration_status` (the only per-key
//! migration lock) and in-place `access_count` increments.

use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

use crate::error::{Error, Result};
use crate::types::{FeatureMetadata, MigrationStatus, StorageTier};

/// Result of an upsert: whether the row was created, and where the key lived
/// before when it was updated.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub created: bool,
    pub previous_tier: Option<StorageTier>,
    pub previous_status: Option<MigrationStatus>,
}

/// Aggregate statistics for one tier or one business tag.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlacementStats {
    pub key_count: i64,
    pub total_data_size: i64,
    pub avg_access_count: f64,
    pub latest_access_time: Option<i64>,
}

pub struct MetadataStore {
    pool: Pool<Sqlite>,
}

impl MetadataStore {
    /// Open (or create) the metadata database and initialize the schema.
    pub async fn connect(db_path: &str, pool_size: u32, acquire_timeout_secs: u64) -> Result<Self> {
        info!(
            "Initializing metadata store at: {} with pool size: {}",
            db_path, pool_size
        );

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(Duration::from_secs(acquire_timeout_secs))
            .connect(&format!("sqlite:{}?mode=rwc", db_path))
            .await
            .map_err(|e| Error::backend(format!("connect metadata store: {e}")))?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feature_metadata (
                key_name TEXT PRIMARY KEY,
                storage_tier TEXT NOT NULL,
                last_access_time INTEGER NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0,
                create_time INTEGER NOT NULL,
                update_time INTEGER NOT NULL,
                expire_time INTEGER,
                data_size INTEGER NOT NULL DEFAULT 0,
                business_tag TEXT,
                migration_status TEXT NOT NULL DEFAULT 'STABLE',
                migration_time INTEGER
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes cover the migration-candidate and expiry selections.
        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_meta_tier_status_access \
             ON feature_metadata(storage_tier, migration_status, last_access_time);",
            "CREATE INDEX IF NOT EXISTS idx_meta_expire ON feature_metadata(expire_time);",
            "CREATE INDEX IF NOT EXISTS idx_meta_tag ON feature_metadata(business_tag);",
        ];
        for index_sql in indexes {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }

        info!("Metadata schema initialized with indexes");
        Ok(())
    }

    fn row_to_metadata(row: &SqliteRow) -> Result<FeatureMetadata> {
        let tier_str: String = row.try_get("storage_tier").map_err(Error::from)?;
        let status_str: String = row.try_get("migration_status").map_err(Error::from)?;

        let storage_tier = StorageTier::parse(&tier_str)
            .ok_or_else(|| Error::internal(format!("unknown storage tier in row: {tier_str}")))?;
        let migration_status = MigrationStatus::parse(&status_str).ok_or_else(|| {
            Error::internal(format!("unknown migration status in row: {status_str}"))
        })?;

        Ok(FeatureMetadata {
            key_name: row.try_get("key_name").map_err(Error::from)?,
            storage_tier,
            last_access_time: row.try_get("last_access_time").map_err(Error::from)?,
            access_count: row.try_get("access_count").map_err(Error::from)?,
            create_time: row.try_get("create_time").map_err(Error::from)?,
            update_time: row.try_get("update_time").map_err(Error::from)?,
            expire_time: row.try_get("expire_time").map_err(Error::from)?,
            data_size: row.try_get("data_size").map_err(Error::from)?,
            business_tag: row.try_get("business_tag").map_err(Error::from)?,
            migration_status,
            migration_time: row.try_get("migration_time").map_err(Error::from)?,
        })
    }

    pub async fn get(&self, key: &str) -> Result<Option<FeatureMetadata>> {
        let row = sqlx::query("SELECT * FROM feature_metadata WHERE key_name = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(Self::row_to_metadata(r)?)),
            None => Ok(None),
        }
    }

    /// Fetch rows for the given keys in one IN-list query.
    pub async fn batch_get(&self, keys: &[String]) -> Result<Vec<FeatureMetadata>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql =
            format!("SELECT * FROM feature_metadata WHERE key_name IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for key in keys {
            query = query.bind(key);
        }

        let rows = query.fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(Self::row_to_metadata(row)?);
        }
        Ok(out)
    }

    /// Insert or update the row for `record.key_name`.
    ///
    /// On update, `create_time` is preserved and the prior placement is
    /// reported so callers can clean up a stale copy in the other tier.
    pub async fn upsert(&self, record: &FeatureMetadata) -> Result<UpsertOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::backend(format!("begin upsert tx: {e}")))?;

        let existing = sqlx::query(
            "SELECT storage_tier, migration_status, create_time FROM feature_metadata \
             WHERE key_name = ?",
        )
        .bind(&record.key_name)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO feature_metadata (
                        key_name, storage_tier, last_access_time, access_count,
                        create_time, update_time, expire_time, data_size,
                        business_tag, migration_status, migration_time
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&record.key_name)
                .bind(record.storage_tier.as_str())
                .bind(record.last_access_time)
                .bind(record.access_count)
                .bind(record.create_time)
                .bind(record.update_time)
                .bind(record.expire_time)
                .bind(record.data_size)
                .bind(&record.business_tag)
                .bind(record.migration_status.as_str())
                .bind(record.migration_time)
                .execute(&mut *tx)
                .await?;

                UpsertOutcome {
                    created: true,
                    previous_tier: None,
                    previous_status: None,
                }
            }
            Some(row) => {
                let prev_tier: String = row.try_get("storage_tier").map_err(Error::from)?;
                let prev_status: String =
                    row.try_get("migration_status").map_err(Error::from)?;

                sqlx::query(
                    r#"
                    UPDATE feature_metadata SET
                        storage_tier = ?, last_access_time = ?, access_count = ?,
                        update_time = ?, expire_time = ?, data_size = ?,
                        business_tag = ?, migration_status = ?, migration_time = ?
                    WHERE key_name = ?
                    "#,
                )
                .bind(record.storage_tier.as_str())
                .bind(record.last_access_time)
                .bind(record.access_count)
                .bind(record.update_time)
                .bind(record.expire_time)
                .bind(record.data_size)
                .bind(&record.business_tag)
                .bind(record.migration_status.as_str())
                .bind(record.migration_time)
                .bind(&record.key_name)
                .execute(&mut *tx)
                .await?;

                UpsertOutcome {
                    created: false,
                    previous_tier: StorageTier::parse(&prev_tier),
                    previous_status: MigrationStatus::parse(&prev_status),
                }
            }
        };

        tx.commit()
            .await
            .map_err(|e| Error::backend(format!("commit upsert tx: {e}")))?;
        Ok(outcome)
    }

    /// Full-row update; returns false when the key does not exist.
    pub async fn update(&self, record: &FeatureMetadata) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE feature_metadata SET
                storage_tier = ?, last_access_time = ?, access_count = ?,
                update_time = ?, expire_time = ?, data_size = ?,
                business_tag = ?, migration_status = ?, migration_time = ?
            WHERE key_name = ?
            "#,
        )
        .bind(record.storage_tier.as_str())
        .bind(record.last_access_time)
        .bind(record.access_count)
        .bind(record.update_time)
        .bind(record.expire_time)
        .bind(record.data_size)
        .bind(&record.business_tag)
        .bind(record.migration_status.as_str())
        .bind(record.migration_time)
        .bind(&record.key_name)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM feature_metadata WHERE key_name = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete the rows for the given keys in one IN-list statement.
    pub async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = format!("DELETE FROM feature_metadata WHERE key_name IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for key in keys {
            query = query.bind(key);
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Atomic access-stat bump. Concurrent increments never corrupt other
    /// fields; lost updates across reset boundaries are tolerated.
    pub async fn record_access(&self, key: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE feature_metadata SET access_count = access_count + 1, \
             last_access_time = ?, update_time = ? WHERE key_name = ?",
        )
        .bind(now)
        .bind(now)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Compare-and-swap claim: {STABLE, FAILED} -> MIGRATING.
    ///
    /// Returns true only for the single caller that observed an eligible
    /// prior status; everyone else loses the claim.
    pub async fn claim_for_migration(&self, key: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE feature_metadata SET migration_status = 'MIGRATING', \
             migration_time = ?, update_time = ? \
             WHERE key_name = ? AND migration_status IN ('STABLE', 'FAILED')",
        )
        .bind(now)
        .bind(now)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// MIGRATING -> FAILED for the claiming migrator.
    pub async fn mark_migration_failed(&self, key: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE feature_metadata SET migration_status = 'FAILED', \
             migration_time = ?, update_time = ? \
             WHERE key_name = ? AND migration_status = 'MIGRATING'",
        )
        .bind(now)
        .bind(now)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// MIGRATING -> STABLE in the new tier, completing the protocol.
    pub async fn finalize_migration(
        &self,
        key: &str,
        new_tier: StorageTier,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE feature_metadata SET storage_tier = ?, migration_status = 'STABLE', \
             migration_time = ?, update_time = ? \
             WHERE key_name = ? AND migration_status = 'MIGRATING'",
        )
        .bind(new_tier.as_str())
        .bind(now)
        .bind(now)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// HOT rows idle past the threshold, coldest first.
    pub async fn select_for_hot_to_cold(
        &self,
        now: i64,
        idle_threshold_ms: i64,
        limit: usize,
    ) -> Result<Vec<FeatureMetadata>> {
        let cutoff = now - idle_threshold_ms;
        let rows = sqlx::query(
            "SELECT * FROM feature_metadata \
             WHERE storage_tier = 'HOT' AND migration_status = 'STABLE' \
               AND last_access_time < ? \
             ORDER BY last_access_time ASC LIMIT ?",
        )
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(Self::row_to_metadata(row)?);
        }
        Ok(out)
    }

    /// COLD rows with recent, frequent access, hottest first.
    pub async fn select_for_cold_to_hot(
        &self,
        access_count_threshold: i64,
        recent_access_since: i64,
        limit: usize,
    ) -> Result<Vec<FeatureMetadata>> {
        let rows = sqlx::query(
            "SELECT * FROM feature_metadata \
             WHERE storage_tier = 'COLD' AND migration_status = 'STABLE' \
               AND access_count >= ? AND last_access_time >= ? \
             ORDER BY access_count DESC, last_access_time DESC LIMIT ?",
        )
        .bind(access_count_threshold)
        .bind(recent_access_since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(Self::row_to_metadata(row)?);
        }
        Ok(out)
    }

    pub async fn select_expired(&self, now: i64, limit: usize) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT key_name FROM feature_metadata \
             WHERE expire_time IS NOT NULL AND expire_time < ? \
             ORDER BY expire_time ASC LIMIT ?",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in &rows {
            keys.push(row.try_get("key_name").map_err(Error::from)?);
        }
        Ok(keys)
    }

    pub async fn delete_expired(&self, now: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM feature_metadata WHERE expire_time IS NOT NULL AND expire_time < ?",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_by_tier(&self) -> Result<HashMap<StorageTier, i64>> {
        let rows = sqlx::query(
            "SELECT storage_tier, COUNT(*) as cnt FROM feature_metadata GROUP BY storage_tier",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::new();
        for row in &rows {
            let tier_str: String = row.try_get("storage_tier").map_err(Error::from)?;
            let count: i64 = row.try_get("cnt").map_err(Error::from)?;
            if let Some(tier) = StorageTier::parse(&tier_str) {
                out.insert(tier, count);
            }
        }
        Ok(out)
    }

    pub async fn stats_by_tier(&self, tier: StorageTier) -> Result<PlacementStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) as cnt, COALESCE(SUM(data_size), 0) as total_size, \
             COALESCE(AVG(access_count), 0.0) as avg_access, MAX(last_access_time) as latest \
             FROM feature_metadata WHERE storage_tier = ?",
        )
        .bind(tier.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(PlacementStats {
            key_count: row.try_get("cnt").map_err(Error::from)?,
            total_data_size: row.try_get("total_size").map_err(Error::from)?,
            avg_access_count: row.try_get("avg_access").map_err(Error::from)?,
            latest_access_time: row.try_get("latest").map_err(Error::from)?,
        })
    }

    pub async fn stats_by_tag(&self, tag: &str) -> Result<PlacementStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) as cnt, COALESCE(SUM(data_size), 0) as total_size, \
             COALESCE(AVG(access_count), 0.0) as avg_access, MAX(last_access_time) as latest \
             FROM feature_metadata WHERE business_tag = ?",
        )
        .bind(tag)
        .fetch_one(&self.pool)
        .await?;

        Ok(PlacementStats {
            key_count: row.try_get("cnt").map_err(Error::from)?,
            total_data_size: row.try_get("total_size").map_err(Error::from)?,
            avg_access_count: row.try_get("avg_access").map_err(Error::from)?,
            latest_access_time: row.try_get("latest").map_err(Error::from)?,
        })
    }

    pub async fn count_active_since(&self, since: i64) -> Result<i64> {
        let row =
            sqlx::query("SELECT COUNT(*) as cnt FROM feature_metadata WHERE last_access_time >= ?")
                .bind(since)
                .fetch_one(&self.pool)
                .await?;
        row.try_get("cnt").map_err(Error::from)
    }

    pub async fn total_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM feature_metadata")
            .fetch_one(&self.pool)
            .await?;
        row.try_get("cnt").map_err(Error::from)
    }

    /// Statistics-window boundary: zero every access counter.
    pub async fn reset_access_counts(&self, now: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE feature_metadata SET access_count = 0, update_time = ? \
             WHERE access_count > 0",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}
