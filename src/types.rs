//! Core domain types shared by all FeatureHub subsystems.
//!
//! The metadata record is the authoritative placement truth for every feature
//! key; the log/record types are the payloads emitted on the event bus.

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Physical tier a feature key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageTier {
    #[serde(rename = "HOT")]
    Hot,
    #[serde(rename = "COLD")]
    Cold,
}

impl StorageTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageTier::Hot => "HOT",
            StorageTier::Cold => "COLD",
        }
    }

    /// The tier a migration in the given direction targets.
    pub fn other(&self) -> StorageTier {
        match self {
            StorageTier::Hot => StorageTier::Cold,
            StorageTier::Cold => StorageTier::Hot,
        }
    }

    pub fn parse(s: &str) -> Option<StorageTier> {
        match s {
            "HOT" => Some(StorageTier::Hot),
            "COLD" => Some(StorageTier::Cold),
            _ => None,
        }
    }
}

impl std::fmt::Display for StorageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a metadata row with respect to migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStatus {
    #[serde(rename = "STABLE")]
    Stable,
    #[serde(rename = "MIGRATING")]
    Migrating,
    #[serde(rename = "FAILED")]
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Stable => "STABLE",
            MigrationStatus::Migrating => "MIGRATING",
            MigrationStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<MigrationStatus> {
        match s {
            "STABLE" => Some(MigrationStatus::Stable),
            "MIGRATING" => Some(MigrationStatus::Migrating),
            "FAILED" => Some(MigrationStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authoritative placement record for one feature key.
///
/// Owned by the metadata subsystem; all writes to it flow through
/// [`crate::metadata::MetadataService`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMetadata {
    pub key_name: String,
    pub storage_tier: StorageTier,
    /// Last read access in ms since epoch, maintained by the async stat path.
    pub last_access_time: i64,
    /// Advisory read counter, reset at statistics-window boundaries.
    pub access_count: i64,
    pub create_time: i64,
    pub update_time: i64,
    /// None means the key never expires.
    pub expire_time: Option<i64>,
    /// Value size in bytes as of the last write.
    pub data_size: i64,
    pub business_tag: Option<String>,
    pub migration_status: MigrationStatus,
    /// Set on every migration status change.
    pub migration_time: Option<i64>,
}

impl FeatureMetadata {
    /// Fresh STABLE record for a key that was just written to `tier`.
    pub fn new(key_name: impl Into<String>, tier: StorageTier) -> Self {
        let now = now_ms();
        Self {
            key_name: key_name.into(),
            storage_tier: tier,
            last_access_time: now,
            access_count: 0,
            create_time: now,
            update_time: now,
            expire_time: None,
            data_size: 0,
            business_tag: None,
            migration_status: MigrationStatus::Stable,
            migration_time: None,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.expire_time, Some(t) if t < now)
    }
}

/// Telemetry record emitted on the bus for every read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLog {
    pub key: String,
    pub timestamp_ms: i64,
    pub source_tier: StorageTier,
    pub client_ip: Option<String>,
    pub user_id: Option<String>,
    pub success: bool,
    pub query_time_ms: u64,
    pub error: Option<String>,
    pub business_tag: Option<String>,
}

/// Direction of a tier migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationType {
    #[serde(rename = "HOT_TO_COLD")]
    HotToCold,
    #[serde(rename = "COLD_TO_HOT")]
    ColdToHot,
}

impl MigrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationType::HotToCold => "HOT_TO_COLD",
            MigrationType::ColdToHot => "COLD_TO_HOT",
        }
    }

    pub fn parse(s: &str) -> Option<MigrationType> {
        match s {
            "HOT_TO_COLD" => Some(MigrationType::HotToCold),
            "COLD_TO_HOT" => Some(MigrationType::ColdToHot),
            _ => None,
        }
    }

    pub fn source(&self) -> StorageTier {
        match self {
            MigrationType::HotToCold => StorageTier::Hot,
            MigrationType::ColdToHot => StorageTier::Cold,
        }
    }

    pub fn target(&self) -> StorageTier {
        self.source().other()
    }
}

/// Status of a background task run (migration sweep or cleanup sweep).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
}

/// Audit entry for one migration task (scheduled sweep or manual trigger).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub task_id: String,
    pub task_type: MigrationType,
    pub status: TaskStatus,
    pub source_tier: StorageTier,
    pub target_tier: StorageTier,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub total: usize,
    pub success_count: usize,
    pub fail_count: usize,
    pub failed_keys: Vec<String>,
    pub error_message: Option<String>,
}

impl MigrationRecord {
    pub fn new(task_type: MigrationType) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            task_type,
            status: TaskStatus::Running,
            source_tier: task_type.source(),
            target_tier: task_type.target(),
            start_time: now_ms(),
            end_time: None,
            total: 0,
            success_count: 0,
            fail_count: 0,
            failed_keys: Vec::new(),
            error_message: None,
        }
    }
}

/// Kind of cleanup sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupType {
    #[serde(rename = "EXPIRED_DATA")]
    Expired,
    #[serde(rename = "ORPHAN_DATA")]
    Orphan,
}

impl CleanupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupType::Expired => "EXPIRED_DATA",
            CleanupType::Orphan => "ORPHAN_DATA",
        }
    }

    pub fn parse(s: &str) -> Option<CleanupType> {
        match s {
            "EXPIRED_DATA" => Some(CleanupType::Expired),
            "ORPHAN_DATA" => Some(CleanupType::Orphan),
            _ => None,
        }
    }
}

/// Audit entry for one cleanup sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupRecord {
    pub task_id: String,
    pub cleanup_type: CleanupType,
    pub status: TaskStatus,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub cleaned_count: usize,
    pub failed_count: usize,
    pub error_message: Option<String>,
}

impl CleanupRecord {
    pub fn new(cleanup_type: CleanupType) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            cleanup_type,
            status: TaskStatus::Running,
            start_time: now_ms(),
            end_time: None,
            cleaned_count: 0,
            failed_count: 0,
            error_message: None,
        }
    }
}

/// Per-key outcome of a read, returned by the router and serialized on the
/// HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureResult {
    pub key: String,
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Tier the lookup was answered from (or attempted against on a miss).
    pub source: StorageTier,
    pub query_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FeatureMetadata>,
}

impl FeatureResult {
    pub fn found(key: impl Into<String>, value: String, source: StorageTier) -> Self {
        Self {
            key: key.into(),
            found: true,
            value: Some(value),
            source,
            query_time_ms: 0,
            error: None,
            metadata: None,
        }
    }

    pub fn not_found(key: impl Into<String>, source: StorageTier) -> Self {
        Self {
            key: key.into(),
            found: false,
            value: None,
            source,
            query_time_ms: 0,
            error: None,
            metadata: None,
        }
    }

    pub fn error(key: impl Into<String>, source: StorageTier, error: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            found: false,
            value: None,
            source,
            query_time_ms: 0,
            error: Some(error.into()),
            metadata: None,
        }
    }
}

/// Aggregate counters for one batch read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySummary {
    pub total: usize,
    pub found: usize,
    pub not_found: usize,
    pub hot_hits: usize,
    pub cold_hits: usize,
    pub total_time_ms: u64,
}

/// Caller-supplied options for a read.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub include_metadata: bool,
    pub timeout_ms: Option<u64>,
    pub client_ip: Option<String>,
    pub user_id: Option<String>,
}

/// Outcome of a router write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutOutcome {
    pub key: String,
    pub storage: StorageTier,
    pub created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_round_trips_through_str() {
        assert_eq!(StorageTier::parse("HOT"), Some(StorageTier::Hot));
        assert_eq!(StorageTier::parse("COLD"), Some(StorageTier::Cold));
        assert_eq!(StorageTier::parse("WARM"), None);
        assert_eq!(StorageTier::Hot.other(), StorageTier::Cold);
        assert_eq!(StorageTier::Cold.other(), StorageTier::Hot);
    }

    #[test]
    fn migration_type_direction() {
        assert_eq!(MigrationType::HotToCold.source(), StorageTier::Hot);
        assert_eq!(MigrationType::HotToCold.target(), StorageTier::Cold);
        assert_eq!(MigrationType::ColdToHot.source(), StorageTier::Cold);
        assert_eq!(MigrationType::ColdToHot.target(), StorageTier::Hot);
    }

    #[test]
    fn metadata_expiry_check() {
        let mut meta = FeatureMetadata::new("k", StorageTier::Hot);
        assert!(!meta.is_expired(now_ms()));

        meta.expire_time = Some(now_ms() - 1);
        assert!(meta.is_expired(now_ms()));

        meta.expire_time = Some(now_ms() + 60_000);
        assert!(!meta.is_expired(now_ms()));
    }

    #[test]
    fn enum_serde_uses_wire_names() {
        assert_eq!(
            serde_json::to_string(&StorageTier::Hot).unwrap(),
            "\"HOT\""
        );
        assert_eq!(
            serde_json::to_string(&MigrationType::HotToCold).unwrap(),
            "\"HOT_TO_COLD\""
        );
        assert_eq!(
            serde_json::to_string(&CleanupType::Orphan).unwrap(),
            "\"ORPHAN_DATA\""
        );
    }
}
