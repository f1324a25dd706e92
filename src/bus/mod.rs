//! Key-partitioned event bus.
//!
//! Three topics carry the system's telemetry: query logs, migration events,
//! and cleanup events. Each topic is split into a fixed number of partitions;
//! an event's partition is chosen by hashing its key, so events for one key
//! are always delivered in publish order even when producers run in parallel.
//! Cross-key ordering is not guaranteed.
//!
//! Delivery is at-least-once from the consumer's point of view; publishing is
//! best-effort and never blocks a request path. A full partition drops the
//! event with a warning.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tokio::sync::mpsc;
use tracing::warn;

use crate::types::{CleanupRecord, CleanupType, MigrationRecord, QueryLog, StorageTier};

pub const TOPIC_QUERY_LOGS: &str = "feature-query-logs";
pub const TOPIC_MIGRATION_EVENTS: &str = "migration-events";
pub const TOPIC_CLEANUP_EVENTS: &str = "cleanup-events";

/// Per-key migration outcome or sweep summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum MigrationEvent {
    KeyMigrated {
        key: String,
        source: StorageTier,
        target: StorageTier,
        timestamp_ms: i64,
    },
    KeyFailed {
        key: String,
        source: StorageTier,
        target: StorageTier,
        reason: String,
        timestamp_ms: i64,
    },
    SweepCompleted { record: MigrationRecord },
}

/// Per-key cleanup outcome or sweep summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum CleanupEvent {
    KeyCleaned {
        key: String,
        tier: StorageTier,
        reason: CleanupType,
        timestamp_ms: i64,
    },
    SweepCompleted { record: CleanupRecord },
}

/// One delivered bus record: the partition key plus the serialized payload.
#[derive(Debug, Clone)]
pub struct BusRecord {
    pub topic: &'static str,
    pub key: String,
    pub payload: serde_json::Value,
}

struct Topic {
    senders: Vec<mpsc::Sender<BusRecord>>,
}

/// In-process stand-in for the durable telemetry bus.
pub struct EventBus {
    topics: HashMap<&'static str, Topic>,
    receivers: Mutex<HashMap<&'static str, Vec<mpsc::Receiver<BusRecord>>>>,
    partitions: usize,
}

impl EventBus {
    pub fn new(partitions: usize, buffer_size: usize) -> Self {
        let mut topics = HashMap::new();
        let mut receivers = HashMap::new();

        for topic in [TOPIC_QUERY_LOGS, TOPIC_MIGRATION_EVENTS, TOPIC_CLEANUP_EVENTS] {
            let mut senders = Vec::with_capacity(partitions);
            let mut topic_receivers = Vec::with_capacity(partitions);
            for _ in 0..partitions {
                let (tx, rx) = mpsc::channel(buffer_size);
                senders.push(tx);
                topic_receivers.push(rx);
            }
            topics.insert(topic, Topic { senders });
            receivers.insert(topic, topic_receivers);
        }

        Self {
            topics,
            receivers: Mutex::new(receivers),
            partitions,
        }
    }

    fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.partitions
    }

    fn publish_record(&self, topic: &'static str, key: &str, payload: serde_json::Value) {
        let Some(t) = self.topics.get(topic) else {
            warn!("Unknown bus topic: {}", topic);
            return;
        };
        let partition = self.partition_for(key);
        let record = BusRecord {
            topic,
            key: key.to_string(),
            payload,
        };
        if t.senders[partition].try_send(record).is_err() {
            warn!(
                "Bus partition full, dropping event on {} for key: {}",
                topic, key
            );
        }
    }

    pub fn publish_query_log(&self, log: &QueryLog) {
        match serde_json::to_value(log) {
            Ok(payload) => self.publish_record(TOPIC_QUERY_LOGS, &log.key, payload),
            Err(e) => warn!("Failed to serialize query log: {}", e),
        }
    }

    pub fn publish_migration_event(&self, key: &str, event: &MigrationEvent) {
        match serde_json::to_value(event) {
            Ok(payload) => self.publish_record(TOPIC_MIGRATION_EVENTS, key, payload),
            Err(e) => warn!("Failed to serialize migration event: {}", e),
        }
    }

    pub fn publish_cleanup_event(&self, key: &str, event: &CleanupEvent) {
        match serde_json::to_value(event) {
            Ok(payload) => self.publish_record(TOPIC_CLEANUP_EVENTS, key, payload),
            Err(e) => warn!("Failed to serialize cleanup event: {}", e),
        }
    }

    /// Hand the topic's partition receivers to a consumer. Each topic's
    /// receivers can be taken once.
    pub fn take_receivers(&self, topic: &'static str) -> Option<Vec<mpsc::Receiver<BusRecord>>> {
        self.receivers.lock().remove(topic)
    }
}
