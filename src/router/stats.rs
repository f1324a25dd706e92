//! Bounded async access-stat updates.
//!
//! Reads enqueue the touched key here and move on; a background worker drains
//! the queue and bumps `access_count`/`last_access_time` in metadata. The
//! queue is bounded with drop-oldest overflow, so a traffic spike sheds stat
//! updates instead of growing memory. Stats are advisory; dropped updates are
//! counted but otherwise ignored.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::metadata::MetadataService;

pub struct StatUpdater {
    metadata: Arc<MetadataService>,
    queue: Mutex<VecDeque<String>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl StatUpdater {
    pub fn new(metadata: Arc<MetadataService>, capacity: usize) -> Self {
        Self {
            metadata,
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1_024))),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue one key for a stat bump. Oldest entries are shed on overflow.
    pub fn enqueue(&self, key: String) {
        {
            let mut queue = self.queue.lock();
            queue.push_back(key);
            while queue.len() > self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.notify.notify_one();
    }

    pub fn enqueue_all<I: IntoIterator<Item = String>>(&self, keys: I) {
        {
            let mut queue = self.queue.lock();
            for key in keys {
                queue.push_back(key);
            }
            while queue.len() > self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.notify.notify_one();
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    fn drain_batch(&self, max: usize) -> Vec<String> {
        let mut queue = self.queue.lock();
        let n = queue.len().min(max);
        queue.drain(..n).collect()
    }

    /// Apply every queued update now. The worker uses this internally; tests
    /// call it directly for deterministic assertions.
    pub async fn flush(&self) {
        loop {
            let batch = self.drain_batch(256);
            if batch.is_empty() {
                return;
            }
            for key in batch {
                if let Err(e) = self.metadata.record_access(&key).await {
                    warn!("Failed to update access stats for key: {}: {}", key, e);
                }
            }
        }
    }

    /// Start the background drain loop.
    pub fn spawn_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let updater = Arc::clone(self);
        tokio::spawn(async move {
            debug!("Stat updater worker started");
            loop {
                updater.notify.notified().await;
                updater.flush().await;
            }
        })
    }
}
