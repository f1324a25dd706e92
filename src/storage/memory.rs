//! In-memory key-value backend.
//!
//! Implements the full [`KvBackend`] contract with per-entry expiry. Expired
//! entries are dropped lazily on access and skipped by scans.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::KvBackend;
use crate::error::Result;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(t) if t <= now)
    }
}

/// Thread-safe in-memory store with TTL support.
pub struct MemoryKv {
    name: &'static str,
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Drop an entry if its expiry has passed; returns true when a live entry
    /// remains.
    fn purge_if_expired(&self, key: &str) -> bool {
        let now = Instant::now();
        let expired = {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) => entry.is_expired(now),
                None => return false,
            }
        };
        if expired {
            self.entries.write().remove(key);
            return false;
        }
        true
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if !self.purge_if_expired(key) {
            return Ok(None);
        }
        Ok(self.entries.read().get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let expires_at = ttl_secs.map(|s| Instant::now() + Duration::from_secs(s));
        self.entries.write().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<HashMap<String, String>> {
        let now = Instant::now();
        let entries = self.entries.read();
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = entries.get(key) {
                if !entry.is_expired(now) {
                    out.insert(key.clone(), entry.value.clone());
                }
            }
        }
        Ok(out)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn del_many(&self, keys: &[String]) -> Result<u64> {
        let mut entries = self.entries.write();
        let mut removed = 0;
        for key in keys {
            if entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.purge_if_expired(key))
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>> {
        if !self.purge_if_expired(key) {
            return Ok(None);
        }
        let now = Instant::now();
        let entries = self.entries.read();
        Ok(entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now).as_secs()))
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        if !self.purge_if_expired(key) {
            return Ok(false);
        }
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn scan(&self, cursor: u64, count: usize) -> Result<(u64, Vec<String>)> {
        let now = Instant::now();
        let entries = self.entries.read();
        let mut keys: Vec<&String> = entries
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k)
            .collect();
        keys.sort();

        let start = cursor as usize;
        if start >= keys.len() {
            return Ok((0, Vec::new()));
        }

        let end = (start + count).min(keys.len());
        let page: Vec<String> = keys[start..end].iter().map(|k| (*k).clone()).collect();
        let next = if end >= keys.len() { 0 } else { end as u64 };
        Ok((next, page))
    }

    async fn key_count(&self) -> Result<u64> {
        let now = Instant::now();
        let entries = self.entries.read();
        Ok(entries.values().filter(|e| !e.is_expired(now)).count() as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
