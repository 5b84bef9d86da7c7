//! Bounded in-process store with oldest-write eviction and lazy TTL expiry.

use super::backend::StorageBackend;
use super::entry::{now_millis, CacheEntry};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use lru::LruCache;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Process-local store holding at most `max_size` entries.
///
/// The table keeps write order (writes move a key to the front, reads use
/// `peek` and never do). When an insert pushes the table past `max_size`,
/// exactly one entry is evicted: the one with the smallest `timestamp`,
/// ties going to the least recently written key.
pub struct MemoryStore {
    entries: Mutex<LruCache<String, CacheEntry>>,
    max_size: usize,
}

impl MemoryStore {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            max_size: max_size.max(1),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LruCache<String, CacheEntry>>> {
        self.entries.lock().map_err(|_| {
            Error::storage_with_context(
                "memory store lock poisoned",
                ErrorContext::new().with_source("memory_store"),
            )
        })
    }

    fn evict_one(entries: &mut LruCache<String, CacheEntry>) {
        let victim = entries
            .iter()
            .rev()
            .min_by_key(|(_, e)| e.timestamp)
            .map(|(k, _)| k.clone());
        if let Some(k) = victim {
            entries.pop(&k);
            debug!(key = %k, "evicted oldest cache entry");
        }
    }

    /// Returns the live entry under `key`, dropping it first if it has expired.
    fn live_entry<'a>(
        entries: &'a mut LruCache<String, CacheEntry>,
        key: &str,
    ) -> Option<&'a CacheEntry> {
        let expired = entries.peek(key)?.is_expired_at(now_millis());
        if expired {
            entries.pop(key);
            debug!(key, "expired cache entry removed on read");
            return None;
        }
        entries.peek(key)
    }
}

#[async_trait]
impl StorageBackend for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut entries = self.lock()?;
        Ok(Self::live_entry(&mut entries, key).cloned())
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()> {
        let mut entries = self.lock()?;
        entries.put(key.to_string(), entry);
        if entries.len() > self.max_size {
            Self::evict_one(&mut entries);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.lock()?.pop(key).is_some())
    }

    async fn clear(&self) -> Result<()> {
        self.lock()?.clear();
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        let mut entries = self.lock()?;
        Ok(Self::live_entry(&mut entries, key).is_some())
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.iter().map(|(k, _)| k.clone()).collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
