//! In-process cache backend: LRU capacity plus per-entry TTL.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use glob::{MatchOptions, Pattern};
use lru::LruCache;

use crate::application::backends::{BackendError, CacheBackend};
use crate::cache::lock::mutex_lock;

const SOURCE: &str = "infra::memory_cache";

const KEY_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Last write wins; expired entries are dropped lazily on access.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, Entry>>,
}

impl MemoryCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Number of entries, including expired ones not yet reclaimed.
    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        let entries = mutex_lock(&self.entries, SOURCE, "contains");
        entries
            .peek(key)
            .is_some_and(|entry| !entry.is_expired(Instant::now()))
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError> {
        let mut entries = mutex_lock(&self.entries, SOURCE, "get");
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.pop(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        mutex_lock(&self.entries, SOURCE, "set").put(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<usize, BackendError> {
        let compiled = Pattern::new(pattern).map_err(|err| BackendError::InvalidPattern {
            pattern: pattern.to_string(),
            message: err.to_string(),
        })?;

        let mut entries = mutex_lock(&self.entries, SOURCE, "delete_matching");
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(key, _)| compiled.matches_with(key, KEY_MATCH))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        Ok(doomed.len())
    }
}
