//! Resolution strategies, one per storage tier.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::application::backends::{BackendError, CacheBackend, StorageBackend};
use crate::domain::{Fingerprint, Tier};

/// Hot-cache key prefix for template sources.
pub const SOURCE_KEY_PREFIX: &str = "tpl:";

/// What a single tier knows about a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierLookup {
    Found {
        content: Bytes,
        fingerprint: Fingerprint,
    },
    /// Fingerprint only; the bytes must come from a slower tier.
    Marker(Fingerprint),
    Miss,
}

#[async_trait]
pub trait TierStrategy: Send + Sync {
    fn tier(&self) -> Tier;

    /// Backend label for logs.
    fn label(&self) -> &'static str;

    async fn lookup(&self, path: &str) -> Result<TierLookup, BackendError>;

    async fn fingerprint(&self, path: &str) -> Result<Option<Fingerprint>, BackendError>;

    /// Populate this tier with bytes read from a slower one.
    async fn fill(
        &self,
        path: &str,
        content: &Bytes,
        fingerprint: &Fingerprint,
    ) -> Result<(), BackendError>;

    /// Drop whatever this tier holds for `path`. Durable tiers keep their data.
    async fn evict(&self, _path: &str) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Hot-cache entry. `content` is absent for fingerprint-only markers.
#[derive(Debug, Serialize, Deserialize)]
pub struct CachedSource {
    pub fingerprint: Fingerprint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl CachedSource {
    pub fn encode(&self) -> Result<Bytes, BackendError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(BackendError::codec)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, BackendError> {
        serde_json::from_slice(raw).map_err(BackendError::codec)
    }
}

/// Key-value cache tier.
pub struct CacheTier {
    backend: Arc<dyn CacheBackend>,
    ttl: Option<Duration>,
    inline_limit: usize,
}

impl CacheTier {
    /// Sources larger than `inline_limit` bytes are cached as markers only.
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Option<Duration>, inline_limit: usize) -> Self {
        Self {
            backend,
            ttl,
            inline_limit,
        }
    }

    fn key(path: &str) -> String {
        format!("{SOURCE_KEY_PREFIX}{path}")
    }

    async fn entry(&self, path: &str) -> Result<Option<CachedSource>, BackendError> {
        match self.backend.get(&Self::key(path)).await? {
            Some(raw) => CachedSource::decode(&raw).map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl TierStrategy for CacheTier {
    fn tier(&self) -> Tier {
        Tier::Cache
    }

    fn label(&self) -> &'static str {
        "cache"
    }

    async fn lookup(&self, path: &str) -> Result<TierLookup, BackendError> {
        let Some(entry) = self.entry(path).await? else {
            return Ok(TierLookup::Miss);
        };
        match entry.content {
            Some(encoded) => {
                let content = STANDARD.decode(encoded).map_err(BackendError::codec)?;
                Ok(TierLookup::Found {
                    content: Bytes::from(content),
                    fingerprint: entry.fingerprint,
                })
            }
            None => Ok(TierLookup::Marker(entry.fingerprint)),
        }
    }

    async fn fingerprint(&self, path: &str) -> Result<Option<Fingerprint>, BackendError> {
        Ok(self.entry(path).await?.map(|entry| entry.fingerprint))
    }

    async fn fill(
        &self,
        path: &str,
        content: &Bytes,
        fingerprint: &Fingerprint,
    ) -> Result<(), BackendError> {
        let entry = CachedSource {
            fingerprint: fingerprint.clone(),
            content: (content.len() <= self.inline_limit).then(|| STANDARD.encode(content)),
        };
        self.backend
            .set(&Self::key(path), entry.encode()?, self.ttl)
            .await
    }

    async fn evict(&self, path: &str) -> Result<(), BackendError> {
        let exact = Pattern::escape(&Self::key(path));
        self.backend.delete_matching(&exact).await.map(|_| ())
    }
}

/// Byte-addressable storage tier (object storage or filesystem).
pub struct StorageTier {
    backend: Arc<dyn StorageBackend>,
    tier: Tier,
}

impl StorageTier {
    pub fn new(backend: Arc<dyn StorageBackend>, tier: Tier) -> Self {
        Self { backend, tier }
    }
}

#[async_trait]
impl TierStrategy for StorageTier {
    fn tier(&self) -> Tier {
        self.tier
    }

    fn label(&self) -> &'static str {
        self.backend.name()
    }

    async fn lookup(&self, path: &str) -> Result<TierLookup, BackendError> {
        let Some(content) = self.backend.read(path).await? else {
            return Ok(TierLookup::Miss);
        };
        // Prefer the backend's own fingerprint so `is_uptodate` compares like with like.
        let fingerprint = match self.backend.stat(path).await? {
            Some(fingerprint) => fingerprint,
            None => Fingerprint::of_content(&content),
        };
        Ok(TierLookup::Found {
            content,
            fingerprint,
        })
    }

    async fn fingerprint(&self, path: &str) -> Result<Option<Fingerprint>, BackendError> {
        self.backend.stat(path).await
    }

    async fn fill(
        &self,
        path: &str,
        content: &Bytes,
        _fingerprint: &Fingerprint,
    ) -> Result<(), BackendError> {
        self.backend.write(path, content.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::infra::memory_cache::MemoryCache;
    use crate::infra::storage::MemoryStorage;

    fn memory_cache() -> Arc<MemoryCache> {
        Arc::new(MemoryCache::new(NonZeroUsize::new(8).expect("non-zero")))
    }

    #[tokio::test]
    async fn cache_tier_round_trips_small_sources() {
        let tier = CacheTier::new(memory_cache(), None, 1024);
        let fingerprint = Fingerprint::new("fp");
        tier.fill("default/a.html", &Bytes::from_static(b"<p>a</p>"), &fingerprint)
            .await
            .expect("fill");

        assert_eq!(
            tier.lookup("default/a.html").await.expect("lookup"),
            TierLookup::Found {
                content: Bytes::from_static(b"<p>a</p>"),
                fingerprint,
            }
        );
    }

    #[tokio::test]
    async fn large_sources_become_markers() {
        let tier = CacheTier::new(memory_cache(), None, 4);
        let fingerprint = Fingerprint::new("fp");
        tier.fill("a", &Bytes::from_static(b"too large"), &fingerprint)
            .await
            .expect("fill");

        assert_eq!(
            tier.lookup("a").await.expect("lookup"),
            TierLookup::Marker(fingerprint.clone())
        );
        assert_eq!(tier.fingerprint("a").await.expect("fp"), Some(fingerprint));
    }

    #[tokio::test]
    async fn corrupt_cache_entry_is_an_error() {
        let cache = memory_cache();
        cache
            .set("tpl:a", Bytes::from_static(b"nope"), None)
            .await
            .expect("set");
        let tier = CacheTier::new(cache, None, 1024);
        assert!(matches!(
            tier.lookup("a").await,
            Err(BackendError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn storage_tier_uses_backend_fingerprint() {
        let storage = Arc::new(MemoryStorage::default().with_object("a", "x"));
        let tier = StorageTier::new(storage, Tier::Filesystem);
        let TierLookup::Found { fingerprint, .. } = tier.lookup("a").await.expect("lookup") else {
            panic!("expected a hit");
        };
        assert_eq!(fingerprint, Fingerprint::of_content(b"x"));
        assert_eq!(tier.lookup("b").await.expect("lookup"), TierLookup::Miss);
    }
}
