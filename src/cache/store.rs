//! Response cache on top of a [`CacheBackend`].
//!
//! Backend failures never fail a request: a failed read is a miss and a
//! failed write is skipped.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use glob::Pattern;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::application::backends::{BackendError, CacheBackend};

use super::config::CacheConfig;
use super::index::KeyIndex;
use super::keys::{KeyDeriver, VaryHeaders};
use super::rules::{Cacheability, RuleBook, url_path};

const METRIC_CACHE_HIT: &str = "tessera_cache_hit_total";
const METRIC_CACHE_MISS: &str = "tessera_cache_miss_total";
const METRIC_CACHE_STORE: &str = "tessera_cache_store_total";
const METRIC_CACHE_BACKEND_ERROR: &str = "tessera_cache_backend_error_total";

/// Cached HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

#[derive(Serialize, Deserialize)]
struct StoredResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl CachedResponse {
    pub fn new(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Self {
        Self {
            status: status.as_u16(),
            headers: headers
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
                .collect(),
            body,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK)
    }

    /// Rebuild the header map; entries that are no longer valid are dropped.
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.append(name, value);
            }
        }
        map
    }

    pub fn encode(&self) -> Result<Bytes, BackendError> {
        let stored = StoredResponse {
            status: self.status,
            headers: self.headers.clone(),
            body: STANDARD.encode(&self.body),
        };
        serde_json::to_vec(&stored)
            .map(Bytes::from)
            .map_err(BackendError::codec)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, BackendError> {
        let stored: StoredResponse = serde_json::from_slice(raw).map_err(BackendError::codec)?;
        let body = STANDARD.decode(stored.body).map_err(BackendError::codec)?;
        Ok(Self {
            status: stored.status,
            headers: stored.headers,
            body: Bytes::from(body),
        })
    }
}

/// Key derivation, rule evaluation and storage for rendered responses.
pub struct ResponseCache {
    backend: Arc<dyn CacheBackend>,
    keys: KeyDeriver,
    rules: Arc<RuleBook>,
    index: KeyIndex,
    enabled: bool,
}

impl ResponseCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig, rules: Arc<RuleBook>) -> Self {
        Self {
            backend,
            keys: KeyDeriver::new(VaryHeaders::new(&config.vary_headers)),
            rules,
            index: KeyIndex::new(),
            enabled: config.enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn vary(&self) -> &VaryHeaders {
        self.keys.vary()
    }

    pub fn rules(&self) -> &RuleBook {
        &self.rules
    }

    pub fn index(&self) -> &KeyIndex {
        &self.index
    }

    pub fn compute_key(&self, method: &Method, url: &str, headers: &HeaderMap) -> String {
        self.keys.compute_key(method, url, headers)
    }

    /// Rule decision, forced to "not cacheable" while caching is disabled.
    pub fn cacheability(&self, method: &Method, url: &str, status: StatusCode) -> Cacheability {
        if !self.enabled {
            return Cacheability::NOT_CACHEABLE;
        }
        self.rules.is_cacheable(method, url, status)
    }

    pub async fn lookup(&self, key: &str) -> Option<CachedResponse> {
        if !self.enabled {
            return None;
        }

        let raw = match self.backend.get(key).await {
            Ok(raw) => raw,
            Err(err) => {
                counter!(METRIC_CACHE_BACKEND_ERROR, "op" => "get").increment(1);
                warn!(
                    cache = "response",
                    op = "get",
                    error = %err,
                    "cache backend failed; treating as miss"
                );
                None
            }
        };

        let Some(raw) = raw else {
            counter!(METRIC_CACHE_MISS).increment(1);
            debug!(cache = "response", outcome = "miss", key);
            return None;
        };

        match CachedResponse::decode(&raw) {
            Ok(cached) => {
                counter!(METRIC_CACHE_HIT).increment(1);
                debug!(cache = "response", outcome = "hit", key);
                Some(cached)
            }
            Err(err) => {
                counter!(METRIC_CACHE_MISS).increment(1);
                warn!(cache = "response", key, error = %err, "discarding undecodable cache entry");
                None
            }
        }
    }

    /// Write `response` under `key`; returns whether the backend accepted it.
    pub async fn store(
        &self,
        key: &str,
        url: &str,
        response: &CachedResponse,
        ttl: Duration,
    ) -> bool {
        if !self.enabled || ttl.is_zero() {
            return false;
        }

        let encoded = match response.encode() {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(cache = "response", key, error = %err, "failed to encode response");
                return false;
            }
        };

        match self.backend.set(key, encoded, Some(ttl)).await {
            Ok(()) => {
                self.index.register(url_path(url), key);
                counter!(METRIC_CACHE_STORE).increment(1);
                debug!(
                    cache = "response",
                    key,
                    ttl_seconds = ttl.as_secs(),
                    "cached response"
                );
                true
            }
            Err(err) => {
                counter!(METRIC_CACHE_BACKEND_ERROR, "op" => "set").increment(1);
                warn!(
                    cache = "response",
                    op = "set",
                    error = %err,
                    "cache backend failed; response not cached"
                );
                false
            }
        }
    }

    /// Delete cached responses whose URL path matches `path_glob`.
    pub async fn purge(&self, path_glob: &str) -> Result<usize, BackendError> {
        let pattern = Pattern::new(path_glob).map_err(|err| BackendError::InvalidPattern {
            pattern: path_glob.to_string(),
            message: err.to_string(),
        })?;

        let mut removed = 0;
        for key in self.index.take_matching(&pattern) {
            removed += self.backend.delete_matching(&Pattern::escape(&key)).await?;
        }
        debug!(cache = "response", pattern = path_glob, removed, "purged by path");
        Ok(removed)
    }

    /// Forward a raw key glob to the backend.
    pub async fn purge_keys(&self, key_glob: &str) -> Result<usize, BackendError> {
        let removed = self.backend.delete_matching(key_glob).await?;
        debug!(cache = "response", pattern = key_glob, removed, "purged by key");
        Ok(removed)
    }
}
