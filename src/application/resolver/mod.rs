//! Storage resolver.
//!
//! Walks the configured tiers fastest first and stops at the first tier that
//! has the bytes. Slower hits are copied into the faster tiers in the
//! background. Backend failures are logged and skipped so one unavailable
//! tier never fails a render.

mod backfill;
mod tier;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use glob::Pattern;
use metrics::counter;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::application::backends::{BackendError, CacheBackend, checked_path};
use crate::domain::{Fingerprint, TemplateId, TemplateSource};

pub use backfill::Backfills;
pub use tier::{CacheTier, CachedSource, SOURCE_KEY_PREFIX, StorageTier, TierLookup, TierStrategy};

const METRIC_TIER_HIT: &str = "tessera_resolver_tier_hit_total";
const METRIC_BACKFILL: &str = "tessera_resolver_backfill_total";
const METRIC_NEGATIVE_HIT: &str = "tessera_resolver_negative_hit_total";

/// Hot-cache key prefix for negative entries.
pub const MISS_KEY_PREFIX: &str = "tpl-miss:";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("template `{0}` not found")]
    NotFound(TemplateId),
    #[error("invalid template path `{0}`")]
    InvalidName(String),
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub default_variant: String,
    /// Lifetime of negative entries; zero disables negative caching.
    pub negative_ttl: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            default_variant: "default".to_string(),
            negative_ttl: Duration::from_secs(30),
        }
    }
}

pub struct StorageResolver {
    tiers: Vec<Arc<dyn TierStrategy>>,
    negative: Option<Arc<dyn CacheBackend>>,
    backfills: Backfills,
    config: ResolverConfig,
}

enum Walk {
    Hit(TemplateSource),
    /// Every tier answered and none had the bytes.
    Miss,
    /// Nothing found, but at least one tier could not answer.
    Degraded,
}

impl StorageResolver {
    /// `tiers` must be ordered fastest first. `negative` holds miss tombstones.
    pub fn new(
        tiers: Vec<Arc<dyn TierStrategy>>,
        negative: Option<Arc<dyn CacheBackend>>,
        backfills: Backfills,
        config: ResolverConfig,
    ) -> Self {
        Self {
            tiers,
            negative,
            backfills,
            config,
        }
    }

    pub fn backfills(&self) -> &Backfills {
        &self.backfills
    }

    pub fn default_variant(&self) -> &str {
        &self.config.default_variant
    }

    /// Resolve `name` in `variant`, falling back to the default variant.
    pub async fn resolve(
        &self,
        name: &str,
        variant: Option<&str>,
    ) -> Result<TemplateSource, ResolveError> {
        let default = self.config.default_variant.as_str();
        let requested = TemplateId::new(name, variant.unwrap_or(default));
        let first = self.resolve_id(&requested).await;
        match first {
            Err(ResolveError::NotFound(_)) if requested.variant != default => {
                debug!(template = %requested, "falling back to default variant");
                self.resolve_id(&requested.with_variant(default))
                    .await
                    .map_err(|_| ResolveError::NotFound(requested))
            }
            other => other,
        }
    }

    /// Resolve several independent templates concurrently.
    pub async fn resolve_many(
        &self,
        ids: &[TemplateId],
    ) -> Vec<Result<TemplateSource, ResolveError>> {
        join_all(
            ids.iter()
                .map(|id| self.resolve(&id.name, Some(id.variant.as_str()))),
        )
        .await
    }

    /// Resolve exactly `id`, without variant fallback.
    #[instrument(skip_all, fields(template = %id))]
    pub async fn resolve_id(&self, id: &TemplateId) -> Result<TemplateSource, ResolveError> {
        let path = id.path();
        checked_path(&path).map_err(|_| ResolveError::InvalidName(path.clone()))?;

        if self.is_known_missing(&path).await {
            counter!(METRIC_NEGATIVE_HIT).increment(1);
            debug!(path, outcome = "negative_hit", "template known missing");
            return Err(ResolveError::NotFound(id.clone()));
        }

        match self.walk(id, &path).await {
            Walk::Hit(source) => Ok(source),
            Walk::Miss => {
                self.remember_missing(&path).await;
                Err(ResolveError::NotFound(id.clone()))
            }
            Walk::Degraded => Err(ResolveError::NotFound(id.clone())),
        }
    }

    async fn walk(&self, id: &TemplateId, path: &str) -> Walk {
        let mut degraded = false;
        let mut marker: Option<Fingerprint> = None;

        for (position, tier) in self.tiers.iter().enumerate() {
            match tier.lookup(path).await {
                Ok(TierLookup::Found {
                    content,
                    fingerprint,
                }) => {
                    counter!(METRIC_TIER_HIT, "tier" => tier.tier().as_str()).increment(1);
                    debug!(path, tier = %tier.tier(), backend = tier.label(), "template resolved");
                    let stale_marker = marker.as_ref().is_some_and(|seen| *seen != fingerprint);
                    if position > 0 {
                        self.backfill(position, path, &content, &fingerprint, stale_marker);
                    }
                    return Walk::Hit(TemplateSource {
                        id: id.clone(),
                        content,
                        fingerprint,
                        tier: tier.tier(),
                    });
                }
                Ok(TierLookup::Marker(fingerprint)) => {
                    debug!(
                        path,
                        tier = %tier.tier(),
                        "fingerprint marker; fetching bytes from slower tier"
                    );
                    marker = Some(fingerprint);
                }
                Ok(TierLookup::Miss) => {}
                Err(err) => {
                    degraded = true;
                    warn!(
                        path,
                        tier = %tier.tier(),
                        backend = tier.label(),
                        error = %err,
                        "tier unavailable; falling through"
                    );
                }
            }
        }

        if degraded { Walk::Degraded } else { Walk::Miss }
    }

    fn backfill(
        &self,
        found_at: usize,
        path: &str,
        content: &Bytes,
        fingerprint: &Fingerprint,
        stale_marker: bool,
    ) {
        if stale_marker {
            debug!(path, "cached fingerprint is stale; refreshing");
        }
        for tier in self.tiers[..found_at].iter().cloned() {
            let path = path.to_string();
            let content = content.clone();
            let fingerprint = fingerprint.clone();
            self.backfills.spawn("template_source", async move {
                match tier.fill(&path, &content, &fingerprint).await {
                    Ok(()) => {
                        counter!(METRIC_BACKFILL, "tier" => tier.tier().as_str()).increment(1);
                        debug!(path, tier = %tier.tier(), "backfilled");
                    }
                    Err(err) => {
                        warn!(path, tier = %tier.tier(), error = %err, "backfill failed");
                    }
                }
            });
        }
    }

    /// Ask the origin tier whether `source` still matches what it stores.
    /// Unreachable or missing origins report `false`.
    pub async fn is_uptodate(&self, source: &TemplateSource) -> bool {
        let path = source.id.path();
        let Some(origin) = self.tiers.iter().find(|tier| tier.tier() == source.tier) else {
            return false;
        };
        match origin.fingerprint(&path).await {
            Ok(Some(current)) => current == source.fingerprint,
            Ok(None) => false,
            Err(err) => {
                warn!(path, tier = %source.tier, error = %err, "uptodate check failed");
                false
            }
        }
    }

    /// Drop cached copies and negative entries for `id`.
    pub async fn forget(&self, id: &TemplateId) {
        let path = id.path();
        for tier in &self.tiers {
            if let Err(err) = tier.evict(&path).await {
                warn!(path, tier = %tier.tier(), error = %err, "failed to evict template source");
            }
        }
        let miss_key = Pattern::escape(&format!("{MISS_KEY_PREFIX}{path}"));
        if let Some(cache) = &self.negative
            && let Err(err) = cache.delete_matching(&miss_key).await
        {
            warn!(path, error = %err, "failed to drop negative entry");
        }
    }

    /// Drop every cached source and negative entry. Used on reload.
    pub async fn forget_all(&self) -> Result<usize, BackendError> {
        let Some(cache) = &self.negative else {
            return Ok(0);
        };
        let sources = cache.delete_matching(&format!("{SOURCE_KEY_PREFIX}*")).await?;
        let misses = cache.delete_matching(&format!("{MISS_KEY_PREFIX}*")).await?;
        Ok(sources + misses)
    }

    async fn is_known_missing(&self, path: &str) -> bool {
        let Some(cache) = &self.negative else {
            return false;
        };
        if self.config.negative_ttl.is_zero() {
            return false;
        }
        match cache.get(&format!("{MISS_KEY_PREFIX}{path}")).await {
            Ok(entry) => entry.is_some(),
            Err(err) => {
                warn!(path, error = %err, "negative cache lookup failed");
                false
            }
        }
    }

    async fn remember_missing(&self, path: &str) {
        let Some(cache) = &self.negative else {
            return;
        };
        if self.config.negative_ttl.is_zero() {
            return;
        }
        if let Err(err) = cache
            .set(
                &format!("{MISS_KEY_PREFIX}{path}"),
                Bytes::new(),
                Some(self.config.negative_ttl),
            )
            .await
        {
            warn!(path, error = %err, "failed to record negative entry");
        }
    }
}
