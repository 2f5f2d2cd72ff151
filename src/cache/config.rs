//! Response cache configuration.

use std::num::NonZeroUsize;

use serde::Deserialize;

use super::rules::RuleSpec;

const DEFAULT_MAX_ENTRIES: usize = 1024;
const DEFAULT_BODY_LIMIT_BYTES: usize = 1024 * 1024;

/// Headers consulted by the key deriver unless configured otherwise.
pub const DEFAULT_VARY_HEADERS: [&str; 3] = ["Accept", "HX-Request", "X-Render-Block"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch for response caching. Template source caching is unaffected.
    pub enabled: bool,
    /// Ordered list of request headers folded into every key.
    pub vary_headers: Vec<String>,
    /// Capacity of the in-process cache backend.
    pub max_entries: usize,
    /// Largest response body the middleware buffers for caching.
    pub body_limit_bytes: usize,
    pub rules: Vec<RuleSpec>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            vary_headers: DEFAULT_VARY_HEADERS.iter().map(|s| s.to_string()).collect(),
            max_entries: DEFAULT_MAX_ENTRIES,
            body_limit_bytes: DEFAULT_BODY_LIMIT_BYTES,
            rules: Vec::new(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            vary_headers: settings.vary_headers.clone(),
            max_entries: settings.max_entries.get(),
            body_limit_bytes: settings.body_limit_bytes.get(),
            rules: settings.rules.clone(),
        }
    }
}

impl CacheConfig {
    /// Returns the backend capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.vary_headers, ["Accept", "HX-Request", "X-Render-Block"]);
        assert_eq!(config.max_entries, 1024);
        assert_eq!(config.body_limit_bytes, 1024 * 1024);
        assert!(config.rules.is_empty());
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            max_entries: 0,
            ..Default::default()
        };
        assert_eq!(config.max_entries_non_zero().get(), 1);
    }
}
