//! Cacheability rules.
//!
//! Rules are evaluated in declaration order and the first match wins. A rule
//! set is immutable once built; reloading swaps in a complete new set.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::{Method, StatusCode};
use glob::{MatchOptions, Pattern};
use serde::Deserialize;
use thiserror::Error;

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::rules";

const PATH_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule {index}: invalid path pattern `{pattern}`: {message}")]
    Pattern {
        index: usize,
        pattern: String,
        message: String,
    },
    #[error("rule {index}: invalid method `{method}`")]
    Method { index: usize, method: String },
    #[error("rule {index}: invalid status code {status}")]
    Status { index: usize, status: u16 },
}

/// Rule as written in configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RuleSpec {
    pub path: String,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    #[serde(default = "default_status_codes")]
    pub status_codes: Vec<u16>,
    #[serde(default)]
    pub ttl_seconds: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl RuleSpec {
    pub fn new(path: impl Into<String>, ttl_seconds: u64) -> Self {
        Self {
            path: path.into(),
            methods: default_methods(),
            status_codes: default_status_codes(),
            ttl_seconds,
            enabled: true,
        }
    }
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string()]
}

fn default_status_codes() -> Vec<u16> {
    vec![200]
}

fn default_enabled() -> bool {
    true
}

/// Compiled rule. Empty method or status sets match everything.
#[derive(Debug, Clone)]
pub struct CacheRule {
    pattern: Pattern,
    methods: Vec<Method>,
    statuses: Vec<StatusCode>,
    ttl: Duration,
    enabled: bool,
}

impl CacheRule {
    fn compile(index: usize, spec: &RuleSpec) -> Result<Self, RuleError> {
        let pattern = Pattern::new(&spec.path).map_err(|err| RuleError::Pattern {
            index,
            pattern: spec.path.clone(),
            message: err.to_string(),
        })?;

        let methods = spec
            .methods
            .iter()
            .map(|raw| {
                Method::from_bytes(raw.trim().to_ascii_uppercase().as_bytes()).map_err(|_| {
                    RuleError::Method {
                        index,
                        method: raw.clone(),
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let statuses = spec
            .status_codes
            .iter()
            .map(|code| {
                StatusCode::from_u16(*code).map_err(|_| RuleError::Status {
                    index,
                    status: *code,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            pattern,
            methods,
            statuses,
            ttl: Duration::from_secs(spec.ttl_seconds),
            enabled: spec.enabled,
        })
    }

    fn matches(&self, method: &Method, path: &str, status: StatusCode) -> bool {
        self.enabled
            && self.pattern.matches_with(path, PATH_MATCH)
            && (self.methods.is_empty() || self.methods.contains(method))
            && (self.statuses.is_empty() || self.statuses.contains(&status))
    }
}

/// Decision returned by [`RuleSet::is_cacheable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cacheability {
    pub cacheable: bool,
    pub ttl: Duration,
}

impl Cacheability {
    pub const NOT_CACHEABLE: Self = Self {
        cacheable: false,
        ttl: Duration::ZERO,
    };
}

/// Ordered, immutable list of rules.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CacheRule>,
}

impl RuleSet {
    pub fn compile(specs: &[RuleSpec]) -> Result<Self, RuleError> {
        let rules = specs
            .iter()
            .enumerate()
            .map(|(index, spec)| CacheRule::compile(index, spec))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// TTL of the first matching rule. No match, or a zero TTL, means not cacheable.
    ///
    /// `url` may carry a query string; only the path is matched.
    pub fn is_cacheable(&self, method: &Method, url: &str, status: StatusCode) -> Cacheability {
        let path = url_path(url);
        self.rules
            .iter()
            .find(|rule| rule.matches(method, path, status))
            .map(|rule| Cacheability {
                cacheable: !rule.ttl.is_zero(),
                ttl: rule.ttl,
            })
            .unwrap_or(Cacheability::NOT_CACHEABLE)
    }
}

/// Strip query and fragment from a request target.
pub fn url_path(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    let path = &url[..end];
    if path.is_empty() { "/" } else { path }
}

/// Shared holder that readers clone an `Arc` out of; `replace` swaps the whole set.
#[derive(Debug, Default)]
pub struct RuleBook {
    current: RwLock<Arc<RuleSet>>,
}

impl RuleBook {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(rules)),
        }
    }

    pub fn snapshot(&self) -> Arc<RuleSet> {
        Arc::clone(&rw_read(&self.current, SOURCE, "snapshot"))
    }

    pub fn replace(&self, rules: RuleSet) {
        *rw_write(&self.current, SOURCE, "replace") = Arc::new(rules);
    }

    pub fn is_cacheable(&self, method: &Method, url: &str, status: StatusCode) -> Cacheability {
        self.snapshot().is_cacheable(method, url, status)
    }
}
