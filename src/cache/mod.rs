//! Response cache: key derivation, cacheability rules and storage.
//!
//! ```toml
//! [cache]
//! enabled = true
//! vary_headers = ["Accept", "HX-Request", "X-Render-Block"]
//!
//! [[cache.rules]]
//! path = "/static/*"
//! ttl_seconds = 3600
//!
//! [[cache.rules]]
//! path = "/*"
//! ttl_seconds = 0
//! ```

mod config;
mod index;
mod keys;
pub(crate) mod lock;
mod middleware;
mod rules;
mod store;

pub use config::{CacheConfig, DEFAULT_VARY_HEADERS};
pub use index::KeyIndex;
pub use keys::{KEY_DELIMITER, KeyDeriver, VaryHeaders, hash_str};
pub use middleware::{CacheState, build_response, response_cache_layer};
pub use rules::{CacheRule, Cacheability, RuleBook, RuleError, RuleSet, RuleSpec, url_path};
pub use store::{CachedResponse, ResponseCache};

/// Response header reporting whether the cache answered (`HIT`, `MISS`, `BYPASS`).
pub const CACHE_STATUS_HEADER: &str = "x-cache";
