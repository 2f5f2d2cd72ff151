//! Template identity and resolved source.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Storage tier a template source was read from, in lookup priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Hot key-value cache.
    Cache,
    /// Durable object storage.
    Storage,
    /// Local filesystem.
    Filesystem,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Cache => "cache",
            Tier::Storage => "storage",
            Tier::Filesystem => "filesystem",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque modification marker (content hash, ETag or size/mtime pair).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fingerprint derived from the bytes themselves.
    pub fn of_content(bytes: &[u8]) -> Self {
        Self(format!("xxh3:{:016x}", xxhash_rust::xxh3::xxh3_64(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical template name plus the variant (theme/namespace) it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateId {
    pub name: String,
    pub variant: String,
}

impl TemplateId {
    pub fn new(name: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            variant: variant.into(),
        }
    }

    /// Storage path shared by every tier: `{variant}/{name}`.
    pub fn path(&self) -> String {
        format!(
            "{}/{}",
            self.variant.trim_matches('/'),
            self.name.trim_start_matches('/')
        )
    }

    pub fn with_variant(&self, variant: impl Into<String>) -> Self {
        Self {
            name: self.name.clone(),
            variant: variant.into(),
        }
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.variant)
    }
}

/// Raw template bytes as returned by a tier. Immutable for the render that requested it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSource {
    pub id: TemplateId,
    pub content: Bytes,
    pub fingerprint: Fingerprint,
    pub tier: Tier,
}

impl TemplateSource {
    /// Decode the source as UTF-8 text for the template engine.
    pub fn text(&self) -> Result<String, std::str::Utf8Error> {
        std::str::from_utf8(&self.content).map(str::to_owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_joins_variant_and_name() {
        let id = TemplateId::new("items/list.html", "default");
        assert_eq!(id.path(), "default/items/list.html");

        let id = TemplateId::new("/index.html", "dark/");
        assert_eq!(id.path(), "dark/index.html");
    }

    #[test]
    fn tiers_order_by_priority() {
        assert!(Tier::Cache < Tier::Storage);
        assert!(Tier::Storage < Tier::Filesystem);
    }

    #[test]
    fn content_fingerprint_is_stable() {
        assert_eq!(
            Fingerprint::of_content(b"hello"),
            Fingerprint::of_content(b"hello")
        );
        assert_ne!(
            Fingerprint::of_content(b"hello"),
            Fingerprint::of_content(b"hello!")
        );
    }
}
