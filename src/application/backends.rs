//! Backend traits describing the cache and storage adapters the core consumes.

use std::path::{Component, Path};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::domain::Fingerprint;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend `{backend}` unavailable: {message}")]
    Unavailable {
        backend: &'static str,
        message: String,
    },
    #[error("invalid path `{0}`")]
    InvalidPath(String),
    #[error("invalid pattern `{pattern}`: {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("stored value could not be decoded: {0}")]
    Codec(String),
}

impl BackendError {
    pub fn unavailable(backend: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            backend,
            message: err.to_string(),
        }
    }

    pub fn codec(err: impl std::fmt::Display) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Validate a backend-relative path, stripping leading slashes. Rejects
/// anything that could escape a backend root.
pub fn checked_path(path: &str) -> Result<&str, BackendError> {
    let trimmed = path.trim_start_matches('/');
    let relative = Path::new(trimmed);
    if trimmed.is_empty()
        || path.starts_with("//")
        || relative.is_absolute()
        || relative
            .components()
            .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(BackendError::InvalidPath(path.to_string()));
    }
    Ok(trimmed)
}

/// Key-value cache shared by every in-flight request.
///
/// Implementations must tolerate concurrent reads and writes with
/// last-write-wins semantics and expire entries after their TTL.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError>;

    /// Store `value` under `key`. `None` keeps the entry until evicted.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>)
    -> Result<(), BackendError>;

    /// Delete every key matching the glob `pattern`, returning how many were removed.
    async fn delete_matching(&self, pattern: &str) -> Result<usize, BackendError>;
}

/// Byte-addressable storage holding template and component sources.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short label used in logs and metrics.
    fn name(&self) -> &'static str;

    async fn read(&self, path: &str) -> Result<Option<Bytes>, BackendError>;

    async fn stat(&self, path: &str) -> Result<Option<Fingerprint>, BackendError>;

    /// Only used for backfill.
    async fn write(&self, path: &str, bytes: Bytes) -> Result<(), BackendError>;
}
