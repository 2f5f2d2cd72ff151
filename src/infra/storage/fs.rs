//! Filesystem-backed storage rooted at a directory.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;

use crate::application::backends::{BackendError, StorageBackend, checked_path};
use crate::domain::Fingerprint;

const NAME: &str = "filesystem";

#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, BackendError> {
        Ok(self.root.join(checked_path(path)?))
    }
}

#[async_trait]
impl StorageBackend for FsStorage {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn read(&self, path: &str) -> Result<Option<Bytes>, BackendError> {
        let absolute = self.resolve(path)?;
        match fs::read(&absolute).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if is_missing(&err) => Ok(None),
            Err(err) => Err(BackendError::unavailable(NAME, err)),
        }
    }

    /// Size plus modification time. Cheap, but blind to same-size edits
    /// within the filesystem's timestamp granularity.
    async fn stat(&self, path: &str) -> Result<Option<Fingerprint>, BackendError> {
        let absolute = self.resolve(path)?;
        let metadata = match fs::metadata(&absolute).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Ok(None),
            Err(err) if is_missing(&err) => return Ok(None),
            Err(err) => return Err(BackendError::unavailable(NAME, err)),
        };
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
            .map(|since| since.as_nanos())
            .unwrap_or_default();
        Ok(Some(Fingerprint::new(format!(
            "fs:{}:{mtime}",
            metadata.len()
        ))))
    }

    async fn write(&self, path: &str, bytes: Bytes) -> Result<(), BackendError> {
        let absolute = self.resolve(path)?;
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| BackendError::unavailable(NAME, err))?;
        }
        fs::write(&absolute, &bytes)
            .await
            .map_err(|err| BackendError::unavailable(NAME, err))
    }
}

fn is_missing(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory)
}
