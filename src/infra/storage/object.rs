//! HTTP object storage (S3-style GET / HEAD / PUT under a base URL).

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    Client, StatusCode, Url,
    header::{CONTENT_LENGTH, ETAG, HeaderName, LAST_MODIFIED},
};
use tracing::debug;

use crate::application::backends::{BackendError, StorageBackend, checked_path};
use crate::domain::Fingerprint;

const NAME: &str = "object";

#[derive(Debug, Clone)]
pub struct HttpObjectStorage {
    client: Client,
    base: Url,
}

impl HttpObjectStorage {
    pub fn new(base: &str) -> Result<Self, BackendError> {
        let mut base = Url::parse(base).map_err(|err| BackendError::unavailable(NAME, err))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .user_agent(concat!("tessera/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| BackendError::unavailable(NAME, err))?;
        Ok(Self { client, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn url(&self, path: &str) -> Result<Url, BackendError> {
        let relative = checked_path(path)?;
        self.base
            .join(relative)
            .map_err(|_| BackendError::InvalidPath(path.to_string()))
    }
}

#[async_trait]
impl StorageBackend for HttpObjectStorage {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn read(&self, path: &str) -> Result<Option<Bytes>, BackendError> {
        let url = self.url(path)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| BackendError::unavailable(NAME, err))?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(BackendError::unavailable(NAME, format!("GET {path}: status {status}")));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| BackendError::unavailable(NAME, err))?;
        Ok(Some(bytes))
    }

    /// ETag when the store provides one, else Last-Modified, else length.
    async fn stat(&self, path: &str) -> Result<Option<Fingerprint>, BackendError> {
        let url = self.url(path)?;
        let resp = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|err| BackendError::unavailable(NAME, err))?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(BackendError::unavailable(NAME, format!("HEAD {path}: status {status}")));
        }

        let headers = resp.headers();
        let header = |name: HeaderName| headers.get(name).and_then(|value| value.to_str().ok());
        let fingerprint = if let Some(etag) = header(ETAG) {
            format!("etag:{}", etag.trim_matches('"'))
        } else if let Some(modified) = header(LAST_MODIFIED) {
            format!("modified:{modified}")
        } else {
            format!("len:{}", header(CONTENT_LENGTH).unwrap_or("0"))
        };
        Ok(Some(Fingerprint::new(fingerprint)))
    }

    async fn write(&self, path: &str, bytes: Bytes) -> Result<(), BackendError> {
        let url = self.url(path)?;
        let resp = self
            .client
            .put(url)
            .body(bytes)
            .send()
            .await
            .map_err(|err| BackendError::unavailable(NAME, err))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BackendError::unavailable(NAME, format!("PUT {path}: status {status}")));
        }
        debug!(storage = NAME, path, "object written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_gets_trailing_slash() {
        let storage = HttpObjectStorage::new("http://objects.local/templates").expect("storage");
        assert_eq!(storage.base().as_str(), "http://objects.local/templates/");
        assert_eq!(
            storage.url("default/index.html").expect("url").as_str(),
            "http://objects.local/templates/default/index.html"
        );
    }

    #[test]
    fn traversal_is_rejected_before_any_request() {
        let storage = HttpObjectStorage::new("http://objects.local/").expect("storage");
        assert!(matches!(
            storage.url("../admin"),
            Err(BackendError::InvalidPath(_))
        ));
    }
}
