use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;

use super::stream::ChunkStream;
use crate::domain::RenderContext;

/// Inbound render call: the request as seen by the HTTP layer plus the
/// context built from it.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub method: Method,
    /// Path and query, as used for cache keys and rules.
    pub url: String,
    pub headers: HeaderMap,
    pub context: RenderContext,
}

impl RenderRequest {
    pub fn get(url: impl Into<String>, context: RenderContext) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
            context,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// Whether the response cache answered, missed, or was not consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
            CacheStatus::Bypass => "bypass",
        }
    }
}

pub enum RenderBody {
    Full(Bytes),
    Stream(ChunkStream),
}

impl std::fmt::Debug for RenderBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderBody::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            RenderBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl RenderBody {
    /// Collect the body, draining a stream to its end.
    pub async fn collect(self) -> Result<Bytes, super::RenderError> {
        use futures::StreamExt;

        match self {
            RenderBody::Full(bytes) => Ok(bytes),
            RenderBody::Stream(mut stream) => {
                let mut collected = Vec::new();
                while let Some(chunk) = stream.next().await {
                    collected.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(collected))
            }
        }
    }
}

#[derive(Debug)]
pub struct RenderResponse {
    pub status: StatusCode,
    /// Headers to merge into the outbound response.
    pub headers: HeaderMap,
    pub body: RenderBody,
    pub cache: CacheStatus,
}

/// Output of a render that bypasses the response cache.
pub type RenderOutput = RenderBody;
