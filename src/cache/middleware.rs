//! Response cache middleware.
//!
//! Applies the same key derivation, rule book and backend as the renderer to
//! arbitrary routes. Streaming responses, responses setting cookies and
//! bodies that are not known to fit the body limit are never cached.

use std::sync::Arc;

use axum::{
    body::{Body, HttpBody},
    extract::State,
    http::{
        HeaderValue, Request, StatusCode,
        header::{CONTENT_LENGTH, CONTENT_TYPE, SET_COOKIE, VARY},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use http_body_util::{BodyExt, Limited};
use tracing::{debug, instrument, warn};

use super::CACHE_STATUS_HEADER;
use super::store::{CachedResponse, ResponseCache};

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheState {
    pub cache: Arc<ResponseCache>,
    pub body_limit: usize,
}

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(state): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let cache = &state.cache;
    if !cache.is_enabled() {
        return next.run(request).await;
    }

    let method = request.method().clone();
    let url = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let key = cache.compute_key(&method, &url, request.headers());

    if let Some(cached) = cache.lookup(&key).await {
        debug!(cache = "response", outcome = "hit", "serving cached response");
        let mut response = build_response(cached);
        response
            .headers_mut()
            .insert(CACHE_STATUS_HEADER, HeaderValue::from_static("HIT"));
        return response;
    }

    let mut response = next.run(request).await;
    if !cache.vary().is_empty()
        && !response.headers().contains_key(VARY)
        && let Ok(value) = HeaderValue::from_str(&cache.vary().header_value())
    {
        response.headers_mut().insert(VARY, value);
    }

    let decision = cache.cacheability(&method, &url, response.status());
    if !decision.cacheable || !is_storable(&response, state.body_limit) {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match Limited::new(body, state.body_limit).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            // Only reachable when a body outgrows its own size hint.
            warn!(cache = "response", error = %err, "failed to buffer response body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let cached = CachedResponse::new(parts.status, &parts.headers, bytes.clone());
    cache.store(&key, &url, &cached, decision.ttl).await;

    let mut response = Response::from_parts(parts, Body::from(bytes));
    response
        .headers_mut()
        .insert(CACHE_STATUS_HEADER, HeaderValue::from_static("MISS"));
    response
}

fn is_storable(response: &Response, body_limit: usize) -> bool {
    let headers = response.headers();
    if headers.contains_key(SET_COOKIE) {
        return false;
    }
    if headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"))
    {
        return false;
    }

    // Only bodies known to fit the limit are buffered.
    let limit = body_limit as u64;
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit) {
        return false;
    }
    match response.body().size_hint().upper() {
        Some(upper) => upper <= limit,
        None => declared.is_some(),
    }
}

/// Build a response from cached data.
pub fn build_response(cached: CachedResponse) -> Response {
    let mut builder = Response::builder().status(cached.status);

    for (name, value) in cached.headers {
        if let Ok(header_value) = HeaderValue::from_str(&value) {
            builder = builder.header(name, header_value);
        }
    }

    builder
        .body(Body::from(cached.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
