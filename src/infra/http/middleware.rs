//! Request id tagging and one structured log line per response.

use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::{Instrument, debug, error, info_span, warn};
use uuid::Uuid;

use crate::application::error::ErrorReport;

const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_REQUEST_ID_LEN: usize = 128;

/// Request id, stored in both request and response extensions.
#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
}

impl RequestContext {
    fn from_request(request: &Request<Body>) -> Self {
        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty() && value.len() <= MAX_REQUEST_ID_LEN)
            .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
        Self { request_id }
    }
}

/// Tags the request and response with an id, reusing an inbound `X-Request-Id`.
pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let ctx = RequestContext::from_request(&request);
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response.extensions_mut().insert(ctx);
    response
}

/// Runs the rest of the stack inside a `request` span and logs the outcome:
/// debug when served, warn for 4xx, error for 5xx with the attached
/// [`ErrorReport`] chain.
pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();
    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    let query = request.uri().query().unwrap_or_default().to_string();
    let start = Instant::now();

    let mut response = next.run(request).instrument(span.clone()).await;
    let _entered = span.enter();

    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis() as u64;
    let cache = response
        .headers()
        .get(super::CACHE_STATUS_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("none")
        .to_string();

    if !status.is_client_error() && !status.is_server_error() {
        debug!(
            target = "tessera::http::response",
            status = status.as_u16(),
            elapsed_ms,
            cache = %cache,
            "request served",
        );
        return response;
    }

    let (source, chain) = match response.extensions_mut().remove::<ErrorReport>() {
        Some(report) => (report.source, report.messages),
        None => ("unknown", Vec::new()),
    };
    let detail = chain
        .first()
        .map_or("no diagnostic available", String::as_str);

    if status.is_server_error() {
        error!(
            target = "tessera::http::response",
            status = status.as_u16(),
            elapsed_ms,
            cache = %cache,
            query = %query,
            source,
            detail,
            chain = ?chain,
            "request failed",
        );
    } else {
        warn!(
            target = "tessera::http::response",
            status = status.as_u16(),
            elapsed_ms,
            query = %query,
            source,
            detail,
            "client request error",
        );
    }
    response
}
