use std::{collections::BTreeMap, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::{
    application::{
        components::COMPONENT_PREFIX,
        error::{AppError, HttpError},
        render::{CacheStatus, RenderBody, RenderRequest, RenderResponse, Renderer},
    },
    cache::{CacheState, response_cache_layer},
    domain::{RenderContext, RenderMode},
};

use super::{
    CACHE_STATUS_HEADER, HX_REQUEST_HEADER, RENDER_BLOCK_HEADER,
    middleware::{log_responses, set_request_context},
};

const INDEX_TEMPLATE: &str = "index";
const TEMPLATE_EXTENSION: &str = ".html";

#[derive(Clone)]
pub struct HttpState {
    pub renderer: Arc<Renderer>,
    /// Render full pages in stream mode.
    pub stream_pages: bool,
    /// Largest component preview the cache middleware buffers.
    pub body_limit: usize,
}

pub fn build_router(state: HttpState) -> Router {
    // Component previews go through the generic cache middleware; pages are
    // cached by the renderer itself.
    let components = Router::new().route("/_components/{*name}", get(component_preview));
    let components = match state.renderer.cache() {
        Some(cache) => components.layer(middleware::from_fn_with_state(
            CacheState {
                cache: Arc::clone(cache),
                body_limit: state.body_limit,
            },
            response_cache_layer,
        )),
        None => components,
    };

    Router::new()
        .route("/", get(index))
        .route("/_health", get(health))
        .route("/_cache", delete(purge_cache))
        .route("/{*path}", get(page))
        .merge(components)
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn index(
    State(state): State<HttpState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<BTreeMap<String, String>>,
) -> Response {
    render_page(&state, INDEX_TEMPLATE, method, uri, headers, query).await
}

async fn page(
    State(state): State<HttpState>,
    Path(path): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<BTreeMap<String, String>>,
) -> Response {
    let name = path.trim_end_matches('/');
    let name = if name.is_empty() { INDEX_TEMPLATE } else { name };
    render_page(&state, name, method, uri, headers, query).await
}

async fn render_page(
    state: &HttpState,
    name: &str,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    query: BTreeMap<String, String>,
) -> Response {
    let template = template_name(name);
    let context = RenderContext::new(template)
        .with_variables(query_context(query))
        .with_mode(request_mode(&headers, state.stream_pages));
    let url = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    let request = RenderRequest {
        method,
        url,
        headers,
        context,
    };
    match state.renderer.render(request).await {
        Ok(response) => into_http_response(response),
        Err(err) => AppError::from(err).into_response(),
    }
}

async fn component_preview(
    State(state): State<HttpState>,
    Path(name): Path<String>,
    Query(query): Query<BTreeMap<String, String>>,
) -> Response {
    let context = RenderContext::new(format!("{COMPONENT_PREFIX}{name}"))
        .with_variables(query_context(query))
        .with_mode(RenderMode::Fragment);
    // The cache middleware wrapping this route reports its own status.
    match state.renderer.render_context(context).await {
        Ok(body) => body_response(StatusCode::OK, html_headers(), body),
        Err(err) => AppError::from(err).into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PurgeQuery {
    path: Option<String>,
}

#[derive(Debug, Serialize)]
struct PurgeSummary {
    pattern: String,
    purged: usize,
}

async fn purge_cache(
    State(state): State<HttpState>,
    Query(query): Query<PurgeQuery>,
) -> Result<Response, HttpError> {
    let pattern = query
        .path
        .filter(|path| !path.trim().is_empty())
        .unwrap_or_else(|| "/**".to_string());
    let purged = match state.renderer.cache() {
        Some(cache) => cache.purge(&pattern).await?,
        None => 0,
    };
    info!(
        target = "tessera::http::cache",
        pattern = %pattern,
        purged,
        "purged cached responses"
    );
    Ok(Json(PurgeSummary { pattern, purged }).into_response())
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Convert a render result into an axum response, streaming when the body
/// is a chunk stream.
pub fn into_http_response(response: RenderResponse) -> Response {
    let RenderResponse {
        status,
        headers,
        body,
        cache,
    } = response;

    let mut out = body_response(status, headers, body);
    out.headers_mut().insert(
        CACHE_STATUS_HEADER,
        HeaderValue::from_static(cache_header_value(cache)),
    );
    out
}

fn body_response(status: StatusCode, headers: HeaderMap, body: RenderBody) -> Response {
    let body = match body {
        RenderBody::Full(bytes) => Body::from(bytes),
        RenderBody::Stream(stream) => Body::from_stream(stream),
    };
    let mut out = Response::new(body);
    *out.status_mut() = status;
    out.headers_mut().extend(headers);
    out
}

fn cache_header_value(status: CacheStatus) -> &'static str {
    match status {
        CacheStatus::Hit => "HIT",
        CacheStatus::Miss => "MISS",
        CacheStatus::Bypass => "BYPASS",
    }
}

fn html_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    headers
}

fn template_name(name: &str) -> String {
    if name.ends_with(TEMPLATE_EXTENSION) {
        name.to_string()
    } else {
        format!("{name}{TEMPLATE_EXTENSION}")
    }
}

/// Block header beats `HX-Request`; streaming only applies to full pages.
fn request_mode(headers: &HeaderMap, stream_pages: bool) -> RenderMode {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    if let Some(block) = header(RENDER_BLOCK_HEADER) {
        return RenderMode::Block(block.to_string());
    }
    if header(HX_REQUEST_HEADER).is_some_and(|value| value.eq_ignore_ascii_case("true")) {
        return RenderMode::Fragment;
    }
    if stream_pages {
        RenderMode::Stream { chunk_size: None }
    } else {
        RenderMode::Standard
    }
}

fn query_context(query: BTreeMap<String, String>) -> Map<String, Value> {
    query
        .into_iter()
        .map(|(key, value)| (key, Value::String(value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_names_get_an_extension() {
        assert_eq!(template_name("index"), "index.html");
        assert_eq!(template_name("docs/intro"), "docs/intro.html");
        assert_eq!(template_name("raw.html"), "raw.html");
    }

    #[test]
    fn mode_follows_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_mode(&headers, false), RenderMode::Standard);
        assert!(request_mode(&headers, true).is_stream());

        headers.insert(HX_REQUEST_HEADER, HeaderValue::from_static("true"));
        assert_eq!(request_mode(&headers, true), RenderMode::Fragment);

        headers.insert(RENDER_BLOCK_HEADER, HeaderValue::from_static("sidebar"));
        assert_eq!(
            request_mode(&headers, true),
            RenderMode::Block("sidebar".to_string())
        );
    }

    #[test]
    fn cache_status_is_reported() {
        let response = into_http_response(RenderResponse {
            status: StatusCode::OK,
            headers: html_headers(),
            body: RenderBody::Full("<p>hi</p>".into()),
            cache: CacheStatus::Hit,
        });
        assert_eq!(response.headers()[CACHE_STATUS_HEADER], "HIT");
        assert_eq!(
            response.headers()[axum::http::header::CONTENT_TYPE],
            "text/html; charset=utf-8"
        );
    }
}
