//! Router behaviour: mode headers, cache status, purge and error pages.

use std::num::NonZeroUsize;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header::CONTENT_TYPE},
};
use http_body_util::BodyExt;
use tessera::application::backends::{CacheBackend, StorageBackend};
use tessera::application::components::ComponentRegistry;
use tessera::application::render::{RenderConfig, Renderer};
use tessera::application::resolver::{
    Backfills, ResolverConfig, StorageResolver, StorageTier, TierStrategy,
};
use tessera::cache::{CacheConfig, ResponseCache, RuleBook, RuleSet, RuleSpec};
use tessera::domain::Tier;
use tessera::infra::http::{CACHE_STATUS_HEADER, HttpState, build_router};
use tessera::infra::memory_cache::MemoryCache;
use tessera::infra::storage::{FsStorage, MemoryStorage};
use tower::ServiceExt;

const LAYOUT: &str = "<!doctype html><html><head><title>Site</title></head>\
<body>[% block content %][% endblock %]</body></html>";

struct App {
    router: Router,
    pages: Arc<MemoryStorage>,
    _components: tempfile::TempDir,
}

async fn app(stream_pages: bool) -> App {
    app_with_body_limit(stream_pages, 64 * 1024).await
}

async fn app_with_body_limit(stream_pages: bool, body_limit: usize) -> App {
    let pages = Arc::new(
        MemoryStorage::new("pages")
            .with_object("default/layout.html", LAYOUT)
            .with_object(
                "default/index.html",
                "[% extends \"layout.html\" %][% block content %]<h1>Home [[ q ]]</h1>[% endblock %]",
            )
            .with_object(
                "default/docs/intro.html",
                "[% extends \"layout.html\" %][% block content %]\
<nav>[% block toc %]TOC[% endblock %]</nav><p>Intro</p>[% endblock %]",
            ),
    );
    let tiers: Vec<Arc<dyn TierStrategy>> = vec![Arc::new(StorageTier::new(
        pages.clone(),
        Tier::Filesystem,
    ))];
    let resolver = Arc::new(StorageResolver::new(
        tiers,
        None,
        Backfills::new(),
        ResolverConfig::default(),
    ));

    let hot: Arc<dyn CacheBackend> =
        Arc::new(MemoryCache::new(NonZeroUsize::new(64).expect("non-zero")));
    let rules = RuleSet::compile(&[RuleSpec::new("/**", 60)]).expect("rules");
    let cache = Arc::new(ResponseCache::new(
        Arc::clone(&hot),
        &CacheConfig::default(),
        Arc::new(RuleBook::new(rules)),
    ));

    let components = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        components.path().join("badge.toml"),
        "template = \"<span class=\\\"badge\\\">[[ text ]]</span>\"\n\
[props.text]\ntype = \"string\"\nrequired = true\n",
    )
    .expect("write");

    let renderer = Renderer::new(resolver, RenderConfig::default())
        .expect("renderer")
        .with_cache(cache);
    let storage: Arc<dyn StorageBackend> = Arc::new(FsStorage::new(components.path()));
    let registry = Arc::new(ComponentRegistry::new(
        components.path(),
        storage,
        Some(hot),
        renderer.engine().clone(),
    ));
    registry.discover().await.expect("discover");
    let renderer = renderer.with_components(registry);

    let router = build_router(HttpState {
        renderer: Arc::new(renderer),
        stream_pages,
        body_limit,
    });
    App {
        router,
        pages,
        _components: components,
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

async fn send(
    router: &Router,
    request: Request<Body>,
) -> (StatusCode, axum::http::HeaderMap, String) {
    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    (status, headers, String::from_utf8(bytes.to_vec()).expect("utf8"))
}

#[tokio::test]
async fn pages_are_cached_after_the_first_request() {
    let app = app(false).await;

    let (status, headers, body) = send(&app.router, get("/?q=one")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[CACHE_STATUS_HEADER], "MISS");
    assert_eq!(headers[CONTENT_TYPE], "text/html; charset=utf-8");
    assert!(body.contains("<h1>Home one</h1>"));
    let reads = app.pages.total_reads();

    let (_, headers, cached) = send(&app.router, get("/?q=one")).await;
    assert_eq!(headers[CACHE_STATUS_HEADER], "HIT");
    assert_eq!(cached, body);
    assert_eq!(app.pages.total_reads(), reads);

    let (_, headers, other) = send(&app.router, get("/?q=two")).await;
    assert_eq!(headers[CACHE_STATUS_HEADER], "MISS");
    assert!(other.contains("<h1>Home two</h1>"));
}

#[tokio::test]
async fn htmx_requests_get_fragments() {
    let app = app(false).await;
    let request = Request::builder()
        .uri("/docs/intro")
        .header("HX-Request", "true")
        .body(Body::empty())
        .expect("request");
    let (status, _, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "<nav>TOC</nav><p>Intro</p>");
}

#[tokio::test]
async fn block_header_selects_one_block() {
    let app = app(false).await;
    let request = Request::builder()
        .uri("/docs/intro")
        .header("X-Render-Block", "toc")
        .body(Body::empty())
        .expect("request");
    let (status, _, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "TOC");

    // The full page is cached separately from the block.
    let (_, headers, page) = send(&app.router, get("/docs/intro")).await;
    assert_eq!(headers[CACHE_STATUS_HEADER], "MISS");
    assert!(page.starts_with("<!doctype html>"));
}

#[tokio::test]
async fn streamed_pages_match_buffered_ones() {
    let buffered = app(false).await;
    let streamed = app(true).await;
    let (_, _, expected) = send(&buffered.router, get("/docs/intro")).await;
    let (status, _, body) = send(&streamed.router, get("/docs/intro")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, expected);
}

#[tokio::test]
async fn missing_pages_render_the_error_page() {
    let app = app(false).await;
    let (status, _, body) = send(&app.router, get("/nowhere")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.contains("404 · Not Found"));
    assert!(body.contains("Page not found"));
    assert!(!body.contains("nowhere.html"));
}

#[tokio::test]
async fn unknown_blocks_are_not_found() {
    let app = app(false).await;
    let request = Request::builder()
        .uri("/docs/intro")
        .header("X-Render-Block", "missing")
        .body(Body::empty())
        .expect("request");
    let (status, _, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn purge_drops_matching_entries() {
    let app = app(false).await;
    send(&app.router, get("/")).await;
    send(&app.router, get("/docs/intro")).await;

    let purge = Request::builder()
        .method(Method::DELETE)
        .uri("/_cache?path=/docs/**")
        .body(Body::empty())
        .expect("request");
    let (status, _, body) = send(&app.router, purge).await;
    assert_eq!(status, StatusCode::OK);
    insta::assert_snapshot!(body, @r#"{"pattern":"/docs/**","purged":1}"#);

    let (_, headers, _) = send(&app.router, get("/docs/intro")).await;
    assert_eq!(headers[CACHE_STATUS_HEADER], "MISS");
    let (_, headers, _) = send(&app.router, get("/")).await;
    assert_eq!(headers[CACHE_STATUS_HEADER], "HIT");
}

#[tokio::test]
async fn invalid_purge_patterns_are_rejected() {
    let app = app(false).await;
    let purge = Request::builder()
        .method(Method::DELETE)
        .uri("/_cache?path=%5B")
        .body(Body::empty())
        .expect("request");
    let (status, _, _) = send(&app.router, purge).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn component_previews_go_through_the_cache_middleware() {
    let app = app(false).await;

    let (status, headers, body) = send(&app.router, get("/_components/badge?text=new")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[CACHE_STATUS_HEADER], "MISS");
    assert_eq!(body, "<span class=\"badge\">new</span>");

    let (_, headers, cached) = send(&app.router, get("/_components/badge?text=new")).await;
    assert_eq!(headers[CACHE_STATUS_HEADER], "HIT");
    assert_eq!(cached, body);

    let (status, _, _) = send(&app.router, get("/_components/badge")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn previews_larger_than_the_body_limit_are_served_uncached() {
    let app = app_with_body_limit(false, 32).await;
    let uri = format!("/_components/badge?text={}", "x".repeat(40));

    for _ in 0..2 {
        let (status, headers, body) = send(&app.router, get(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers.get(CACHE_STATUS_HEADER).is_none());
        assert_eq!(body, format!("<span class=\"badge\">{}</span>", "x".repeat(40)));
    }
}

#[tokio::test]
async fn request_ids_are_echoed() {
    let app = app(false).await;

    let (_, headers, _) = send(&app.router, get("/_health")).await;
    let generated = headers["x-request-id"].to_str().expect("ascii");
    assert!(uuid::Uuid::parse_str(generated).is_ok());

    let request = Request::builder()
        .uri("/_health")
        .header("x-request-id", "edge-42")
        .body(Body::empty())
        .expect("request");
    let (status, headers, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(headers["x-request-id"], "edge-42");
}
