//! End-to-end render tests: resolver → engine → response cache.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, StatusCode, header::VARY};
use futures::StreamExt;
use tessera::application::backends::CacheBackend;
use tessera::application::render::{
    CacheStatus, ContextValidation, RenderBody, RenderConfig, RenderError, RenderRequest,
    Renderer,
};
use tessera::application::resolver::{
    Backfills, ResolverConfig, StorageResolver, StorageTier, TierStrategy,
};
use tessera::cache::{CacheConfig, ResponseCache, RuleBook, RuleSet, RuleSpec};
use tessera::domain::{RenderContext, RenderMode, Tier};
use tessera::infra::memory_cache::MemoryCache;
use tessera::infra::storage::MemoryStorage;

const LAYOUT: &str = "<!doctype html><html><head><title>[[ title ]]</title></head>\
<body>[% block content %]default[% endblock %]</body></html>";

struct Harness {
    storage: Arc<MemoryStorage>,
    cache: Arc<ResponseCache>,
    renderer: Renderer,
}

fn resolver(storage: &Arc<MemoryStorage>) -> Arc<StorageResolver> {
    let tiers: Vec<Arc<dyn TierStrategy>> = vec![Arc::new(StorageTier::new(
        storage.clone(),
        Tier::Filesystem,
    ))];
    Arc::new(StorageResolver::new(
        tiers,
        None,
        Backfills::new(),
        ResolverConfig::default(),
    ))
}

fn harness(config: RenderConfig) -> Harness {
    let storage = Arc::new(
        MemoryStorage::new("templates")
            .with_object("default/layout.html", LAYOUT)
            .with_object(
                "default/page.html",
                "[% extends \"layout.html\" %][% block content %]<p>Hello [[ name ]]</p>[% endblock %]",
            )
            .with_object(
                "default/panels.html",
                "<div>[% block alpha %]ALPHA [[ name ]][% endblock %]</div>\
<aside>[% block beta %]BETA[% endblock %]</aside>",
            ),
    );
    let backend: Arc<dyn CacheBackend> =
        Arc::new(MemoryCache::new(NonZeroUsize::new(64).expect("non-zero")));
    let rules = RuleSet::compile(&[RuleSpec::new("/**", 60)]).expect("rules");
    let cache = Arc::new(ResponseCache::new(
        backend,
        &CacheConfig::default(),
        Arc::new(RuleBook::new(rules)),
    ));
    let renderer = Renderer::new(resolver(&storage), config)
        .expect("renderer")
        .with_cache(cache.clone());
    Harness {
        storage,
        cache,
        renderer,
    }
}

fn page(mode: RenderMode) -> RenderContext {
    RenderContext::new("page.html")
        .with_variable("title", "Greeting")
        .with_variable("name", "Ada")
        .with_mode(mode)
}

async fn body_text(body: RenderBody) -> String {
    let bytes = body.collect().await.expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf8")
}

#[tokio::test]
async fn standard_render_resolves_layouts() {
    let h = harness(RenderConfig::default());
    let body = h
        .renderer
        .render_context(page(RenderMode::Standard))
        .await
        .expect("render");
    let html = body_text(body).await;
    assert!(html.starts_with("<!doctype html>"));
    assert!(html.contains("<title>Greeting</title>"));
    assert!(html.contains("<p>Hello Ada</p>"));
}

#[tokio::test]
async fn fragment_render_drops_the_document_shell() {
    let h = harness(RenderConfig::default());
    let body = h
        .renderer
        .render_context(page(RenderMode::Fragment))
        .await
        .expect("render");
    insta::assert_snapshot!(body_text(body).await, @"<p>Hello Ada</p>");
}

#[tokio::test]
async fn block_render_returns_only_that_block() {
    let h = harness(RenderConfig::default());
    let context = RenderContext::new("panels.html")
        .with_variable("name", "Ada")
        .with_mode(RenderMode::Block("alpha".to_string()));
    let html = body_text(h.renderer.render_context(context).await.expect("render")).await;
    assert_eq!(html, "ALPHA Ada");
    assert!(!html.contains("BETA"));
}

#[tokio::test]
async fn unknown_block_is_reported() {
    let h = harness(RenderConfig::default());
    let context =
        RenderContext::new("panels.html").with_mode(RenderMode::Block("gamma".to_string()));
    let err = h
        .renderer
        .render_context(context)
        .await
        .expect_err("missing block");
    assert_eq!(
        err,
        RenderError::BlockNotFound {
            template: "panels.html".to_string(),
            block: "gamma".to_string(),
        }
    );
}

#[tokio::test]
async fn stream_render_emits_fixed_size_chunks() {
    let h = harness(RenderConfig::default());
    h.storage.insert("default/big.html", "x".repeat(10_000));

    let standard = h
        .renderer
        .render_context(RenderContext::new("big.html"))
        .await
        .expect("standard")
        .collect()
        .await
        .expect("bytes");

    let context = RenderContext::new("big.html").with_mode(RenderMode::Stream {
        chunk_size: NonZeroUsize::new(1000),
    });
    let RenderBody::Stream(stream) = h.renderer.render_context(context).await.expect("stream")
    else {
        panic!("expected a stream body");
    };
    let chunks: Vec<_> = stream.collect().await;
    assert_eq!(chunks.len(), 10);
    let mut joined = Vec::new();
    for chunk in chunks {
        let chunk = chunk.expect("chunk");
        assert_eq!(chunk.len(), 1000);
        joined.extend_from_slice(&chunk);
    }
    assert_eq!(joined, standard.to_vec());
}

#[tokio::test]
async fn missing_template_is_not_found() {
    let h = harness(RenderConfig::default());
    let err = h
        .renderer
        .render_context(RenderContext::new("nope.html"))
        .await
        .expect_err("missing");
    assert_eq!(err, RenderError::not_found("nope.html"));
}

#[tokio::test]
async fn syntax_errors_name_the_template() {
    let h = harness(RenderConfig::default());
    h.storage.insert("default/broken.html", "line one\n[% if %]");
    let err = h
        .renderer
        .render_context(RenderContext::new("broken.html"))
        .await
        .expect_err("broken");
    match err {
        RenderError::Compilation {
            template, position, ..
        } => {
            assert_eq!(template, "broken.html");
            assert_eq!(position.map(|p| p.line), Some(2));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn undefined_variables_follow_the_strictness_flag() {
    let lenient = harness(RenderConfig::default());
    lenient.storage.insert("default/greet.html", "Hi [[ who ]]!");
    let html = body_text(
        lenient
            .renderer
            .render_context(RenderContext::new("greet.html"))
            .await
            .expect("lenient"),
    )
    .await;
    assert_eq!(html, "Hi !");

    let strict = harness(RenderConfig {
        strict_undefined: true,
        ..RenderConfig::default()
    });
    strict.storage.insert("default/greet.html", "Hi [[ who ]]!");
    let err = strict
        .renderer
        .render_context(RenderContext::new("greet.html"))
        .await
        .expect_err("strict");
    assert!(matches!(err, RenderError::Runtime { .. }), "{err:?}");
}

#[tokio::test]
async fn context_values_are_escaped_and_validated() {
    let h = harness(RenderConfig::default());
    let context = RenderContext::new("panels.html")
        .with_variable("name", "<b>bold</b>")
        .with_mode(RenderMode::Block("alpha".to_string()));
    let html = body_text(h.renderer.render_context(context).await.expect("render")).await;
    assert!(html.starts_with("ALPHA &lt;b&gt;bold&lt;"), "{html}");
    assert!(!html.contains("<b>"));

    let rejecting = harness(RenderConfig {
        context_validation: ContextValidation::Reject,
        ..RenderConfig::default()
    });
    let context = RenderContext::new("panels.html")
        .with_variable("name", "<script>alert(1)</script>")
        .with_mode(RenderMode::Block("alpha".to_string()));
    let err = rejecting
        .renderer
        .render_context(context)
        .await
        .expect_err("rejected");
    assert!(matches!(err, RenderError::InvalidContext { ref key, .. } if key == "name"));
}

#[tokio::test]
async fn sanitize_mode_renders_allowed_markup_consistently() {
    let h = harness(RenderConfig {
        context_validation: ContextValidation::Sanitize,
        ..RenderConfig::default()
    });
    let alpha = |name: &str| {
        RenderContext::new("panels.html")
            .with_variable("name", name)
            .with_mode(RenderMode::Block("alpha".to_string()))
    };

    let clean = body_text(
        h.renderer
            .render_context(alpha("<b>bold</b>"))
            .await
            .expect("clean"),
    )
    .await;
    assert_eq!(clean, "ALPHA <b>bold</b>");

    let mixed = body_text(
        h.renderer
            .render_context(alpha("<b>bold</b><script>x</script>"))
            .await
            .expect("mixed"),
    )
    .await;
    assert_eq!(mixed, "ALPHA <b>bold</b>");
}

#[tokio::test]
async fn secure_mode_strips_disallowed_markup() {
    let h = harness(RenderConfig::default());
    h.storage.insert(
        "default/raw.html",
        "<p onclick=\"x()\">ok</p><script>alert(1)</script>",
    );
    let html = body_text(
        h.renderer
            .render_context(RenderContext::new("raw.html").secure(true))
            .await
            .expect("render"),
    )
    .await;
    assert_eq!(html, "<p>ok</p>");
}

#[tokio::test]
async fn second_request_is_served_from_cache() {
    let h = harness(RenderConfig::default());
    let request = || RenderRequest::get("/page?name=Ada", page(RenderMode::Standard));

    let first = h.renderer.render(request()).await.expect("first");
    assert_eq!(first.cache, CacheStatus::Miss);
    assert_eq!(first.status, StatusCode::OK);
    assert!(first.headers.contains_key(VARY));
    let first_body = first.body.collect().await.expect("body");
    let reads = h.storage.total_reads();

    let second = h.renderer.render(request()).await.expect("second");
    assert_eq!(second.cache, CacheStatus::Hit);
    assert_eq!(second.body.collect().await.expect("body"), first_body);
    assert_eq!(h.storage.total_reads(), reads, "hit must not touch storage");
}

#[tokio::test]
async fn vary_headers_split_cache_entries() {
    let h = harness(RenderConfig::default());
    let with_accept = |value: &'static str| {
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static(value));
        RenderRequest::get("/page", page(RenderMode::Standard)).with_headers(headers)
    };

    let html = h.renderer.render(with_accept("text/html")).await.expect("html");
    assert_eq!(html.cache, CacheStatus::Miss);
    let json = h
        .renderer
        .render(with_accept("application/json"))
        .await
        .expect("json");
    assert_eq!(json.cache, CacheStatus::Miss);
    let again = h.renderer.render(with_accept("text/html")).await.expect("again");
    assert_eq!(again.cache, CacheStatus::Hit);
}

#[tokio::test]
async fn completed_streams_are_cached_and_abandoned_ones_are_not() {
    let h = harness(RenderConfig::default());
    h.storage.insert("default/big.html", "y".repeat(4096));
    let streamed = |url: &str| {
        RenderRequest::get(
            url,
            RenderContext::new("big.html").with_mode(RenderMode::Stream {
                chunk_size: NonZeroUsize::new(512),
            }),
        )
    };

    // Take one chunk and drop the rest.
    let response = h.renderer.render(streamed("/abandoned")).await.expect("render");
    let RenderBody::Stream(mut stream) = response.body else {
        panic!("expected a stream body");
    };
    stream.next().await.expect("first chunk").expect("ok");
    drop(stream);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let again = h.renderer.render(streamed("/abandoned")).await.expect("render");
    assert_eq!(again.cache, CacheStatus::Miss);

    let full = h.renderer.render(streamed("/complete")).await.expect("render");
    assert_eq!(full.cache, CacheStatus::Miss);
    assert_eq!(full.body.collect().await.expect("body").len(), 4096);
    let hit = h.renderer.render(streamed("/complete")).await.expect("render");
    assert_eq!(hit.cache, CacheStatus::Hit);
    let RenderBody::Stream(stream) = hit.body else {
        panic!("stream mode hits are re-chunked");
    };
    let chunks: Vec<_> = stream.collect().await;
    assert_eq!(chunks.len(), 8);
}

#[tokio::test]
async fn purge_forces_a_fresh_render() {
    let h = harness(RenderConfig::default());
    let request = || RenderRequest::get("/page", page(RenderMode::Standard));
    h.renderer.render(request()).await.expect("first");
    assert_eq!(
        h.renderer.render(request()).await.expect("hit").cache,
        CacheStatus::Hit
    );

    let purged = h.cache.purge("/page").await.expect("purge");
    assert_eq!(purged, 1);
    assert_eq!(
        h.renderer.render(request()).await.expect("miss").cache,
        CacheStatus::Miss
    );
}
