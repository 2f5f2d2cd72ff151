use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
    middleware,
    routing::get,
};
use bytes::Bytes;
use metrics_util::debugging::DebuggingRecorder;
use tessera::application::backends::{BackendError, CacheBackend, StorageBackend};
use tessera::application::components::ComponentRegistry;
use tessera::application::render::{RenderConfig, Renderer};
use tessera::application::resolver::{
    Backfills, CacheTier, ResolverConfig, StorageResolver, StorageTier, TierStrategy,
};
use tessera::cache::{
    CacheConfig, CacheState, ResponseCache, RuleBook, RuleSet, RuleSpec, response_cache_layer,
};
use tessera::domain::{RenderContext, Tier};
use tessera::infra::memory_cache::MemoryCache;
use tessera::infra::storage::{FsStorage, MemoryStorage};
use tower::ServiceExt;

/// Cache backend that is always down.
struct Unreachable;

#[async_trait]
impl CacheBackend for Unreachable {
    async fn get(&self, _key: &str) -> Result<Option<Bytes>, BackendError> {
        Err(BackendError::unavailable("unreachable", "connection refused"))
    }

    async fn set(
        &self,
        _key: &str,
        _value: Bytes,
        _ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        Err(BackendError::unavailable("unreachable", "connection refused"))
    }

    async fn delete_matching(&self, _pattern: &str) -> Result<usize, BackendError> {
        Err(BackendError::unavailable("unreachable", "connection refused"))
    }
}

fn response_cache(backend: Arc<dyn CacheBackend>) -> Arc<ResponseCache> {
    let rules = RuleSet::compile(&[RuleSpec::new("/**", 60)]).expect("rules");
    Arc::new(ResponseCache::new(
        backend,
        &CacheConfig::default(),
        Arc::new(RuleBook::new(rules)),
    ))
}

async fn get_all(app: &Router, uris: &[&str]) {
    for uri in uris {
        let request = Request::builder()
            .method(Method::GET)
            .uri(*uri)
            .body(Body::empty())
            .expect("request should build");
        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond");
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn render_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    // Resolver: filesystem hit, backfill into the hot tier, then a negative hit.
    let hot: Arc<dyn CacheBackend> =
        Arc::new(MemoryCache::new(NonZeroUsize::new(64).expect("non-zero")));
    let files =
        Arc::new(MemoryStorage::new("files").with_object("default/page.html", "<p>[[ n ]]</p>"));
    let tiers: Vec<Arc<dyn TierStrategy>> = vec![
        Arc::new(CacheTier::new(Arc::clone(&hot), None, 1024)),
        Arc::new(StorageTier::new(files, Tier::Filesystem)),
    ];
    let resolver = Arc::new(StorageResolver::new(
        tiers,
        Some(Arc::clone(&hot)),
        Backfills::new(),
        ResolverConfig::default(),
    ));
    resolver.resolve("page.html", None).await.expect("resolve");
    resolver.backfills().settle().await;
    assert!(resolver.resolve("ghost.html", None).await.is_err());
    assert!(resolver.resolve("ghost.html", None).await.is_err());

    // Render timings.
    let renderer = Renderer::new(Arc::clone(&resolver), RenderConfig::default()).expect("renderer");
    renderer
        .render_context(RenderContext::new("page.html").with_variable("n", 1))
        .await
        .expect("render");

    // Component validation.
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("chip.toml"), "template = \"<i>chip</i>\"\n").expect("write");
    let storage: Arc<dyn StorageBackend> = Arc::new(FsStorage::new(dir.path()));
    let registry = ComponentRegistry::new(dir.path(), storage, None, renderer.engine().clone());
    registry.discover().await.expect("discover");
    assert!(registry.validate("chip").await.is_valid());

    // Response cache hit/miss/store through the middleware, plus backend errors.
    let healthy = Router::new()
        .route("/tags/{slug}", get(|| async { "<p>tag</p>" }))
        .layer(middleware::from_fn_with_state(
            CacheState {
                cache: response_cache(Arc::clone(&hot)),
                body_limit: 4096,
            },
            response_cache_layer,
        ));
    get_all(&healthy, &["/tags/one", "/tags/one", "/tags/two"]).await;

    let broken = Router::new()
        .route("/tags/{slug}", get(|| async { "<p>tag</p>" }))
        .layer(middleware::from_fn_with_state(
            CacheState {
                cache: response_cache(Arc::new(Unreachable)),
                body_limit: 4096,
            },
            response_cache_layer,
        ));
    get_all(&broken, &["/tags/one"]).await;

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "tessera_cache_hit_total",
        "tessera_cache_miss_total",
        "tessera_cache_store_total",
        "tessera_cache_backend_error_total",
        "tessera_resolver_tier_hit_total",
        "tessera_resolver_backfill_total",
        "tessera_resolver_negative_hit_total",
        "tessera_component_validate_total",
        "tessera_render_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
