use std::{path::Path, process, sync::Arc};

use tessera::{
    application::{
        backends::{CacheBackend, StorageBackend},
        components::ComponentRegistry,
        error::AppError,
        render::{RenderConfig, Renderer, TemplateEngine},
        resolver::{
            Backfills, CacheTier, ResolverConfig, StorageResolver, StorageTier, TierStrategy,
        },
    },
    cache::{CacheConfig, ResponseCache, RuleBook, RuleSet},
    config,
    domain::{Tier, ValidationResult},
    infra::{
        error::InfraError,
        http::{self, HttpState},
        memory_cache::MemoryCache,
        storage::{FsStorage, HttpObjectStorage},
        telemetry,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .clone()
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(cli_args, settings).await,
        config::Command::Components(args) => match args.command {
            config::ComponentsCommand::Check(_) => run_components_check(settings).await,
        },
    }
}

struct ApplicationContext {
    renderer: Arc<Renderer>,
    resolver: Arc<StorageResolver>,
    response_cache: Arc<ResponseCache>,
    rules: Arc<RuleBook>,
    components: Option<Arc<ComponentRegistry>>,
}

async fn run_serve(cli_args: config::CliArgs, settings: config::Settings) -> Result<(), AppError> {
    let app = build_application_context(&settings).await?;

    #[cfg(unix)]
    let reload_handle = spawn_reload_listener(cli_args, &app)?;
    #[cfg(not(unix))]
    drop(cli_args);

    let state = HttpState {
        renderer: Arc::clone(&app.renderer),
        stream_pages: settings.http.stream_pages,
        body_limit: settings.cache.body_limit_bytes.get(),
    };
    let result = serve_http(&settings, state).await;

    #[cfg(unix)]
    {
        reload_handle.abort();
        let _ = reload_handle.await;
    }

    app.resolver
        .backfills()
        .shutdown(settings.storage.backfill_grace)
        .await;

    result
}

async fn run_components_check(settings: config::Settings) -> Result<(), AppError> {
    let directory = settings.components.directory.clone().ok_or_else(|| {
        AppError::validation("components.directory is not configured")
    })?;
    let engine = TemplateEngine::new(&RenderConfig::from(&settings.render))
        .map_err(|err| InfraError::configuration(format!("invalid template syntax: {err}")))?;
    let storage: Arc<dyn StorageBackend> = Arc::new(FsStorage::new(&directory));
    let registry = ComponentRegistry::new(&directory, storage, None, engine);
    registry.discover().await?;

    let results = registry.validate_all().await;
    let mut failures = 0usize;
    for (name, result) in &results {
        match result {
            ValidationResult::Valid => {
                info!(target = "tessera::components", component = %name, "valid");
            }
            ValidationResult::NotFound => {
                failures += 1;
                error!(target = "tessera::components", component = %name, "not found");
            }
            ValidationResult::CompilationError { message, position } => {
                failures += 1;
                let (line, column) = position
                    .as_ref()
                    .map(|pos| (pos.line, pos.column.unwrap_or(0)))
                    .unwrap_or((0, 0));
                error!(
                    target = "tessera::components",
                    component = %name,
                    line,
                    column,
                    message = %message,
                    "invalid component"
                );
            }
        }
    }

    info!(
        target = "tessera::components",
        directory = %directory.display(),
        checked = results.len(),
        failures,
        "component check finished"
    );

    if failures > 0 {
        return Err(AppError::validation(format!(
            "{failures} of {} components failed validation",
            results.len()
        )));
    }
    Ok(())
}

async fn build_application_context(
    settings: &config::Settings,
) -> Result<ApplicationContext, AppError> {
    let hot: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new(settings.cache.max_entries));

    let mut tiers: Vec<Arc<dyn TierStrategy>> = vec![Arc::new(CacheTier::new(
        Arc::clone(&hot),
        settings.storage.source_ttl,
        settings.storage.cache_inline_limit_bytes,
    ))];
    if let Some(object) = object_store(&settings.storage)? {
        tiers.push(Arc::new(StorageTier::new(object, Tier::Storage)));
    }
    tiers.push(Arc::new(StorageTier::new(
        Arc::new(FsStorage::new(&settings.storage.templates_dir)),
        Tier::Filesystem,
    )));

    let resolver = Arc::new(StorageResolver::new(
        tiers,
        Some(Arc::clone(&hot)),
        Backfills::new(),
        ResolverConfig {
            default_variant: settings.render.default_variant.clone(),
            negative_ttl: settings.storage.negative_ttl,
        },
    ));

    let rules = RuleSet::compile(&settings.cache.rules)
        .map_err(|err| InfraError::configuration(err.to_string()))?;
    let rules = Arc::new(RuleBook::new(rules));
    let response_cache = Arc::new(ResponseCache::new(
        Arc::clone(&hot),
        &CacheConfig::from(&settings.cache),
        Arc::clone(&rules),
    ));

    let renderer = Renderer::new(Arc::clone(&resolver), RenderConfig::from(&settings.render))
        .map_err(|err| InfraError::configuration(format!("invalid template syntax: {err}")))?
        .with_cache(Arc::clone(&response_cache));

    let (renderer, components) = match settings.components.directory.as_deref() {
        Some(directory) => {
            let registry = Arc::new(build_registry(directory, &hot, renderer.engine()));
            let discovered = registry.discover().await?;
            info!(
                target = "tessera::components",
                directory = %directory.display(),
                components = discovered.len(),
                "component registry ready"
            );
            (
                renderer.with_components(Arc::clone(&registry)),
                Some(registry),
            )
        }
        None => (renderer, None),
    };

    Ok(ApplicationContext {
        renderer: Arc::new(renderer),
        resolver,
        response_cache,
        rules,
        components,
    })
}

fn build_registry(
    directory: &Path,
    hot: &Arc<dyn CacheBackend>,
    engine: &TemplateEngine,
) -> ComponentRegistry {
    let storage: Arc<dyn StorageBackend> = Arc::new(FsStorage::new(directory));
    ComponentRegistry::new(directory, storage, Some(Arc::clone(hot)), engine.clone())
}

fn object_store(
    storage: &config::StorageSettings,
) -> Result<Option<Arc<dyn StorageBackend>>, AppError> {
    if let Some(url) = storage.object_store_url.as_deref() {
        let backend = HttpObjectStorage::new(url).map_err(InfraError::from)?;
        return Ok(Some(Arc::new(backend)));
    }
    Ok(storage
        .object_store_dir
        .as_ref()
        .map(|dir| Arc::new(FsStorage::new(dir)) as Arc<dyn StorageBackend>))
}

/// On SIGHUP: reload configuration, swap the cache rules, drop cached
/// sources and responses, and rescan components.
#[cfg(unix)]
fn spawn_reload_listener(
    cli_args: config::CliArgs,
    app: &ApplicationContext,
) -> Result<tokio::task::JoinHandle<()>, AppError> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).map_err(InfraError::from)?;
    let resolver = Arc::clone(&app.resolver);
    let response_cache = Arc::clone(&app.response_cache);
    let rules = Arc::clone(&app.rules);
    let components = app.components.clone();

    Ok(tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!(target = "tessera::reload", "reload requested");
            match config::load(&cli_args) {
                Ok(settings) => match RuleSet::compile(&settings.cache.rules) {
                    Ok(set) => {
                        info!(
                            target = "tessera::reload",
                            rules = set.len(),
                            "cache rules replaced"
                        );
                        rules.replace(set);
                    }
                    Err(err) => {
                        warn!(
                            target = "tessera::reload",
                            error = %err,
                            "keeping previous cache rules"
                        );
                    }
                },
                Err(err) => {
                    warn!(target = "tessera::reload", error = %err, "configuration reload failed");
                }
            }

            match resolver.forget_all().await {
                Ok(removed) => {
                    info!(target = "tessera::reload", removed, "template sources dropped");
                }
                Err(err) => {
                    warn!(
                        target = "tessera::reload",
                        error = %err,
                        "failed to drop template sources"
                    );
                }
            }
            if let Err(err) = response_cache.purge("/**").await {
                warn!(target = "tessera::reload", error = %err, "failed to purge cached responses");
            }
            if let Some(registry) = &components {
                match registry.discover().await {
                    Ok(found) => info!(
                        target = "tessera::reload",
                        components = found.len(),
                        "components rescanned"
                    ),
                    Err(err) => {
                        warn!(target = "tessera::reload", error = %err, "component rescan failed");
                    }
                }
            }
        }
    }))
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(target = "tessera::http", addr = %settings.server.addr, "listening");

    let grace = settings.server.graceful_shutdown;
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal(grace))
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    info!(target = "tessera::http", "server stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM. In-flight requests then get `grace` to
/// finish before the process is forced down.
async fn shutdown_signal(grace: std::time::Duration) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target = "tessera::http", error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(target = "tessera::http", error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!(target = "tessera::http", grace_seconds = grace.as_secs(), "shutdown signal received");
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        warn!(target = "tessera::http", "graceful shutdown timed out");
        process::exit(1);
    });
}
