//! The render façade: response cache lookup, then one of the four strategies.

use std::io;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::header::{CONTENT_TYPE, VARY};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use futures::StreamExt;
use metrics::histogram;
use minijinja::Value;
use tracing::{debug, instrument};

use super::config::RenderConfig;
use super::context::{TemplateVars, prepare};
use super::engine::TemplateEngine;
use super::fragment::unwrap_document;
use super::sanitize::SecurePolicy;
use super::session::{RenderSession, SourceFetcher};
use super::stream::{ChunkStream, chunked, spawn_render};
use super::types::{CacheStatus, RenderBody, RenderOutput, RenderRequest, RenderResponse};
use super::RenderError;
use crate::application::components::{COMPONENT_PREFIX, ComponentRegistry};
use crate::application::resolver::{ResolveError, StorageResolver};
use crate::cache::{CachedResponse, ResponseCache};
use crate::domain::{RenderContext, RenderMode, ValidationResult};

const METRIC_RENDER_MS: &str = "tessera_render_ms";

const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

pub struct Renderer {
    resolver: Arc<StorageResolver>,
    components: Option<Arc<ComponentRegistry>>,
    cache: Option<Arc<ResponseCache>>,
    engine: TemplateEngine,
    policy: SecurePolicy,
    config: RenderConfig,
}

impl Renderer {
    pub fn new(
        resolver: Arc<StorageResolver>,
        config: RenderConfig,
    ) -> Result<Self, minijinja::Error> {
        Ok(Self {
            resolver,
            components: None,
            cache: None,
            engine: TemplateEngine::new(&config)?,
            policy: SecurePolicy::new(&config.secure_tags, &config.secure_attributes),
            config,
        })
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_components(mut self, registry: Arc<ComponentRegistry>) -> Self {
        self.components = Some(registry);
        self
    }

    pub fn engine(&self) -> &TemplateEngine {
        &self.engine
    }

    pub fn resolver(&self) -> &Arc<StorageResolver> {
        &self.resolver
    }

    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.cache.as_ref()
    }

    pub fn components(&self) -> Option<&Arc<ComponentRegistry>> {
        self.components.as_ref()
    }

    /// Serve `request` from the response cache or render it.
    ///
    /// Render mode must be reflected in the configured vary headers (or the
    /// URL) for different modes of one URL to be cached apart.
    #[instrument(
        skip_all,
        fields(template = %request.context.template, mode = request.context.mode.label())
    )]
    pub async fn render(&self, request: RenderRequest) -> Result<RenderResponse, RenderError> {
        let RenderRequest {
            method,
            url,
            headers,
            context,
        } = request;
        let chunk_size = self.chunk_size(&context.mode);

        let Some(cache) = self.cache.as_ref().filter(|cache| cache.is_enabled()) else {
            return Ok(RenderResponse {
                status: StatusCode::OK,
                headers: self.miss_headers(),
                body: self.render_context(context).await?,
                cache: CacheStatus::Bypass,
            });
        };

        let key = cache.compute_key(&method, &url, &headers);
        if let Some(cached) = cache.lookup(&key).await {
            let status = cached.status_code();
            let headers = cached.header_map();
            let body = match chunk_size {
                Some(size) => RenderBody::Stream(chunked(cached.body, size)),
                None => RenderBody::Full(cached.body),
            };
            return Ok(RenderResponse {
                status,
                headers,
                body,
                cache: CacheStatus::Hit,
            });
        }

        let headers = self.miss_headers();
        let body = self.render_context(context).await?;
        let decision = cache.cacheability(&method, &url, StatusCode::OK);
        let body = match body {
            body if !decision.cacheable => body,
            RenderBody::Full(bytes) => {
                let cached = CachedResponse::new(StatusCode::OK, &headers, bytes.clone());
                cache.store(&key, &url, &cached, decision.ttl).await;
                RenderBody::Full(bytes)
            }
            RenderBody::Stream(stream) => RenderBody::Stream(store_on_completion(
                stream,
                Arc::clone(cache),
                PendingEntry {
                    key,
                    url,
                    headers: headers.clone(),
                    ttl: decision.ttl,
                },
            )),
        };

        Ok(RenderResponse {
            status: StatusCode::OK,
            headers,
            body,
            cache: CacheStatus::Miss,
        })
    }

    /// Render without consulting the response cache.
    pub async fn render_context(
        &self,
        context: RenderContext,
    ) -> Result<RenderOutput, RenderError> {
        let started = Instant::now();
        let label = context.mode.label();
        let output = self.execute(context).await;
        histogram!(METRIC_RENDER_MS, "mode" => label)
            .record(started.elapsed().as_secs_f64() * 1000.0);
        if let Err(err) = &output {
            debug!(mode = label, kind = err.kind(), error = %err, "render failed");
        }
        output
    }

    async fn execute(&self, context: RenderContext) -> Result<RenderOutput, RenderError> {
        let RenderContext {
            template,
            variant,
            variables,
            mode,
            secure,
        } = context;

        let variables = match template.strip_prefix(COMPONENT_PREFIX) {
            Some(component) => {
                let registry = self
                    .components
                    .as_ref()
                    .ok_or_else(|| RenderError::not_found(template.clone()))?;
                registry.bind_props(component, &variables).await?
            }
            None => variables,
        };

        let mut vars = prepare(&variables, self.config.context_validation, &self.policy)?;
        insert_mode_flags(&mut vars, &mode);
        let ctx = Value::from(vars);

        let block = match &mode {
            RenderMode::Block(name) => Some(name.clone()),
            _ => None,
        };
        let session = RenderSession::new(self.engine.clone(), template.clone(), variant)
            .with_block(block);
        let fetcher = Fetcher {
            resolver: &self.resolver,
            components: self.components.as_deref(),
        };

        match mode {
            RenderMode::Standard => {
                let html = session
                    .run(&fetcher, |env| env.get_template(&template)?.render(&ctx))
                    .await?;
                Ok(RenderBody::Full(self.finish(html, secure)))
            }
            RenderMode::Fragment => {
                let html = session
                    .run(&fetcher, |env| env.get_template(&template)?.render(&ctx))
                    .await?;
                let fragment = unwrap_document(&template, &html)?;
                Ok(RenderBody::Full(self.finish(fragment, secure)))
            }
            RenderMode::Block(name) => {
                let html = session
                    .run(&fetcher, |env| {
                        let compiled = env.get_template(&template)?;
                        let mut captured = compiled.render_captured_to(&ctx, io::sink())?;
                        captured.with_state_mut(|state| state.render_block(&name))
                    })
                    .await?;
                Ok(RenderBody::Full(self.finish(html, secure)))
            }
            RenderMode::Stream { chunk_size } => {
                let size = chunk_size.unwrap_or(self.config.chunk_size);
                if secure {
                    let html = session
                        .run(&fetcher, |env| env.get_template(&template)?.render(&ctx))
                        .await?;
                    return Ok(RenderBody::Stream(chunked(self.finish(html, true), size)));
                }
                // Dry run: pulls every dependency into the session so the
                // streaming pass never needs to suspend for storage.
                session
                    .run(&fetcher, |env| {
                        env.get_template(&template)?
                            .render_captured_to(&ctx, io::sink())
                            .map(|_| ())
                    })
                    .await?;
                Ok(RenderBody::Stream(spawn_render(session, ctx, size)))
            }
        }
    }

    fn finish(&self, html: String, secure: bool) -> Bytes {
        if secure {
            Bytes::from(self.policy.clean(&html))
        } else {
            Bytes::from(html)
        }
    }

    fn chunk_size(&self, mode: &RenderMode) -> Option<NonZeroUsize> {
        match mode {
            RenderMode::Stream { chunk_size } => Some(chunk_size.unwrap_or(self.config.chunk_size)),
            _ => None,
        }
    }

    fn miss_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(HTML_CONTENT_TYPE));
        if let Some(cache) = &self.cache
            && !cache.vary().is_empty()
            && let Ok(value) = HeaderValue::from_str(&cache.vary().header_value())
        {
            headers.insert(VARY, value);
        }
        headers
    }
}

fn insert_mode_flags(vars: &mut TemplateVars, mode: &RenderMode) {
    vars.insert(
        "fragment".to_string(),
        Value::from(matches!(mode, RenderMode::Fragment)),
    );
    let block = match mode {
        RenderMode::Block(name) => Value::from(name.as_str()),
        _ => Value::from(()),
    };
    vars.insert("block".to_string(), block);
}

struct Fetcher<'a> {
    resolver: &'a StorageResolver,
    components: Option<&'a ComponentRegistry>,
}

#[async_trait]
impl<'a> SourceFetcher for Fetcher<'a> {
    async fn fetch(
        &self,
        name: &str,
        variant: Option<&str>,
    ) -> Result<Option<String>, RenderError> {
        if let Some(component) = name.strip_prefix(COMPONENT_PREFIX) {
            let Some(registry) = self.components else {
                return Ok(None);
            };
            return match registry.validate(component).await {
                ValidationResult::NotFound => Ok(None),
                ValidationResult::CompilationError { message, position } => {
                    Err(RenderError::Compilation {
                        template: name.to_string(),
                        message,
                        position,
                    })
                }
                ValidationResult::Valid => Ok(registry.template(component).await?),
            };
        }

        match self.resolver.resolve(name, variant).await {
            Ok(source) => source.text().map(Some).map_err(|err| RenderError::Compilation {
                template: name.to_string(),
                message: format!("template is not valid UTF-8: {err}"),
                position: None,
            }),
            Err(ResolveError::NotFound(_) | ResolveError::InvalidName(_)) => Ok(None),
        }
    }
}

struct PendingEntry {
    key: String,
    url: String,
    headers: HeaderMap,
    ttl: Duration,
}

/// Pass chunks through and cache the whole body once the stream ends
/// cleanly. Dropped or failed streams are never cached.
fn store_on_completion(
    mut stream: ChunkStream,
    cache: Arc<ResponseCache>,
    entry: PendingEntry,
) -> ChunkStream {
    Box::pin(async_stream::stream! {
        let mut collected = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    collected.extend_from_slice(&chunk);
                    yield Ok(chunk);
                }
                Err(err) => {
                    yield Err(err);
                    return;
                }
            }
        }
        let cached = CachedResponse::new(StatusCode::OK, &entry.headers, Bytes::from(collected));
        cache.store(&entry.key, &entry.url, &cached, entry.ttl).await;
    })
}
