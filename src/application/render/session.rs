//! One render's view of template sources.
//!
//! minijinja loads dependent templates (`extends`, `include`, `import`)
//! synchronously while the storage tiers are async. The session bridges the
//! two: its loader serves whatever has been fetched so far and records every
//! other name it is asked for. [`RenderSession::run`] then fetches the
//! recorded names and repeats the operation until nothing new is requested.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use minijinja::{Environment, ErrorKind};
use tracing::debug;

use super::RenderError;
use super::engine::{TemplateEngine, map_error};
use crate::cache::lock::mutex_lock;

const SOURCE: &str = "application::render::session";

/// Upper bound on fetch rounds for one render.
const MAX_ROUNDS: usize = 16;

/// Async source of template text.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// `Ok(None)` when no tier knows `name`.
    async fn fetch(&self, name: &str, variant: Option<&str>)
    -> Result<Option<String>, RenderError>;
}

#[derive(Debug, Default)]
struct Loaded {
    sources: HashMap<String, String>,
    /// Requested by the loader, not fetched yet.
    pending: BTreeSet<String>,
    /// Fetched and known not to exist.
    absent: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct RenderSession {
    engine: TemplateEngine,
    root: String,
    variant: Option<String>,
    block: Option<String>,
    loaded: Arc<Mutex<Loaded>>,
}

impl RenderSession {
    pub fn new(engine: TemplateEngine, root: impl Into<String>, variant: Option<String>) -> Self {
        Self {
            engine,
            root: root.into(),
            variant,
            block: None,
            loaded: Arc::default(),
        }
    }

    pub fn with_block(mut self, block: Option<String>) -> Self {
        self.block = block;
        self
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Names of all templates fetched so far.
    pub fn loaded_names(&self) -> Vec<String> {
        let loaded = mutex_lock(&self.loaded, SOURCE, "loaded_names");
        let mut names: Vec<String> = loaded.sources.keys().cloned().collect();
        names.sort();
        names
    }

    /// An environment whose loader serves the sources fetched so far.
    pub fn environment(&self) -> Environment<'static> {
        let mut env = self.engine.environment();
        let loaded = Arc::clone(&self.loaded);
        env.set_loader(move |name| {
            let mut loaded = mutex_lock(&loaded, SOURCE, "loader");
            if let Some(source) = loaded.sources.get(name) {
                return Ok(Some(source.clone()));
            }
            if !loaded.absent.contains(name) {
                loaded.pending.insert(name.to_string());
            }
            Ok(None)
        });
        env
    }

    /// Run `op` until it stops asking for templates that have not been fetched.
    pub async fn run<T, F>(&self, fetcher: &dyn SourceFetcher, op: F) -> Result<T, RenderError>
    where
        F: Fn(&Environment<'static>) -> Result<T, minijinja::Error>,
    {
        self.fetch(fetcher, vec![self.root.clone()]).await?;
        if self.is_absent(&self.root) {
            return Err(RenderError::not_found(self.root.clone()));
        }

        for round in 0..MAX_ROUNDS {
            let outcome = {
                let env = self.environment();
                op(&env)
            };
            let pending = self.take_pending();
            if pending.is_empty() {
                return outcome.map_err(|err| self.map_error(&err));
            }
            debug!(template = %self.root, round, ?pending, "fetching dependent templates");
            self.fetch(fetcher, pending).await?;
        }

        Err(RenderError::runtime(
            self.root.clone(),
            "too many nested template references",
        ))
    }

    /// Translate an engine error raised by an environment of this session.
    pub fn map_error(&self, err: &minijinja::Error) -> RenderError {
        match err.kind() {
            ErrorKind::UnknownBlock => RenderError::BlockNotFound {
                template: self.root.clone(),
                block: self.block.clone().unwrap_or_default(),
            },
            ErrorKind::TemplateNotFound => {
                let loaded = mutex_lock(&self.loaded, SOURCE, "map_error");
                let missing = loaded
                    .absent
                    .iter()
                    .min()
                    .cloned()
                    .unwrap_or_else(|| self.root.clone());
                RenderError::not_found(missing)
            }
            _ => {
                let name = err.name().unwrap_or(&self.root);
                let source = mutex_lock(&self.loaded, SOURCE, "map_error")
                    .sources
                    .get(name)
                    .cloned();
                map_error(&self.root, err, source.as_deref())
            }
        }
    }

    async fn fetch(
        &self,
        fetcher: &dyn SourceFetcher,
        names: Vec<String>,
    ) -> Result<(), RenderError> {
        let variant = self.variant.as_deref();
        let results = join_all(names.iter().map(|name| fetcher.fetch(name, variant))).await;

        let mut loaded = mutex_lock(&self.loaded, SOURCE, "fetch");
        for (name, result) in names.into_iter().zip(results) {
            match result? {
                Some(source) => {
                    loaded.sources.insert(name, source);
                }
                None => {
                    debug!(template = %name, "dependent template not found");
                    loaded.absent.insert(name);
                }
            }
        }
        Ok(())
    }

    fn take_pending(&self) -> Vec<String> {
        let mut loaded = mutex_lock(&self.loaded, SOURCE, "take_pending");
        std::mem::take(&mut loaded.pending).into_iter().collect()
    }

    fn is_absent(&self, name: &str) -> bool {
        mutex_lock(&self.loaded, SOURCE, "is_absent")
            .absent
            .contains(name)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::application::render::config::RenderConfig;

    struct MapFetcher {
        templates: HashMap<&'static str, &'static str>,
        fetches: AtomicUsize,
    }

    impl MapFetcher {
        fn new(templates: &[(&'static str, &'static str)]) -> Self {
            Self {
                templates: templates.iter().copied().collect(),
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SourceFetcher for MapFetcher {
        async fn fetch(
            &self,
            name: &str,
            _variant: Option<&str>,
        ) -> Result<Option<String>, RenderError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.templates.get(name).map(|source| source.to_string()))
        }
    }

    fn session(root: &str) -> RenderSession {
        let engine = TemplateEngine::new(&RenderConfig::default()).expect("engine");
        RenderSession::new(engine, root, None)
    }

    fn render(env: &Environment<'static>, name: &str) -> Result<String, minijinja::Error> {
        env.get_template(name)?.render(json!({"who": "you"}))
    }

    #[tokio::test]
    async fn nested_templates_are_fetched_on_demand() {
        let fetcher = MapFetcher::new(&[
            (
                "page.html",
                r#"[% extends "base.html" %][% block body %]hi [[ who ]][% endblock %]"#,
            ),
            (
                "base.html",
                r#"<main>[% block body %][% endblock %][% include "footer.html" %]</main>"#,
            ),
            ("footer.html", "<footer/>"),
        ]);
        let session = session("page.html");
        let out = session
            .run(&fetcher, |env| render(env, "page.html"))
            .await
            .expect("render");
        assert_eq!(out, "<main>hi you<footer/></main>");
        assert_eq!(
            session.loaded_names(),
            vec!["base.html", "footer.html", "page.html"]
        );
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn ignore_missing_include_stays_optional() {
        let fetcher = MapFetcher::new(&[(
            "page.html",
            r#"a[% include "nope.html" ignore missing %]b"#,
        )]);
        let session = session("page.html");
        let out = session
            .run(&fetcher, |env| render(env, "page.html"))
            .await
            .expect("render");
        assert_eq!(out, "ab");
    }

    #[tokio::test]
    async fn missing_root_is_not_found() {
        let fetcher = MapFetcher::new(&[]);
        let err = session("ghost.html")
            .run(&fetcher, |env| render(env, "ghost.html"))
            .await
            .expect_err("missing");
        assert_eq!(err, RenderError::not_found("ghost.html"));
    }

    #[tokio::test]
    async fn missing_include_names_the_include() {
        let fetcher = MapFetcher::new(&[("page.html", r#"[% include "gone.html" %]"#)]);
        let err = session("page.html")
            .run(&fetcher, |env| render(env, "page.html"))
            .await
            .expect_err("missing");
        assert_eq!(err, RenderError::not_found("gone.html"));
    }

    #[tokio::test]
    async fn self_include_is_bounded() {
        let fetcher = MapFetcher::new(&[("loop.html", r#"[% include "loop.html" %]"#)]);
        let err = session("loop.html")
            .run(&fetcher, |env| render(env, "loop.html"))
            .await
            .expect_err("recursion");
        assert!(matches!(err, RenderError::Runtime { .. }));
    }
}
