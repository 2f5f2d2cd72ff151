use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use dashmap::DashMap;
use metrics::counter;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;
use xxhash_rust::xxh3::xxh3_64;

use super::ComponentError;
use super::manifest::{Manifest, PropViolation};
use crate::application::backends::{CacheBackend, StorageBackend};
use crate::application::render::TemplateEngine;
use crate::cache::lock::{rw_read, rw_write};
use crate::domain::{ComponentDescriptor, ComponentStatus, Fingerprint, ValidationResult};

const SOURCE: &str = "application::components::registry";

const METRIC_VALIDATE: &str = "tessera_component_validate_total";

/// Manifest file extension.
const MANIFEST_EXTENSION: &str = "toml";

/// Hot-cache key prefix for component sources.
pub const SOURCE_CACHE_PREFIX: &str = "component:";

type Entry = Arc<RwLock<ComponentDescriptor>>;

/// Scans a directory of component manifests and serves their sources and
/// validation results.
///
/// The name → descriptor map is replaced wholesale on every scan. Individual
/// descriptors are refreshed in place when their source changes.
pub struct ComponentRegistry {
    root: PathBuf,
    storage: Arc<dyn StorageBackend>,
    cache: Option<Arc<dyn CacheBackend>>,
    engine: TemplateEngine,
    descriptors: RwLock<Arc<BTreeMap<String, Entry>>>,
    /// Name → (content hash, bytes).
    sources: DashMap<String, (u64, Bytes)>,
    /// Name → (content hash, result).
    validations: DashMap<String, (u64, ValidationResult)>,
}

/// What a stat-driven refresh learned about one component.
struct Current {
    hash: u64,
    /// Present when the refresh had to read the source.
    bytes: Option<Bytes>,
}

impl ComponentRegistry {
    /// `storage` must be rooted at `root`; it is used for every read and stat.
    pub fn new(
        root: impl Into<PathBuf>,
        storage: Arc<dyn StorageBackend>,
        cache: Option<Arc<dyn CacheBackend>>,
        engine: TemplateEngine,
    ) -> Self {
        Self {
            root: root.into(),
            storage,
            cache,
            engine,
            descriptors: RwLock::new(Arc::new(BTreeMap::new())),
            sources: DashMap::new(),
            validations: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().keys().cloned().collect()
    }

    pub fn descriptor(&self, name: &str) -> Option<ComponentDescriptor> {
        self.snapshot()
            .get(name)
            .map(|entry| rw_read(entry, SOURCE, "descriptor").clone())
    }

    /// Scan the component directory and atomically replace the descriptor map.
    #[instrument(skip_all, fields(root = %self.root.display()))]
    pub async fn discover(&self) -> Result<Vec<ComponentDescriptor>, ComponentError> {
        let root = self.root.clone();
        let paths = tokio::task::spawn_blocking(move || manifest_paths(&root))
            .await
            .map_err(|err| ComponentError::Scan(err.to_string()))??;

        let mut discovered = BTreeMap::new();
        for relative in paths {
            let Some(name) = component_name(&relative) else {
                continue;
            };
            let path = storage_path(&relative);
            let Some(bytes) = self.storage.read(&path).await? else {
                continue;
            };
            let fingerprint = match self.storage.stat(&path).await? {
                Some(fingerprint) => fingerprint,
                None => Fingerprint::of_content(&bytes),
            };
            let hash = xxh3_64(&bytes);
            let mut descriptor = ComponentDescriptor {
                name: name.clone(),
                location: relative,
                props: BTreeMap::new(),
                imports: Vec::new(),
                fingerprint,
                content_hash: hash,
                status: ComponentStatus::Discovered,
                discovered_at: OffsetDateTime::now_utc(),
            };
            apply_manifest(&mut descriptor, &bytes);
            self.sources.insert(name.clone(), (hash, bytes));
            discovered.insert(name, descriptor);
        }

        let descriptors: Vec<ComponentDescriptor> = discovered.values().cloned().collect();
        let map: BTreeMap<String, Entry> = discovered
            .into_iter()
            .map(|(name, descriptor)| (name, Arc::new(RwLock::new(descriptor))))
            .collect();
        self.sources.retain(|name, _| map.contains_key(name));
        // Import checks depend on the whole set, so every result is stale.
        self.validations.clear();
        *rw_write(&self.descriptors, SOURCE, "discover") = Arc::new(map);

        info!(components = descriptors.len(), "component directory scanned");
        Ok(descriptors)
    }

    /// Manifest bytes of `name`, from memory, the hot cache or storage.
    pub async fn get_source(&self, name: &str) -> Result<Bytes, ComponentError> {
        let entry = self.entry(name)?;
        let current = self.refresh(name, &entry).await?;
        if let Some(bytes) = current.bytes {
            return Ok(bytes);
        }
        self.load(name, &entry, current.hash).await
    }

    /// Validate `name`, reusing the previous result while its content hash
    /// is unchanged.
    #[instrument(skip_all, fields(component = name))]
    pub async fn validate(&self, name: &str) -> ValidationResult {
        let Ok(entry) = self.entry(name) else {
            return self.record(None, name, 0, ValidationResult::NotFound);
        };
        let current = match self.refresh(name, &entry).await {
            Ok(current) => current,
            Err(ComponentError::NotFound(_)) => {
                return self.record(None, name, 0, ValidationResult::NotFound);
            }
            Err(err) => {
                warn!(error = %err, "component source unavailable");
                return ValidationResult::compilation(err.to_string(), None);
            }
        };

        if let Some(cached) = self.cached_validation(name, current.hash) {
            debug!(outcome = cached.outcome(), "validation cache hit");
            return cached;
        }

        let bytes = match current.bytes {
            Some(bytes) => bytes,
            None => match self.load(name, &entry, current.hash).await {
                Ok(bytes) => bytes,
                Err(err) => return ValidationResult::compilation(err.to_string(), None),
            },
        };
        let result = self.check(name, &bytes);
        self.record(Some(&entry), name, current.hash, result)
    }

    /// Validate every discovered component.
    pub async fn validate_all(&self) -> BTreeMap<String, ValidationResult> {
        let mut results = BTreeMap::new();
        for name in self.names() {
            let result = self.validate(&name).await;
            results.insert(name, result);
        }
        results
    }

    /// Template text of `name`; `None` when it is not registered.
    pub async fn template(&self, name: &str) -> Result<Option<String>, ComponentError> {
        let bytes = match self.get_source(name).await {
            Ok(bytes) => bytes,
            Err(ComponentError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let text = std::str::from_utf8(&bytes).map_err(|err| ComponentError::Invalid {
            name: name.to_string(),
            message: format!("manifest is not valid UTF-8: {err}"),
            position: None,
        })?;
        Manifest::parse(text)
            .map(|manifest| Some(manifest.template))
            .map_err(|err| ComponentError::Invalid {
                name: name.to_string(),
                message: err.message,
                position: err.position,
            })
    }

    /// Check `props` against the current schema of `name` and fill in
    /// defaults. An edited manifest is picked up before binding.
    pub async fn bind_props(
        &self,
        name: &str,
        props: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Map<String, serde_json::Value>, ComponentError> {
        let entry = self.entry(name)?;
        self.refresh(name, &entry).await?;
        let schema = rw_read(&entry, SOURCE, "bind_props").props.clone();
        Manifest::bind(&schema, props.clone()).map_err(|violation| match violation {
            PropViolation::Missing { prop } => ComponentError::MissingProp {
                component: name.to_string(),
                prop,
            },
            PropViolation::WrongType { prop, expected } => ComponentError::PropType {
                component: name.to_string(),
                prop,
                expected,
            },
        })
    }

    fn snapshot(&self) -> Arc<BTreeMap<String, Entry>> {
        Arc::clone(&rw_read(&self.descriptors, SOURCE, "snapshot"))
    }

    fn entry(&self, name: &str) -> Result<Entry, ComponentError> {
        self.snapshot()
            .get(name)
            .cloned()
            .ok_or_else(|| ComponentError::NotFound(name.to_string()))
    }

    fn cached_validation(&self, name: &str, hash: u64) -> Option<ValidationResult> {
        self.validations
            .get(name)
            .filter(|cached| cached.0 == hash)
            .map(|cached| cached.1.clone())
    }

    /// Compare the stored fingerprint with storage. Unchanged components are
    /// not read; changed ones are re-read, re-hashed and re-parsed.
    async fn refresh(&self, name: &str, entry: &Entry) -> Result<Current, ComponentError> {
        let (path, known_fingerprint, known_hash) = {
            let descriptor = rw_read(entry, SOURCE, "refresh");
            (
                storage_path(&descriptor.location),
                descriptor.fingerprint.clone(),
                descriptor.content_hash,
            )
        };

        let fingerprint = match self.storage.stat(&path).await {
            Ok(Some(fingerprint)) => fingerprint,
            Ok(None) => return Err(ComponentError::NotFound(name.to_string())),
            Err(err) => {
                warn!(component = name, error = %err, "stat failed; using last known source");
                return Ok(Current {
                    hash: known_hash,
                    bytes: None,
                });
            }
        };
        if fingerprint == known_fingerprint {
            return Ok(Current {
                hash: known_hash,
                bytes: None,
            });
        }

        let bytes = self
            .storage
            .read(&path)
            .await?
            .ok_or_else(|| ComponentError::NotFound(name.to_string()))?;
        let hash = xxh3_64(&bytes);
        {
            let mut descriptor = rw_write(entry, SOURCE, "refresh");
            descriptor.fingerprint = fingerprint;
            if hash != descriptor.content_hash {
                debug!(component = name, "component source changed");
                descriptor.content_hash = hash;
                descriptor.status = ComponentStatus::Discovered;
                apply_manifest(&mut descriptor, &bytes);
            }
        }
        self.remember(name, hash, bytes.clone()).await;
        Ok(Current {
            hash,
            bytes: Some(bytes),
        })
    }

    /// Source bytes with content hash `hash`, fastest layer first.
    async fn load(&self, name: &str, entry: &Entry, hash: u64) -> Result<Bytes, ComponentError> {
        if let Some(bytes) = self
            .sources
            .get(name)
            .filter(|cached| cached.0 == hash)
            .map(|cached| cached.1.clone())
        {
            return Ok(bytes);
        }

        if let Some(cache) = &self.cache {
            match cache.get(&source_key(name, hash)).await {
                Ok(Some(bytes)) if xxh3_64(&bytes) == hash => {
                    self.sources.insert(name.to_string(), (hash, bytes.clone()));
                    return Ok(bytes);
                }
                Ok(_) => {}
                Err(err) => warn!(component = name, error = %err, "component cache unavailable"),
            }
        }

        let path = storage_path(&rw_read(entry, SOURCE, "load").location);
        let bytes = self
            .storage
            .read(&path)
            .await?
            .ok_or_else(|| ComponentError::NotFound(name.to_string()))?;
        let read_hash = xxh3_64(&bytes);
        if read_hash != hash {
            let mut descriptor = rw_write(entry, SOURCE, "load");
            descriptor.content_hash = read_hash;
            descriptor.status = ComponentStatus::Discovered;
            apply_manifest(&mut descriptor, &bytes);
        }
        self.remember(name, read_hash, bytes.clone()).await;
        Ok(bytes)
    }

    async fn remember(&self, name: &str, hash: u64, bytes: Bytes) {
        self.sources.insert(name.to_string(), (hash, bytes.clone()));
        if let Some(cache) = &self.cache
            && let Err(err) = cache.set(&source_key(name, hash), bytes, None).await
        {
            warn!(component = name, error = %err, "failed to cache component source");
        }
    }

    fn check(&self, name: &str, bytes: &[u8]) -> ValidationResult {
        let text = match std::str::from_utf8(bytes) {
            Ok(text) => text,
            Err(err) => {
                return ValidationResult::compilation(
                    format!("manifest is not valid UTF-8: {err}"),
                    None,
                );
            }
        };
        let manifest = match Manifest::parse(text) {
            Ok(manifest) => manifest,
            Err(err) => return ValidationResult::compilation(err.message, err.position),
        };

        let known = self.snapshot();
        for import in &manifest.imports {
            if import == name {
                return ValidationResult::compilation(
                    format!("component `{name}` imports itself"),
                    None,
                );
            }
            if !known.contains_key(import) {
                return ValidationResult::compilation(
                    format!("import `{import}` is not a known component"),
                    None,
                );
            }
        }

        let template_name = format!("{}{name}", super::COMPONENT_PREFIX);
        match self.engine.check(&template_name, &manifest.template) {
            Ok(()) => ValidationResult::Valid,
            Err(crate::application::render::RenderError::Compilation {
                message, position, ..
            }) => ValidationResult::compilation(message, position),
            Err(other) => ValidationResult::compilation(other.to_string(), None),
        }
    }

    fn record(
        &self,
        entry: Option<&Entry>,
        name: &str,
        hash: u64,
        result: ValidationResult,
    ) -> ValidationResult {
        counter!(METRIC_VALIDATE, "outcome" => result.outcome()).increment(1);
        if let Some(entry) = entry {
            rw_write(entry, SOURCE, "record").status = status_of(&result);
            self.validations
                .insert(name.to_string(), (hash, result.clone()));
        }
        match &result {
            ValidationResult::CompilationError { message, position } => warn!(
                component = name,
                position = position.map(|pos| pos.to_string()),
                message = %message,
                "component failed validation"
            ),
            other => debug!(component = name, outcome = other.outcome(), "component validated"),
        }
        result
    }
}

fn status_of(result: &ValidationResult) -> ComponentStatus {
    match result {
        ValidationResult::Valid => ComponentStatus::Validated,
        ValidationResult::NotFound => ComponentStatus::Discovered,
        ValidationResult::CompilationError { message, position } => {
            ComponentStatus::CompilationError {
                message: message.clone(),
                position: *position,
            }
        }
    }
}

/// Fill props and imports from the manifest when it parses; a broken
/// manifest leaves them empty and fails validation later.
fn apply_manifest(descriptor: &mut ComponentDescriptor, bytes: &[u8]) {
    let parsed = std::str::from_utf8(bytes)
        .ok()
        .and_then(|text| Manifest::parse(text).ok());
    match parsed {
        Some(manifest) => {
            descriptor.props = manifest.props;
            descriptor.imports = manifest.imports;
        }
        None => {
            descriptor.props.clear();
            descriptor.imports.clear();
        }
    }
}

fn source_key(name: &str, hash: u64) -> String {
    format!("{SOURCE_CACHE_PREFIX}{name}:{hash:016x}")
}

fn manifest_paths(root: &Path) -> Result<Vec<PathBuf>, ComponentError> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|err| ComponentError::Scan(err.to_string()))?;
        if !entry.file_type().is_file()
            || entry.path().extension().and_then(|ext| ext.to_str()) != Some(MANIFEST_EXTENSION)
        {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            paths.push(relative.to_path_buf());
        }
    }
    Ok(paths)
}

/// Relative path without extension, `/`-separated.
fn component_name(relative: &Path) -> Option<String> {
    let stem = relative.with_extension("");
    let parts: Option<Vec<&str>> = stem
        .components()
        .map(|component| component.as_os_str().to_str())
        .collect();
    let name = parts?.join("/");
    (!name.is_empty()).then_some(name)
}

fn storage_path(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|component| component.as_os_str().to_str())
        .collect::<Vec<_>>()
        .join("/")
}
