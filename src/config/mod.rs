//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::application::render::{
    ContextValidation, Delimiters, default_secure_attributes, default_secure_tags,
};
use crate::cache::{DEFAULT_VARY_HEADERS, RuleSet, RuleSpec};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tessera";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_CACHE_MAX_ENTRIES: usize = 1024;
const DEFAULT_CACHE_BODY_LIMIT_BYTES: usize = 1024 * 1024;
const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;
const DEFAULT_VARIANT: &str = "default";
const DEFAULT_TEMPLATES_DIR: &str = "templates";
const DEFAULT_NEGATIVE_TTL_SECS: u64 = 30;
const DEFAULT_SOURCE_TTL_SECS: u64 = 300;
const DEFAULT_BACKFILL_GRACE_SECS: u64 = 5;
const DEFAULT_CACHE_INLINE_LIMIT_BYTES: usize = 256 * 1024;

/// Command-line arguments for the Tessera binary.
#[derive(Debug, Parser)]
#[command(name = "tessera", version, about = "Tessera fragment rendering server")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TESSERA_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve rendered templates over HTTP.
    Serve(Box<ServeArgs>),
    /// Component utilities.
    Components(ComponentsArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct ComponentsArgs {
    #[command(subcommand)]
    pub command: ComponentsCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum ComponentsCommand {
    /// Validate every component manifest and exit non-zero on errors.
    Check(ComponentsCheckArgs),
}

#[derive(Debug, Args, Clone, Default)]
pub struct ComponentsCheckArgs {
    /// Override the component directory.
    #[arg(long = "components-directory", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Enable or disable the response cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Override the in-process cache capacity.
    #[arg(long = "cache-max-entries", value_name = "COUNT")]
    pub cache_max_entries: Option<usize>,

    /// Override the largest body the response cache stores.
    #[arg(long = "cache-body-limit-bytes", value_name = "BYTES")]
    pub cache_body_limit_bytes: Option<usize>,

    /// Fail renders on undefined variables.
    #[arg(
        long = "render-strict-undefined",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub render_strict_undefined: Option<bool>,

    /// Override the stream chunk size in bytes.
    #[arg(long = "render-chunk-size", value_name = "BYTES")]
    pub render_chunk_size: Option<usize>,

    /// Override the variant used when a request names none.
    #[arg(long = "render-default-variant", value_name = "NAME")]
    pub render_default_variant: Option<String>,

    /// Override context validation (off|sanitize|reject).
    #[arg(long = "render-context-validation", value_name = "MODE")]
    pub render_context_validation: Option<String>,

    /// Override the template directory.
    #[arg(long = "storage-templates-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub storage_templates_dir: Option<PathBuf>,

    /// Use an HTTP object store as the slowest tier.
    #[arg(long = "storage-object-store-url", value_name = "URL")]
    pub storage_object_store_url: Option<String>,

    /// Use a directory as the object store tier.
    #[arg(long = "storage-object-store-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub storage_object_store_dir: Option<PathBuf>,

    /// Override the component directory.
    #[arg(long = "components-directory", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub components_directory: Option<PathBuf>,

    /// Stream full-page renders.
    #[arg(
        long = "http-stream-pages",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub http_stream_pages: Option<bool>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub render: RenderSettings,
    pub storage: StorageSettings,
    pub components: ComponentsSettings,
    pub http: HttpSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub vary_headers: Vec<String>,
    pub max_entries: NonZeroUsize,
    pub body_limit_bytes: NonZeroUsize,
    /// Already known to compile.
    pub rules: Vec<RuleSpec>,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub strict_undefined: bool,
    pub chunk_size: NonZeroUsize,
    pub default_variant: String,
    pub context_validation: ContextValidation,
    pub secure_tags: Vec<String>,
    pub secure_attributes: Vec<String>,
    pub delimiters: Delimiters,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub templates_dir: PathBuf,
    pub object_store_url: Option<String>,
    pub object_store_dir: Option<PathBuf>,
    pub negative_ttl: Duration,
    /// `None` keeps hot-cache entries until evicted.
    pub source_ttl: Option<Duration>,
    pub backfill_grace: Duration,
    pub cache_inline_limit_bytes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ComponentsSettings {
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct HttpSettings {
    pub stream_pages: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("TESSERA")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("cache.vary_headers")
            .with_list_parse_key("render.secure_tags")
            .with_list_parse_key("render.secure_attributes")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Components(args)) => match &args.command {
            ComponentsCommand::Check(check) => raw.apply_components_override(check),
        },
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    render: RawRenderSettings,
    storage: RawStorageSettings,
    components: RawComponentsSettings,
    http: RawHttpSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(entries) = overrides.cache_max_entries {
            self.cache.max_entries = Some(entries);
        }
        if let Some(bytes) = overrides.cache_body_limit_bytes {
            self.cache.body_limit_bytes = Some(bytes);
        }
        if let Some(strict) = overrides.render_strict_undefined {
            self.render.strict_undefined = Some(strict);
        }
        if let Some(size) = overrides.render_chunk_size {
            self.render.chunk_size = Some(size);
        }
        if let Some(variant) = overrides.render_default_variant.as_ref() {
            self.render.default_variant = Some(variant.clone());
        }
        if let Some(mode) = overrides.render_context_validation.as_ref() {
            self.render.context_validation = Some(mode.clone());
        }
        if let Some(dir) = overrides.storage_templates_dir.as_ref() {
            self.storage.templates_dir = Some(dir.clone());
        }
        if let Some(url) = overrides.storage_object_store_url.as_ref() {
            self.storage.object_store_url = Some(url.clone());
        }
        if let Some(dir) = overrides.storage_object_store_dir.as_ref() {
            self.storage.object_store_dir = Some(dir.clone());
        }
        if let Some(dir) = overrides.components_directory.as_ref() {
            self.components.directory = Some(dir.clone());
        }
        if let Some(stream) = overrides.http_stream_pages {
            self.http.stream_pages = Some(stream);
        }
    }

    fn apply_components_override(&mut self, args: &ComponentsCheckArgs) {
        if let Some(dir) = args.directory.as_ref() {
            self.components.directory = Some(dir.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let server = build_server_settings(raw.server)?;
        let logging = build_logging_settings(raw.logging)?;
        let cache = build_cache_settings(raw.cache)?;
        let render = build_render_settings(raw.render)?;
        let storage = build_storage_settings(raw.storage)?;
        let components = ComponentsSettings {
            directory: raw
                .components
                .directory
                .filter(|dir| !dir.as_os_str().is_empty()),
        };
        let http = HttpSettings {
            stream_pages: raw.http.stream_pages.unwrap_or(false),
        };

        Ok(Self {
            server,
            logging,
            cache,
            render,
            storage,
            components,
            http,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let vary_headers = match cache.vary_headers {
        Some(headers) => {
            let mut names = Vec::with_capacity(headers.len());
            for name in headers {
                let trimmed = name.trim();
                if trimmed.is_empty() {
                    continue;
                }
                axum::http::HeaderName::from_bytes(trimmed.as_bytes()).map_err(|_| {
                    LoadError::invalid(
                        "cache.vary_headers",
                        format!("`{trimmed}` is not a valid header name"),
                    )
                })?;
                names.push(trimmed.to_string());
            }
            names
        }
        None => DEFAULT_VARY_HEADERS.iter().map(|s| s.to_string()).collect(),
    };

    let max_entries = non_zero_usize(
        cache.max_entries.unwrap_or(DEFAULT_CACHE_MAX_ENTRIES),
        "cache.max_entries",
    )?;
    let body_limit_bytes = non_zero_usize(
        cache
            .body_limit_bytes
            .unwrap_or(DEFAULT_CACHE_BODY_LIMIT_BYTES),
        "cache.body_limit_bytes",
    )?;

    let rules = cache.rules.unwrap_or_default();
    RuleSet::compile(&rules).map_err(|err| LoadError::invalid("cache.rules", err.to_string()))?;

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        vary_headers,
        max_entries,
        body_limit_bytes,
        rules,
    })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let chunk_size = non_zero_usize(
        render.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
        "render.chunk_size",
    )?;

    let default_variant = render
        .default_variant
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_VARIANT.to_string());
    if default_variant.is_empty() || default_variant.contains(['/', '\\']) {
        return Err(LoadError::invalid(
            "render.default_variant",
            "must be a single non-empty path segment",
        ));
    }

    let context_validation = match render.context_validation {
        Some(raw) => ContextValidation::parse(&raw).ok_or_else(|| {
            LoadError::invalid(
                "render.context_validation",
                format!("expected off, sanitize or reject, got `{raw}`"),
            )
        })?,
        None => ContextValidation::Off,
    };

    let defaults = Delimiters::default();
    let delimiters = Delimiters {
        variable: delimiter_pair(
            render.variable_delimiters,
            defaults.variable,
            "render.variable_delimiters",
        )?,
        block: delimiter_pair(
            render.block_delimiters,
            defaults.block,
            "render.block_delimiters",
        )?,
        comment: delimiter_pair(
            render.comment_delimiters,
            defaults.comment,
            "render.comment_delimiters",
        )?,
    };

    Ok(RenderSettings {
        strict_undefined: render.strict_undefined.unwrap_or(false),
        chunk_size,
        default_variant,
        context_validation,
        secure_tags: render.secure_tags.unwrap_or_else(default_secure_tags),
        secure_attributes: render
            .secure_attributes
            .unwrap_or_else(default_secure_attributes),
        delimiters,
    })
}

fn build_storage_settings(storage: RawStorageSettings) -> Result<StorageSettings, LoadError> {
    let templates_dir = storage
        .templates_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMPLATES_DIR));
    if templates_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "storage.templates_dir",
            "path must not be empty",
        ));
    }

    let object_store_url = storage.object_store_url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    if let Some(raw) = object_store_url.as_deref() {
        let parsed = url::Url::parse(raw).map_err(|err| {
            LoadError::invalid("storage.object_store_url", format!("invalid url: {err}"))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(LoadError::invalid(
                "storage.object_store_url",
                "scheme must be http or https",
            ));
        }
    }
    let object_store_dir = storage
        .object_store_dir
        .filter(|dir| !dir.as_os_str().is_empty());
    if object_store_url.is_some() && object_store_dir.is_some() {
        return Err(LoadError::invalid(
            "storage.object_store_dir",
            "cannot be combined with storage.object_store_url",
        ));
    }

    let source_ttl_secs = storage
        .source_ttl_seconds
        .unwrap_or(DEFAULT_SOURCE_TTL_SECS);

    Ok(StorageSettings {
        templates_dir,
        object_store_url,
        object_store_dir,
        negative_ttl: Duration::from_secs(
            storage
                .negative_ttl_seconds
                .unwrap_or(DEFAULT_NEGATIVE_TTL_SECS),
        ),
        source_ttl: (source_ttl_secs > 0).then(|| Duration::from_secs(source_ttl_secs)),
        backfill_grace: Duration::from_secs(
            storage
                .backfill_grace_seconds
                .unwrap_or(DEFAULT_BACKFILL_GRACE_SECS),
        ),
        cache_inline_limit_bytes: storage
            .cache_inline_limit_bytes
            .unwrap_or(DEFAULT_CACHE_INLINE_LIMIT_BYTES),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    vary_headers: Option<Vec<String>>,
    max_entries: Option<usize>,
    body_limit_bytes: Option<usize>,
    rules: Option<Vec<RuleSpec>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    strict_undefined: Option<bool>,
    chunk_size: Option<usize>,
    default_variant: Option<String>,
    context_validation: Option<String>,
    secure_tags: Option<Vec<String>>,
    secure_attributes: Option<Vec<String>>,
    variable_delimiters: Option<Vec<String>>,
    block_delimiters: Option<Vec<String>>,
    comment_delimiters: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStorageSettings {
    templates_dir: Option<PathBuf>,
    object_store_url: Option<String>,
    object_store_dir: Option<PathBuf>,
    negative_ttl_seconds: Option<u64>,
    source_ttl_seconds: Option<u64>,
    backfill_grace_seconds: Option<u64>,
    cache_inline_limit_bytes: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawComponentsSettings {
    directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawHttpSettings {
    stream_pages: Option<bool>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn delimiter_pair(
    raw: Option<Vec<String>>,
    default: (String, String),
    key: &'static str,
) -> Result<(String, String), LoadError> {
    let Some(values) = raw else {
        return Ok(default);
    };
    match <[String; 2]>::try_from(values) {
        Ok([start, end]) if !start.trim().is_empty() && !end.trim().is_empty() => {
            Ok((start.trim().to_string(), end.trim().to_string()))
        }
        Ok(_) => Err(LoadError::invalid(key, "delimiters must not be empty")),
        Err(values) => Err(LoadError::invalid(
            key,
            format!("expected a start and end marker, got {} values", values.len()),
        )),
    }
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
