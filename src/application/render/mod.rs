//! Render engine.
//!
//! Templates are minijinja templates with non-default delimiters
//! (`[[ … ]]`, `[% … %]`, `[# … #]` unless configured otherwise) so client
//! side frameworks can keep `{{ … }}`. A render prepares the request context,
//! resolves the template and its dependencies through the storage resolver
//! and runs one of four strategies:
//!
//! * **standard**: the whole document;
//! * **fragment**: the document with `<head>` removed and `<html>`/`<body>`
//!   unwrapped, and `fragment` set to `true` for the template;
//! * **block**: one named block, after evaluating the template's top level;
//! * **stream**: the whole document as fixed-size chunks produced while the
//!   template runs on a blocking thread.

mod config;
mod context;
mod engine;
mod error;
mod fragment;
mod renderer;
mod sanitize;
mod session;
mod stream;
mod types;

pub use config::{
    ContextValidation, Delimiters, RenderConfig, default_secure_attributes, default_secure_tags,
};
pub use context::{RESERVED_KEYS, TemplateVars, is_identifier, prepare};
pub use engine::{TemplateEngine, map_error};
pub use error::RenderError;
pub use fragment::unwrap_document;
pub use renderer::Renderer;
pub use sanitize::SecurePolicy;
pub use session::{RenderSession, SourceFetcher};
pub use stream::{ChunkStream, ChunkWriter, chunked, spawn_render};
pub use types::{CacheStatus, RenderBody, RenderOutput, RenderRequest, RenderResponse};
