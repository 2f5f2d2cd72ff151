//! Component registry.
//!
//! Components are TOML manifests under the component directory. Each one
//! carries a template plus a prop schema and the other components it
//! imports; its name is the manifest's relative path without the extension.
//! Templates refer to a component as `component:<name>`.

mod manifest;
mod registry;

use thiserror::Error;

use crate::application::backends::BackendError;
use crate::domain::SourcePosition;

pub use manifest::{Manifest, ManifestError, PropViolation};
pub use registry::{ComponentRegistry, SOURCE_CACHE_PREFIX};

/// Template-name prefix that routes a lookup to the registry.
pub const COMPONENT_PREFIX: &str = "component:";

#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("component `{0}` not found")]
    NotFound(String),
    #[error("component `{component}` is missing required prop `{prop}`")]
    MissingProp { component: String, prop: String },
    #[error("prop `{prop}` of component `{component}` must be a {expected}")]
    PropType {
        component: String,
        prop: String,
        expected: &'static str,
    },
    #[error("component `{name}` is invalid: {message}")]
    Invalid {
        name: String,
        message: String,
        position: Option<SourcePosition>,
    },
    #[error("failed to scan component directory: {0}")]
    Scan(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}
