use thiserror::Error;

use crate::application::components::{COMPONENT_PREFIX, ComponentError};
use crate::application::resolver::ResolveError;
use crate::domain::SourcePosition;

/// Failures surfaced by a render call.
///
/// Backend outages never appear here: the resolver and the response cache
/// degrade instead of failing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("template `{template}` not found")]
    NotFound { template: String },
    #[error("block `{block}` not found in template `{template}`")]
    BlockNotFound { template: String, block: String },
    #[error("template `{template}` failed to compile: {message}")]
    Compilation {
        template: String,
        message: String,
        position: Option<SourcePosition>,
    },
    #[error("template `{template}` failed while rendering: {message}")]
    Runtime { template: String, message: String },
    #[error("context value `{key}` rejected: {reason}")]
    InvalidContext { key: String, reason: String },
    #[error("render cancelled")]
    Cancelled,
}

impl RenderError {
    pub fn not_found(template: impl Into<String>) -> Self {
        Self::NotFound {
            template: template.into(),
        }
    }

    pub fn runtime(template: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Runtime {
            template: template.into(),
            message: message.into(),
        }
    }

    pub fn invalid_context(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidContext {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::NotFound { .. } => "not_found",
            RenderError::BlockNotFound { .. } => "block_not_found",
            RenderError::Compilation { .. } => "compilation",
            RenderError::Runtime { .. } => "runtime",
            RenderError::InvalidContext { .. } => "invalid_context",
            RenderError::Cancelled => "cancelled",
        }
    }
}

impl From<ComponentError> for RenderError {
    fn from(error: ComponentError) -> Self {
        match error {
            ComponentError::NotFound(name) => {
                RenderError::not_found(format!("{COMPONENT_PREFIX}{name}"))
            }
            ComponentError::MissingProp { prop, .. } => {
                RenderError::invalid_context(prop, "required prop is missing")
            }
            ComponentError::PropType { prop, expected, .. } => {
                RenderError::invalid_context(prop, format!("expected a {expected}"))
            }
            ComponentError::Invalid {
                name,
                message,
                position,
            } => RenderError::Compilation {
                template: format!("{COMPONENT_PREFIX}{name}"),
                message,
                position,
            },
            other @ (ComponentError::Scan(_) | ComponentError::Backend(_)) => {
                RenderError::runtime(COMPONENT_PREFIX.trim_end_matches(':'), other.to_string())
            }
        }
    }
}

impl From<ResolveError> for RenderError {
    fn from(error: ResolveError) -> Self {
        match error {
            ResolveError::NotFound(id) => RenderError::not_found(id.name),
            ResolveError::InvalidName(path) => RenderError::not_found(path),
        }
    }
}
