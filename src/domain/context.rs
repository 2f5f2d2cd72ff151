//! Per-request render context.

use std::num::NonZeroUsize;

use serde_json::{Map, Value};

/// Which of the four render strategies to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderMode {
    /// Full document, returned in one piece.
    Standard,
    /// Partial document without the outer `<html>`/`<head>`/`<body>` wrapper.
    Fragment,
    /// A single named block of the template.
    Block(String),
    /// Full document emitted as fixed-size chunks.
    Stream { chunk_size: Option<NonZeroUsize> },
}

impl RenderMode {
    pub fn label(&self) -> &'static str {
        match self {
            RenderMode::Standard => "standard",
            RenderMode::Fragment => "fragment",
            RenderMode::Block(_) => "block",
            RenderMode::Stream { .. } => "stream",
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, RenderMode::Stream { .. })
    }
}

/// Everything one render call needs. Owned exclusively by that call.
#[derive(Debug, Clone)]
pub struct RenderContext {
    pub template: String,
    pub variant: Option<String>,
    pub variables: Map<String, Value>,
    pub mode: RenderMode,
    /// Restrict output to the configured tag/attribute allowlists.
    pub secure: bool,
}

impl RenderContext {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            variant: None,
            variables: Map::new(),
            mode: RenderMode::Standard,
            secure: false,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    pub fn with_mode(mut self, mode: RenderMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables.extend(variables);
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn block_name(&self) -> Option<&str> {
        match &self.mode {
            RenderMode::Block(name) => Some(name.as_str()),
            _ => None,
        }
    }
}
