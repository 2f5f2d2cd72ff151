//! Code-defined component descriptors.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use super::template::Fingerprint;

/// Declared type of a component property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropType {
    String,
    Number,
    Bool,
    List,
    Map,
    Any,
}

impl PropType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "bool" => Some(Self::Bool),
            "list" => Some(Self::List),
            "map" => Some(Self::Map),
            "any" => Some(Self::Any),
            _ => None,
        }
    }

    pub fn accepts(self, value: &Value) -> bool {
        match self {
            PropType::String => value.is_string(),
            PropType::Number => value.is_number(),
            PropType::Bool => value.is_boolean(),
            PropType::List => value.is_array(),
            PropType::Map => value.is_object(),
            PropType::Any => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PropType::String => "string",
            PropType::Number => "number",
            PropType::Bool => "bool",
            PropType::List => "list",
            PropType::Map => "map",
            PropType::Any => "any",
        }
    }
}

/// One entry of a component's property schema.
#[derive(Debug, Clone, PartialEq)]
pub struct PropSpec {
    pub kind: PropType,
    pub required: bool,
    pub default: Option<Value>,
}

/// Line/column of a compilation problem, 1-indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePosition {
    pub line: usize,
    pub column: Option<usize>,
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.column {
            Some(column) => write!(f, "{}:{}", self.line, column),
            None => write!(f, "{}", self.line),
        }
    }
}

/// Tagged outcome of validating a component.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Valid,
    NotFound,
    CompilationError {
        message: String,
        position: Option<SourcePosition>,
    },
}

impl ValidationResult {
    pub fn compilation(message: impl Into<String>, position: Option<SourcePosition>) -> Self {
        Self::CompilationError {
            message: message.into(),
            position,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            ValidationResult::Valid => "valid",
            ValidationResult::NotFound => "not_found",
            ValidationResult::CompilationError { .. } => "compilation_error",
        }
    }
}

/// Lifecycle of a descriptor. There is no terminal state: any descriptor
/// goes back to `Discovered` when its source changes.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentStatus {
    Discovered,
    Validated,
    CompilationError {
        message: String,
        position: Option<SourcePosition>,
    },
}

/// A component found while scanning the component directory.
#[derive(Debug, Clone)]
pub struct ComponentDescriptor {
    pub name: String,
    /// Path relative to the component directory.
    pub location: PathBuf,
    pub props: BTreeMap<String, PropSpec>,
    pub imports: Vec<String>,
    pub fingerprint: Fingerprint,
    pub content_hash: u64,
    pub status: ComponentStatus,
    pub discovered_at: OffsetDateTime,
}

impl ComponentDescriptor {
    pub fn required_props(&self) -> impl Iterator<Item = &str> {
        self.props
            .iter()
            .filter(|(_, spec)| spec.required)
            .map(|(name, _)| name.as_str())
    }
}
