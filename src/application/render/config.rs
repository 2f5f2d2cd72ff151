//! Render engine configuration.

use std::num::NonZeroUsize;

use serde::Deserialize;

const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// How suspicious string values in the request context are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextValidation {
    #[default]
    Off,
    /// Replace the value with its sanitised form.
    Sanitize,
    /// Fail the render with `InvalidContext`.
    Reject,
}

impl ContextValidation {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "off" => Some(Self::Off),
            "sanitize" => Some(Self::Sanitize),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

/// Start/end markers for the three template constructs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delimiters {
    pub variable: (String, String),
    pub block: (String, String),
    pub comment: (String, String),
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            variable: ("[[".to_string(), "]]".to_string()),
            block: ("[%".to_string(), "%]".to_string()),
            comment: ("[#".to_string(), "#]".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Undefined variables fail the render instead of rendering empty.
    pub strict_undefined: bool,
    pub chunk_size: NonZeroUsize,
    pub context_validation: ContextValidation,
    pub secure_tags: Vec<String>,
    pub secure_attributes: Vec<String>,
    pub delimiters: Delimiters,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            strict_undefined: false,
            chunk_size: NonZeroUsize::new(DEFAULT_CHUNK_SIZE).unwrap_or(NonZeroUsize::MIN),
            context_validation: ContextValidation::Off,
            secure_tags: default_secure_tags(),
            secure_attributes: default_secure_attributes(),
            delimiters: Delimiters::default(),
        }
    }
}

impl From<&crate::config::RenderSettings> for RenderConfig {
    fn from(settings: &crate::config::RenderSettings) -> Self {
        Self {
            strict_undefined: settings.strict_undefined,
            chunk_size: settings.chunk_size,
            context_validation: settings.context_validation,
            secure_tags: settings.secure_tags.clone(),
            secure_attributes: settings.secure_attributes.clone(),
            delimiters: settings.delimiters.clone(),
        }
    }
}

pub fn default_secure_tags() -> Vec<String> {
    [
        "a", "abbr", "b", "blockquote", "br", "code", "div", "em", "h1", "h2", "h3", "h4", "h5",
        "h6", "hr", "i", "img", "li", "ol", "p", "pre", "section", "span", "strong", "table",
        "tbody", "td", "th", "thead", "tr", "ul",
    ]
    .iter()
    .map(|tag| tag.to_string())
    .collect()
}

pub fn default_secure_attributes() -> Vec<String> {
    ["class", "id", "title", "href", "src", "alt", "lang", "dir"]
        .iter()
        .map(|attr| attr.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = RenderConfig::default();
        assert!(!config.strict_undefined);
        assert_eq!(config.chunk_size.get(), 8 * 1024);
        assert_eq!(config.context_validation, ContextValidation::Off);
        assert_eq!(config.delimiters.variable.0, "[[");
        assert!(config.secure_tags.iter().any(|tag| tag == "p"));
        assert!(!config.secure_tags.iter().any(|tag| tag == "script"));
    }

    #[test]
    fn validation_mode_parses_case_insensitively() {
        assert_eq!(ContextValidation::parse("Reject"), Some(ContextValidation::Reject));
        assert_eq!(ContextValidation::parse(" sanitize "), Some(ContextValidation::Sanitize));
        assert_eq!(ContextValidation::parse("strict"), None);
    }
}
