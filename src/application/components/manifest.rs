//! Component manifest format.
//!
//! ```toml
//! template = "<button class=\"[[ kind ]]\">[[ label ]]</button>"
//! imports = ["icons/arrow"]
//!
//! [props.label]
//! type = "string"
//! required = true
//!
//! [props.kind]
//! type = "string"
//! default = "primary"
//! ```

use std::collections::BTreeMap;
use std::ops::Range;

use serde::Deserialize;
use serde_json::Value;

use crate::domain::{PropSpec, PropType, SourcePosition};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    template: String,
    #[serde(default)]
    imports: Vec<String>,
    #[serde(default)]
    props: BTreeMap<String, RawProp>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProp {
    #[serde(rename = "type", default = "any_type")]
    kind: String,
    #[serde(default)]
    required: bool,
    default: Option<toml::Value>,
}

fn any_type() -> String {
    "any".to_string()
}

/// A parsed manifest whose prop declarations are structurally sound.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub template: String,
    pub imports: Vec<String>,
    pub props: BTreeMap<String, PropSpec>,
}

/// A problem found in a manifest, with its location when known.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestError {
    pub message: String,
    pub position: Option<SourcePosition>,
}

impl ManifestError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            position: None,
        }
    }
}

impl Manifest {
    pub fn parse(source: &str) -> Result<Self, ManifestError> {
        let raw: RawManifest = toml::from_str(source).map_err(|err| ManifestError {
            message: err.message().to_string(),
            position: err.span().map(|span| position_of(source, span)),
        })?;

        let mut props = BTreeMap::new();
        for (name, prop) in raw.props {
            let kind = PropType::parse(&prop.kind).ok_or_else(|| {
                ManifestError::new(format!("prop `{name}` has unknown type `{}`", prop.kind))
            })?;
            let default = prop
                .default
                .map(|value| {
                    serde_json::to_value(&value).map_err(|err| {
                        ManifestError::new(format!("prop `{name}` has an unusable default: {err}"))
                    })
                })
                .transpose()?;
            if let Some(value) = &default {
                if prop.required {
                    return Err(ManifestError::new(format!(
                        "prop `{name}` is required and cannot have a default"
                    )));
                }
                if !kind.accepts(value) {
                    return Err(ManifestError::new(format!(
                        "default of prop `{name}` is not a {}",
                        kind.as_str()
                    )));
                }
            }
            props.insert(
                name,
                PropSpec {
                    kind,
                    required: prop.required,
                    default,
                },
            );
        }

        Ok(Self {
            template: raw.template,
            imports: raw.imports,
            props,
        })
    }

    /// Apply the prop schema to `props`: check types, reject missing
    /// required props and fill in defaults. Returns the offending prop name.
    pub fn bind(
        schema: &BTreeMap<String, PropSpec>,
        mut props: serde_json::Map<String, Value>,
    ) -> Result<serde_json::Map<String, Value>, PropViolation> {
        for (name, spec) in schema {
            match props.get(name) {
                Some(value) if !value.is_null() => {
                    if !spec.kind.accepts(value) {
                        return Err(PropViolation::WrongType {
                            prop: name.clone(),
                            expected: spec.kind.as_str(),
                        });
                    }
                }
                _ => match &spec.default {
                    Some(default) => {
                        props.insert(name.clone(), default.clone());
                    }
                    None if spec.required => {
                        return Err(PropViolation::Missing { prop: name.clone() });
                    }
                    None => {}
                },
            }
        }
        Ok(props)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropViolation {
    Missing { prop: String },
    WrongType { prop: String, expected: &'static str },
}

fn position_of(source: &str, span: Range<usize>) -> SourcePosition {
    let before = source.get(..span.start).unwrap_or(source);
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map_or(0, |idx| idx + 1);
    SourcePosition {
        line,
        column: Some(before[line_start..].chars().count() + 1),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const BUTTON: &str = r#"
template = "<button>[[ label ]]</button>"
imports = ["icons/arrow"]

[props.label]
type = "string"
required = true

[props.size]
type = "number"
default = 2
"#;

    #[test]
    fn parses_props_and_imports() {
        let manifest = Manifest::parse(BUTTON).expect("parse");
        assert_eq!(manifest.imports, vec!["icons/arrow"]);
        assert_eq!(manifest.props["label"].kind, PropType::String);
        assert!(manifest.props["label"].required);
        assert_eq!(manifest.props["size"].default, Some(json!(2)));
    }

    #[test]
    fn syntax_errors_have_a_position() {
        let err = Manifest::parse("template = \"x\"\n[props.a\n").expect_err("broken");
        let position = err.position.expect("position");
        assert_eq!(position.line, 2);
    }

    #[test]
    fn schema_errors_are_reported() {
        let unknown = Manifest::parse("template = \"\"\n[props.a]\ntype = \"date\"\n")
            .expect_err("unknown type");
        assert!(unknown.message.contains("unknown type `date`"));

        let mismatch = Manifest::parse("template = \"\"\n[props.a]\ntype = \"bool\"\ndefault = 1\n")
            .expect_err("mismatch");
        assert!(mismatch.message.contains("not a bool"));

        let required = Manifest::parse(
            "template = \"\"\n[props.a]\ntype = \"string\"\nrequired = true\ndefault = \"x\"\n",
        )
        .expect_err("required with default");
        assert!(required.message.contains("cannot have a default"));
    }

    #[test]
    fn bind_applies_defaults_and_checks_types() {
        let manifest = Manifest::parse(BUTTON).expect("parse");

        let bound = Manifest::bind(
            &manifest.props,
            json!({"label": "Go", "extra": 1}).as_object().cloned().expect("map"),
        )
        .expect("bind");
        assert_eq!(bound["size"], json!(2));
        assert_eq!(bound["extra"], json!(1));

        assert_eq!(
            Manifest::bind(&manifest.props, serde_json::Map::new()),
            Err(PropViolation::Missing {
                prop: "label".to_string()
            })
        );
        assert_eq!(
            Manifest::bind(
                &manifest.props,
                json!({"label": 3}).as_object().cloned().expect("map")
            ),
            Err(PropViolation::WrongType {
                prop: "label".to_string(),
                expected: "string"
            })
        );
    }
}
