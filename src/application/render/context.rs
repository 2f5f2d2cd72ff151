//! Turns request variables into template values.

use std::collections::BTreeMap;

use minijinja::Value;
use serde_json::Value as Json;
use tracing::debug;

use super::RenderError;
use super::config::ContextValidation;
use super::sanitize::SecurePolicy;

/// Names the engine sets itself; callers cannot override them.
pub const RESERVED_KEYS: [&str; 2] = ["fragment", "block"];

pub type TemplateVars = BTreeMap<String, Value>;

/// Drop nulls, invalid and reserved keys, then validate what remains.
pub fn prepare(
    variables: &serde_json::Map<String, Json>,
    validation: ContextValidation,
    policy: &SecurePolicy,
) -> Result<TemplateVars, RenderError> {
    let mut prepared = TemplateVars::new();
    for (key, value) in variables {
        if value.is_null() {
            continue;
        }
        if !is_identifier(key) || RESERVED_KEYS.contains(&key.as_str()) {
            debug!(key = %key, "dropping context key");
            continue;
        }
        prepared.insert(key.clone(), convert(key, value, validation, policy)?);
    }
    Ok(prepared)
}

pub fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn convert(
    path: &str,
    value: &Json,
    validation: ContextValidation,
    policy: &SecurePolicy,
) -> Result<Value, RenderError> {
    match value {
        Json::String(text) => match validation {
            ContextValidation::Off => Ok(Value::from(text.as_str())),
            ContextValidation::Reject => match policy.suspicious(text) {
                Some(_) => Err(RenderError::invalid_context(
                    path,
                    "value contains disallowed markup",
                )),
                None => Ok(Value::from(text.as_str())),
            },
            // Markup always leaves as cleaned safe HTML, whether or not
            // cleaning removed anything.
            ContextValidation::Sanitize => match policy.markup(text) {
                Some(cleaned) => Ok(Value::from_safe_string(cleaned)),
                None => Ok(Value::from(text.as_str())),
            },
        },
        Json::Array(items) => items
            .iter()
            .enumerate()
            .map(|(index, item)| convert(&format!("{path}[{index}]"), item, validation, policy))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::from),
        Json::Object(entries) => {
            let mut map = BTreeMap::new();
            for (key, item) in entries {
                map.insert(
                    key.clone(),
                    convert(&format!("{path}.{key}"), item, validation, policy)?,
                );
            }
            Ok(Value::from(map))
        }
        other => Ok(Value::from_serialize(other)),
    }
}
