//! minijinja environment construction and error mapping.

use minijinja::syntax::SyntaxConfig;
use minijinja::{AutoEscape, Environment, ErrorKind, UndefinedBehavior};

use super::RenderError;
use super::config::{Delimiters, RenderConfig};
use crate::domain::SourcePosition;

/// Settings shared by every environment the renderer builds.
#[derive(Debug, Clone)]
pub struct TemplateEngine {
    syntax: SyntaxConfig,
    strict_undefined: bool,
}

impl TemplateEngine {
    pub fn new(config: &RenderConfig) -> Result<Self, minijinja::Error> {
        Ok(Self {
            syntax: syntax(&config.delimiters)?,
            strict_undefined: config.strict_undefined,
        })
    }

    pub fn strict_undefined(&self) -> bool {
        self.strict_undefined
    }

    /// A fresh environment without any templates or loader.
    pub fn environment(&self) -> Environment<'static> {
        let mut env = Environment::new();
        env.set_syntax(self.syntax.clone());
        env.set_undefined_behavior(if self.strict_undefined {
            UndefinedBehavior::Strict
        } else {
            UndefinedBehavior::Chainable
        });
        env.set_auto_escape_callback(|_| AutoEscape::Html);
        env.set_keep_trailing_newline(true);
        env
    }

    /// Parse `source` without rendering it.
    pub fn check(&self, name: &str, source: &str) -> Result<(), RenderError> {
        let mut env = self.environment();
        env.add_template_owned(name.to_string(), source.to_string())
            .map_err(|err| map_error(name, &err, Some(source)))
    }
}

fn syntax(delimiters: &Delimiters) -> Result<SyntaxConfig, minijinja::Error> {
    SyntaxConfig::builder()
        .block_delimiters(delimiters.block.0.clone(), delimiters.block.1.clone())
        .variable_delimiters(delimiters.variable.0.clone(), delimiters.variable.1.clone())
        .comment_delimiters(delimiters.comment.0.clone(), delimiters.comment.1.clone())
        .build()
}

/// Translate an engine failure. `source` is the text of the template the
/// error points into, used to derive a column.
pub fn map_error(template: &str, err: &minijinja::Error, source: Option<&str>) -> RenderError {
    let template = err.name().unwrap_or(template).to_string();
    let message = err
        .detail()
        .map(str::to_string)
        .unwrap_or_else(|| err.kind().to_string());
    match err.kind() {
        ErrorKind::SyntaxError | ErrorKind::BadEscape => RenderError::Compilation {
            template,
            message,
            position: err.line().map(|line| SourcePosition {
                line,
                column: source.and_then(|source| column(source, err)),
            }),
        },
        ErrorKind::TemplateNotFound => RenderError::NotFound { template },
        ErrorKind::WriteFailure => RenderError::Cancelled,
        _ => RenderError::Runtime { template, message },
    }
}

fn column(source: &str, err: &minijinja::Error) -> Option<usize> {
    let start = err.range()?.start;
    let before = source.get(..start)?;
    let line_start = before.rfind('\n').map_or(0, |idx| idx + 1);
    Some(before[line_start..].chars().count() + 1)
}
