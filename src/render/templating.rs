//! Template rendering for fragments and the agent configuration
//!
//! Templates are minijinja sources looked up by name, first in an optional
//! override directory and then among the templates compiled into the binary.

use crate::error::RenderError;
use minijinja::{Environment, Error, ErrorKind, UndefinedBehavior, Value as JinjaValue};
use std::borrow::Cow;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Templates shipped with the binary
const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    ("telegraf.conf", include_str!("../../templates/telegraf.conf")),
    (
        "output-influxdb.conf",
        include_str!("../../templates/output-influxdb.conf"),
    ),
    (
        "input-mongodb.conf",
        include_str!("../../templates/input-mongodb.conf"),
    ),
    (
        "input-mysql.conf",
        include_str!("../../templates/input-mysql.conf"),
    ),
];

/// Renders a named template with a key/value context
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, name: &str, context: &serde_json::Value) -> Result<String, RenderError>;
}

/// Set up minijinja environment with the TOML filters the templates use
pub fn setup_minijinja_env(env: &mut Environment) {
    env.add_filter("toml_string", |value: String| toml_quote(&value));
    env.add_filter("toml_array", toml_array);
}

/// Render `source` under `name` with strict undefined handling.
///
/// A trailing newline in the template is kept so the rendered file ends with one.
pub fn render_with_context(
    name: &str,
    source: &str,
    context: &serde_json::Value,
) -> Result<String, Error> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    setup_minijinja_env(&mut env);

    let tmpl = env.template_from_named_str(name, source)?;
    tmpl.render(context)
}

/// Quote a string as a TOML string value
pub fn toml_quote(value: &str) -> String {
    toml::Value::String(value.to_string()).to_string()
}

fn toml_array(value: JinjaValue) -> Result<String, Error> {
    let items = value
        .try_iter()?
        .map(|item| match item.as_str() {
            Some(s) => Ok(toml::Value::String(s.to_string())),
            None => Err(Error::new(
                ErrorKind::InvalidOperation,
                "toml_array expects a list of strings",
            )),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(toml::Value::Array(items).to_string())
}

/// Named templates, optionally overridden from a directory
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    dir: Option<PathBuf>,
}

impl TemplateSet {
    /// Only the templates compiled into the binary
    pub fn builtin() -> Self {
        Self { dir: None }
    }

    /// Prefer templates found in `dir`, falling back to the built-in ones
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    fn source(&self, name: &str) -> Result<Cow<'static, str>, RenderError> {
        if let Some(dir) = &self.dir {
            let path = dir.join(name);
            if path.is_file() {
                debug!("Using template override {}", path.display());
                let content = fs::read_to_string(&path)
                    .map_err(|source| RenderError::TemplateDir { path, source })?;
                return Ok(Cow::Owned(content));
            }
        }

        BUILTIN_TEMPLATES
            .iter()
            .find(|(builtin, _)| *builtin == name)
            .map(|(_, source)| Cow::Borrowed(*source))
            .ok_or_else(|| RenderError::TemplateNotFound {
                name: name.to_string(),
            })
    }
}

impl TemplateRenderer for TemplateSet {
    fn render(&self, name: &str, context: &serde_json::Value) -> Result<String, RenderError> {
        let source = self.source(name)?;
        render_with_context(name, &source, context).map_err(|source| RenderError::Template {
            name: name.to_string(),
            source,
        })
    }
}
