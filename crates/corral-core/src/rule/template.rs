//! Query templates: deterministic text expansion over a source object.
//!
//! Templates are minijinja templates compiled once at rule load. The source
//! object's fields are the top-level template context, so a k8s pod renders
//! with `{{ metadata.namespace }}`. Determinism comes for free: object maps
//! are key-sorted (`serde_json` uses a `BTreeMap`) and `dictsort` is
//! available for explicit ordering.

use minijinja::{Environment, UndefinedBehavior};
use thiserror::Error;

use crate::domain::Object;

/// Errors from template compilation or rendering.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template failed to compile: {0}")]
    Compile(String),

    #[error("template failed to render: {0}")]
    Render(String),
}

/// A compiled query template.
///
/// Rendering an object yields a query string, or an empty string when the
/// template guards out (missing fields render as empty under lenient
/// undefined handling).
pub struct Template {
    name: String,
    source: String,
    env: Environment<'static>,
}

impl Template {
    /// Compiles a template. Unknown syntax or filters fail here, not at
    /// application time.
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Result<Self, TemplateError> {
        let name = name.into();
        let source = source.into();

        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Lenient);
        env.add_template_owned(name.clone(), source.clone())
            .map_err(|e| TemplateError::Compile(e.to_string()))?;

        Ok(Self { name, source, env })
    }

    /// The template source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Renders the template with `obj`'s fields as the context.
    pub fn render(&self, obj: &Object) -> Result<String, TemplateError> {
        let template = self
            .env
            .get_template(&self.name)
            .map_err(|e| TemplateError::Render(e.to_string()))?;
        template
            .render(obj.as_value())
            .map_err(|e| TemplateError::Render(e.to_string()))
    }
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template")
            .field("name", &self.name)
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_navigation() {
        let t = Template::new("t", "{{ metadata.namespace }}/{{ metadata.name }}").unwrap();
        let obj = Object::from_json(r#"{"metadata":{"namespace":"ns1","name":"p1"}}"#).unwrap();
        assert_eq!(t.render(&obj).unwrap(), "ns1/p1");
    }

    #[test]
    fn test_missing_field_renders_empty() {
        let t = Template::new("t", "{{ metadata.uid }}").unwrap();
        let obj = Object::from_json(r#"{"metadata":{}}"#).unwrap();
        assert_eq!(t.render(&obj).unwrap(), "");
    }

    #[test]
    fn test_map_iteration_sorted() {
        let t = Template::new(
            "t",
            "{% for k, v in labels|dictsort %}{{ k }}={{ v }}{% if not loop.last %},{% endif %}{% endfor %}",
        )
        .unwrap();
        let obj = Object::from_json(r#"{"labels":{"tier":"web","app":"a"}}"#).unwrap();
        assert_eq!(t.render(&obj).unwrap(), "app=a,tier=web");
    }

    #[test]
    fn test_assignment_and_concat() {
        let t = Template::new("t", r#"{% set prefix = "ns-" %}{{ prefix ~ name }}"#).unwrap();
        let obj = Object::from_json(r#"{"name":"x"}"#).unwrap();
        assert_eq!(t.render(&obj).unwrap(), "ns-x");
    }

    #[test]
    fn test_urlencode_filter() {
        let t = Template::new("t", "{{ value|urlencode }}").unwrap();
        let obj = Object::from_json(r#"{"value":"a b&c"}"#).unwrap();
        assert_eq!(t.render(&obj).unwrap(), "a%20b%26c");
    }

    #[test]
    fn test_bad_syntax_rejected_at_compile() {
        assert!(Template::new("t", "{% for %}").is_err());
    }
}
