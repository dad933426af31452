//! Template engine implementation using minijinja.

use minijinja::{Environment, ErrorKind, UndefinedBehavior, Value};

use crate::error::StepError;

type Context = serde_json::Map<String, serde_json::Value>;

/// Template engine with Jinja2-compatible syntax and strict undefined values.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    /// Create a new template engine with custom filters.
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        env.add_filter("default", filter_default);
        env.add_filter("d", filter_default); // alias
        env.add_filter("tojson", filter_tojson);
        env.add_filter("int", filter_int);

        Self { env }
    }

    /// Check if a string contains template syntax.
    pub fn is_template(s: &str) -> bool {
        s.contains("{{") || s.contains("{%")
    }

    /// Render a template string. `field` names the parameter being rendered
    /// and is reported when a placeholder cannot be resolved.
    pub fn render(&self, field: &str, template: &str, context: &Context) -> Result<String, StepError> {
        let tmpl = self.env.template_from_str(template)?;
        tmpl.render(Value::from_serialize(context))
            .map_err(|e| classify(field, e))
    }

    /// Resolve every template string inside `value`.
    ///
    /// A string that consists of exactly one `{{ expr }}` keeps the type of
    /// the referenced value (objects stay objects, numbers stay numbers).
    /// Any other template string renders to a string.
    pub fn render_value(
        &self,
        value: &serde_json::Value,
        context: &Context,
    ) -> Result<serde_json::Value, StepError> {
        self.render_at("", value, context)
    }

    fn render_at(
        &self,
        path: &str,
        value: &serde_json::Value,
        context: &Context,
    ) -> Result<serde_json::Value, StepError> {
        match value {
            serde_json::Value::String(s) if Self::is_template(s) => {
                let field = if path.is_empty() { "<root>" } else { path };
                match single_expression(s) {
                    Some(expr) => self.eval_expression(field, expr, context),
                    None => Ok(serde_json::Value::String(self.render(field, s, context)?)),
                }
            }
            serde_json::Value::Object(obj) => {
                let mut result = serde_json::Map::new();
                for (k, v) in obj {
                    let child = if path.is_empty() {
                        k.clone()
                    } else {
                        format!("{path}.{k}")
                    };
                    result.insert(k.clone(), self.render_at(&child, v, context)?);
                }
                Ok(serde_json::Value::Object(result))
            }
            serde_json::Value::Array(arr) => {
                let result: Result<Vec<_>, _> = arr
                    .iter()
                    .enumerate()
                    .map(|(i, v)| self.render_at(&format!("{path}[{i}]"), v, context))
                    .collect();
                Ok(serde_json::Value::Array(result?))
            }
            _ => Ok(value.clone()),
        }
    }

    /// Evaluate a bare expression such as `count > 2` and return its value.
    pub fn evaluate(&self, field: &str, expr: &str, context: &Context) -> Result<serde_json::Value, StepError> {
        self.eval_expression(field, expr, context)
    }

    /// Evaluate a bare expression for its truthiness.
    pub fn evaluate_condition(&self, field: &str, expr: &str, context: &Context) -> Result<bool, StepError> {
        let compiled = self.env.compile_expression(expr)?;
        let value = compiled
            .eval(Value::from_serialize(context))
            .map_err(|e| classify(field, e))?;
        if value.is_undefined() {
            return Err(StepError::UnresolvedVariable {
                field: field.to_string(),
                message: format!("'{}' is undefined", expr.trim()),
            });
        }
        Ok(value.is_true())
    }

    fn eval_expression(
        &self,
        field: &str,
        expr: &str,
        context: &Context,
    ) -> Result<serde_json::Value, StepError> {
        let compiled = self.env.compile_expression(expr)?;
        let value = compiled
            .eval(Value::from_serialize(context))
            .map_err(|e| classify(field, e))?;

        if value.is_undefined() {
            return Err(StepError::UnresolvedVariable {
                field: field.to_string(),
                message: format!("'{}' is undefined", expr.trim()),
            });
        }

        Ok(serde_json::to_value(&value)?)
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the inner expression when `s` is exactly one `{{ ... }}` block.
fn single_expression(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") || inner.contains("{%") {
        return None;
    }
    Some(inner)
}

fn classify(field: &str, e: minijinja::Error) -> StepError {
    if e.kind() == ErrorKind::UndefinedError {
        StepError::UnresolvedVariable {
            field: field.to_string(),
            message: e.to_string(),
        }
    } else {
        StepError::Template(e.to_string())
    }
}

// Custom filters

fn filter_default(value: Value, default: Option<Value>) -> Value {
    if value.is_undefined() || value.is_none() {
        default.unwrap_or_else(|| Value::from(""))
    } else {
        value
    }
}

fn filter_tojson(value: Value) -> Result<String, minijinja::Error> {
    serde_json::to_string(&value)
        .map_err(|e| minijinja::Error::new(ErrorKind::InvalidOperation, e.to_string()))
}

fn filter_int(value: Value) -> Value {
    let s = value.to_string();
    if let Ok(n) = s.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = s.parse::<f64>() {
        return Value::from(f as i64);
    }
    Value::from(0i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: serde_json::Value) -> Context {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_evaluate_condition() {
        let engine = TemplateEngine::new();
        let vars = ctx(json!({"count": 3, "title": ""}));
        assert!(engine.evaluate_condition("condition", "count > 2", &vars).unwrap());
        assert!(!engine.evaluate_condition("condition", "title", &vars).unwrap());
        assert!(matches!(
            engine.evaluate_condition("condition", "missing > 1", &vars),
            Err(StepError::UnresolvedVariable { .. })
        ));
    }

    #[test]
    fn test_simple_template() {
        let engine = TemplateEngine::new();
        let result = engine
            .render("greeting", "Hello, {{ name }}!", &ctx(json!({"name": "World"})))
            .unwrap();
        assert_eq!(result, "Hello, World!");
    }

    #[test]
    fn test_unresolved_variable_is_an_error() {
        let engine = TemplateEngine::new();
        let err = engine
            .render("url", "https://{{ host }}/login", &ctx(json!({})))
            .unwrap_err();
        match err {
            StepError::UnresolvedVariable { field, .. } => assert_eq!(field, "url"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_default_filter_tolerates_missing() {
        let engine = TemplateEngine::new();
        let result = engine
            .render("x", "{{ missing | default('fallback') }}", &ctx(json!({})))
            .unwrap();
        assert_eq!(result, "fallback");
    }

    #[test]
    fn test_render_value_keeps_types_for_single_expression() {
        let engine = TemplateEngine::new();
        let context = ctx(json!({
            "login": {"token": "abc", "expires": 3600},
            "sites": ["a.com", "b.com"]
        }));

        let value = json!({
            "token": "{{ login.token }}",
            "ttl": "{{ login.expires }}",
            "targets": "{{ sites }}",
            "header": "Bearer {{ login.token }}",
            "plain": "no template",
            "count": 2
        });
        let result = engine.render_value(&value, &context).unwrap();

        assert_eq!(result["token"], json!("abc"));
        assert_eq!(result["ttl"], json!(3600));
        assert_eq!(result["targets"], json!(["a.com", "b.com"]));
        assert_eq!(result["header"], json!("Bearer abc"));
        assert_eq!(result["plain"], json!("no template"));
        assert_eq!(result["count"], json!(2));
    }

    #[test]
    fn test_render_value_reports_nested_field() {
        let engine = TemplateEngine::new();
        let value = json!({"headers": {"Authorization": "Bearer {{ token }}"}});
        let err = engine.render_value(&value, &ctx(json!({}))).unwrap_err();
        match err {
            StepError::UnresolvedVariable { field, .. } => {
                assert_eq!(field, "headers.Authorization")
            }
            other => panic!("unexpected error: {other}"),
        }

        let value = json!({"urls": ["{{ first }}"]});
        let err = engine.render_value(&value, &ctx(json!({}))).unwrap_err();
        assert!(matches!(err, StepError::UnresolvedVariable { ref field, .. } if field == "urls[0]"));
    }

    #[test]
    fn test_missing_attribute_is_unresolved() {
        let engine = TemplateEngine::new();
        let err = engine
            .render_value(&json!("{{ login.password }}"), &ctx(json!({"login": {}})))
            .unwrap_err();
        assert!(matches!(err, StepError::UnresolvedVariable { .. }));
    }

    #[test]
    fn test_is_template() {
        assert!(TemplateEngine::is_template("Hello {{ name }}"));
        assert!(!TemplateEngine::is_template("plain text"));
        assert_eq!(single_expression("{{ a.b }}"), Some(" a.b "));
        assert_eq!(single_expression("x {{ a }}"), None);
        assert_eq!(single_expression("{{ a }}{{ b }}"), None);
    }
}
