//! Control-flow capabilities: `condition` and `loop`.
//!
//! Both run in process. Parameters arrive already resolved, so expressions
//! here see only the `vars` object a step passes in (plus `item` and `index`
//! inside a loop).

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::context::StepContext;
use crate::error::StepError;
use crate::registry::Capability;
use crate::template::TemplateEngine;

fn vars_of(params: &Value) -> Result<Map<String, Value>, StepError> {
    match params.get("vars") {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(vars)) => Ok(vars.clone()),
        Some(_) => Err(StepError::InvalidParameters("'vars' must be an object".into())),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Evaluates `condition` and reports the outcome.
///
/// `condition` is either an expression string (`count > 2`) evaluated
/// against `vars`, or a value already resolved by the caller, judged by its
/// truthiness. A missing condition holds.
pub struct ConditionCapability {
    templates: TemplateEngine,
}

impl ConditionCapability {
    pub fn new() -> Self {
        Self {
            templates: TemplateEngine::new(),
        }
    }
}

impl Default for ConditionCapability {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Capability for ConditionCapability {
    fn name(&self) -> &str {
        "condition"
    }

    async fn execute(&self, params: &Value, ctx: &StepContext) -> Result<Value, StepError> {
        let condition = params.get("condition").cloned().unwrap_or(Value::Null);
        let result = match &condition {
            Value::Null => true,
            Value::String(expr) if !expr.trim().is_empty() => {
                self.templates
                    .evaluate_condition("condition", expr, &vars_of(params)?)?
            }
            Value::String(_) => true,
            other => truthy(other),
        };

        tracing::debug!(
            execution_id = %ctx.execution_id,
            step = %ctx.step,
            result,
            "Condition evaluated"
        );
        Ok(json!({ "condition": condition, "result": result }))
    }
}

/// Maps over `items`.
///
/// With a `map` expression each result is that expression evaluated with
/// `item` and `index` bound on top of `vars`; without one the items are
/// returned as they are.
pub struct LoopCapability {
    templates: TemplateEngine,
}

impl LoopCapability {
    pub fn new() -> Self {
        Self {
            templates: TemplateEngine::new(),
        }
    }
}

impl Default for LoopCapability {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Capability for LoopCapability {
    fn name(&self) -> &str {
        "loop"
    }

    async fn execute(&self, params: &Value, ctx: &StepContext) -> Result<Value, StepError> {
        let items = match params.get("items") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(_) => return Err(StepError::InvalidParameters("'items' must be an array".into())),
        };
        let map = params.get("map").and_then(|m| m.as_str()).filter(|m| !m.trim().is_empty());

        let results = match map {
            None => items,
            Some(expr) => {
                let mut scope = vars_of(params)?;
                let mut results = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    scope.insert("item".into(), item);
                    scope.insert("index".into(), json!(index));
                    results.push(self.templates.evaluate(&format!("map[{}]", index), expr, &scope)?);
                }
                results
            }
        };

        tracing::debug!(
            execution_id = %ctx.execution_id,
            step = %ctx.step,
            count = results.len(),
            "Loop finished"
        );
        Ok(json!({ "count": results.len(), "results": results }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> StepContext {
        StepContext::new("e1", "check")
    }

    #[tokio::test]
    async fn test_condition_expression_against_vars() {
        let out = ConditionCapability::new()
            .execute(&json!({"condition": "count > 2", "vars": {"count": 5}}), &ctx())
            .await
            .unwrap();
        assert_eq!(out, json!({"condition": "count > 2", "result": true}));

        let out = ConditionCapability::new()
            .execute(&json!({"condition": "count > 2", "vars": {"count": 1}}), &ctx())
            .await
            .unwrap();
        assert_eq!(out["result"], false);
    }

    #[tokio::test]
    async fn test_condition_resolved_values_and_default() {
        let cap = ConditionCapability::new();
        assert_eq!(cap.execute(&json!({"condition": false}), &ctx()).await.unwrap()["result"], false);
        assert_eq!(cap.execute(&json!({"condition": [1]}), &ctx()).await.unwrap()["result"], true);
        assert_eq!(cap.execute(&json!({}), &ctx()).await.unwrap()["result"], true);
    }

    #[tokio::test]
    async fn test_condition_unknown_variable_is_permanent() {
        let err = ConditionCapability::new()
            .execute(&json!({"condition": "missing == 1"}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::UnresolvedVariable { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_loop_maps_items() {
        let out = LoopCapability::new()
            .execute(
                &json!({
                    "items": ["a", "b"],
                    "map": "prefix ~ item ~ index",
                    "vars": {"prefix": "#"}
                }),
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(out, json!({"count": 2, "results": ["#a0", "#b1"]}));
    }

    #[tokio::test]
    async fn test_loop_without_map_returns_items() {
        let cap = LoopCapability::new();
        let out = cap.execute(&json!({"items": [1, 2, 3]}), &ctx()).await.unwrap();
        assert_eq!(out["results"], json!([1, 2, 3]));
        assert_eq!(out["count"], 3);

        let err = cap.execute(&json!({"items": "nope"}), &ctx()).await.unwrap_err();
        assert!(matches!(err, StepError::InvalidParameters(_)));
    }
}
