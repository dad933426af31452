//! Workflow definitions.
//!
//! A workflow is an ordered list of steps. Consecutive steps with no data
//! dependency on each other can be declared as an explicit parallel group:
//!
//! ```yaml
//! id: login-and-scrape
//! variables:
//!   site: https://example.com
//! steps:
//!   - name: open
//!     capability: navigate
//!     parameters:
//!       url: "{{ site }}/login"
//!   - parallel:
//!       - name: title
//!         capability: extract
//!         parameters: { selector: h1 }
//!       - name: links
//!         capability: extract
//!         parameters: { selector: a, extractType: attribute }
//!     maxConcurrency: 2
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::error::{EngineError, EngineResult};
use crate::resilience::RetryPolicy;

/// Immutable workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Defaults for template variables; caller variables take precedence
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub steps: Vec<StepNode>,
}

/// An entry in the step list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepNode {
    Parallel(ParallelGroup),
    Step(Step),
}

/// Steps that run concurrently. Results are merged in declared order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelGroup {
    pub parallel: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

/// One unit of work invoking one capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: String,
    pub capability: String,
    #[serde(default = "empty_object")]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Record the failure under the step name and keep going
    #[serde(default)]
    pub continue_on_error: bool,
    /// An unresolved variable in a required step fails the run
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn default_required() -> bool {
    true
}

impl Step {
    pub fn new(name: impl Into<String>, capability: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            capability: capability.into(),
            parameters,
            retry_policy: None,
            continue_on_error: false,
            required: true,
            timeout_ms: None,
        }
    }
}

impl WorkflowDefinition {
    /// A definition with sequential steps only.
    pub fn sequential(id: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: None,
            variables: Map::new(),
            steps: steps.into_iter().map(StepNode::Step).collect(),
        }
    }

    /// Parse and validate a YAML or JSON definition.
    pub fn parse(content: &str) -> EngineResult<Self> {
        let definition: WorkflowDefinition = serde_yaml::from_str(content)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Number of leaf steps, counting each member of a parallel group.
    pub fn total_steps(&self) -> u32 {
        self.steps
            .iter()
            .map(|node| match node {
                StepNode::Step(_) => 1,
                StepNode::Parallel(group) => group.parallel.len() as u32,
            })
            .sum()
    }

    /// All leaf steps in declared order.
    pub fn leaf_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().flat_map(|node| match node {
            StepNode::Step(step) => std::slice::from_ref(step).iter(),
            StepNode::Parallel(group) => group.parallel.iter(),
        })
    }

    /// Reject definitions that cannot run.
    pub fn validate(&self) -> EngineResult<()> {
        if self.id.trim().is_empty() {
            return Err(EngineError::InvalidWorkflow("workflow id is empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(EngineError::InvalidWorkflow(format!(
                "workflow '{}' has no steps",
                self.id
            )));
        }

        for (idx, node) in self.steps.iter().enumerate() {
            if let StepNode::Parallel(group) = node {
                if group.parallel.is_empty() {
                    return Err(EngineError::InvalidWorkflow(format!(
                        "steps[{}]: parallel group is empty",
                        idx
                    )));
                }
                if group.max_concurrency == Some(0) {
                    return Err(EngineError::InvalidWorkflow(format!(
                        "steps[{}]: maxConcurrency must be at least 1",
                        idx
                    )));
                }
            }
        }

        let mut seen = HashSet::new();
        for step in self.leaf_steps() {
            if step.name.trim().is_empty() {
                return Err(EngineError::InvalidWorkflow("step name is empty".to_string()));
            }
            if step.capability.trim().is_empty() {
                return Err(EngineError::InvalidWorkflow(format!(
                    "step '{}': capability is empty",
                    step.name
                )));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(EngineError::InvalidWorkflow(format!(
                    "duplicate step name: {}",
                    step.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const YAML: &str = r#"
id: scrape
variables:
  site: https://example.com
steps:
  - name: open
    capability: navigate
    parameters:
      url: "{{ site }}"
  - parallel:
      - name: title
        capability: extract
        parameters: { selector: h1 }
      - name: links
        capability: extract
        continueOnError: true
        retryPolicy:
          maxAttempts: 5
    maxConcurrency: 2
  - name: report
    capability: http
    required: false
    timeoutMs: 1500
"#;

    #[test]
    fn test_parse_yaml() {
        let wf = WorkflowDefinition::parse(YAML).unwrap();
        assert_eq!(wf.id, "scrape");
        assert_eq!(wf.total_steps(), 4);
        assert_eq!(wf.variables["site"], "https://example.com");

        match &wf.steps[1] {
            StepNode::Parallel(group) => {
                assert_eq!(group.max_concurrency, Some(2));
                assert!(group.parallel[1].continue_on_error);
                assert_eq!(group.parallel[1].retry_policy.as_ref().unwrap().max_attempts, 5);
                assert_eq!(group.parallel[1].parameters, json!({}));
            }
            other => panic!("expected parallel group, got {:?}", other),
        }

        match &wf.steps[2] {
            StepNode::Step(step) => {
                assert!(!step.required);
                assert_eq!(step.timeout_ms, Some(1500));
            }
            other => panic!("expected step, got {:?}", other),
        }

        let names: Vec<&str> = wf.leaf_steps().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["open", "title", "links", "report"]);
    }

    #[test]
    fn test_parse_json() {
        let wf = WorkflowDefinition::parse(
            r#"{"id": "j", "steps": [{"name": "a", "capability": "navigate", "parameters": {"url": "https://x.io"}}]}"#,
        )
        .unwrap();
        assert_eq!(wf.total_steps(), 1);
    }

    #[test]
    fn test_rejects_empty_workflow() {
        let err = WorkflowDefinition::sequential("wf", vec![]).validate().unwrap_err();
        assert!(matches!(err, EngineError::InvalidWorkflow(_)));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let wf = WorkflowDefinition::sequential(
            "wf",
            vec![
                Step::new("a", "navigate", json!({})),
                Step::new("a", "extract", json!({})),
            ],
        );
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate step name"));
    }

    #[test]
    fn test_rejects_empty_group_and_capability() {
        let mut wf = WorkflowDefinition::sequential("wf", vec![Step::new("a", "navigate", json!({}))]);
        wf.steps.push(StepNode::Parallel(ParallelGroup {
            parallel: vec![],
            max_concurrency: None,
        }));
        assert!(wf.validate().is_err());

        let wf = WorkflowDefinition::sequential("wf", vec![Step::new("a", " ", json!({}))]);
        assert!(wf.validate().is_err());
    }

    #[test]
    fn test_parse_reports_yaml_errors() {
        let err = WorkflowDefinition::parse("steps: [").unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }
}
