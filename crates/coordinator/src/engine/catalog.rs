//! Registered workflow definitions.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::workflow::WorkflowDefinition;
use crate::error::{EngineError, EngineResult};

const DEFINITION_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Workflow definitions by id.
#[derive(Debug, Clone, Default)]
pub struct WorkflowCatalog {
    workflows: Arc<RwLock<HashMap<String, Arc<WorkflowDefinition>>>>,
}

impl WorkflowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register `definition`, replacing any previous version.
    pub async fn register(&self, definition: WorkflowDefinition) -> EngineResult<()> {
        definition.validate()?;
        let id = definition.id.clone();
        let replaced = self
            .workflows
            .write()
            .await
            .insert(id.clone(), Arc::new(definition))
            .is_some();
        tracing::debug!(workflow_id = %id, replaced, "Workflow registered");
        Ok(())
    }

    pub async fn get(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.read().await.get(workflow_id).cloned()
    }

    /// Registered ids, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Register every `.yaml`, `.yml` and `.json` definition in `dir`.
    ///
    /// Stops at the first file that fails to parse or validate.
    pub async fn load_dir(&self, dir: &Path) -> EngineResult<usize> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| EngineError::Config(format!("cannot read {}: {}", dir.display(), e)))?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EngineError::Config(format!("cannot read {}: {}", dir.display(), e)))?
        {
            let path = entry.path();
            let wanted = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| DEFINITION_EXTENSIONS.contains(&ext))
                .unwrap_or(false);
            if wanted {
                paths.push(path);
            }
        }
        paths.sort();

        for path in &paths {
            let definition = load_file(path).await?;
            self.register(definition).await?;
        }

        tracing::info!(dir = %dir.display(), count = paths.len(), "Loaded workflow definitions");
        Ok(paths.len())
    }
}

/// Read and parse one definition file.
pub async fn load_file(path: &Path) -> EngineResult<WorkflowDefinition> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| EngineError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    WorkflowDefinition::parse(&content).map_err(|e| match e {
        EngineError::Parse(msg) => EngineError::Parse(format!("{}: {}", path.display(), msg)),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::workflow::Step;
    use serde_json::json;

    fn scratch_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("stackbrowser-catalog-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let catalog = WorkflowCatalog::new();
        catalog
            .register(WorkflowDefinition::sequential(
                "wf",
                vec![Step::new("a", "navigate", json!({}))],
            ))
            .await
            .unwrap();

        assert!(catalog.get("wf").await.is_some());
        assert!(catalog.get("other").await.is_none());
        assert_eq!(catalog.list().await, vec!["wf".to_string()]);
    }

    #[tokio::test]
    async fn test_register_rejects_invalid() {
        let catalog = WorkflowCatalog::new();
        let err = catalog
            .register(WorkflowDefinition::sequential("empty", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidWorkflow(_)));
        assert!(catalog.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_load_dir() {
        let dir = scratch_dir();
        std::fs::write(
            dir.join("one.yaml"),
            "id: one\nsteps:\n  - name: a\n    capability: navigate\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("two.json"),
            r#"{"id": "two", "steps": [{"name": "b", "capability": "http"}]}"#,
        )
        .unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let catalog = WorkflowCatalog::new();
        assert_eq!(catalog.load_dir(&dir).await.unwrap(), 2);
        assert_eq!(catalog.list().await, vec!["one".to_string(), "two".to_string()]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_load_dir_reports_bad_file() {
        let dir = scratch_dir();
        std::fs::write(dir.join("bad.yml"), "id: bad\nsteps: []\n").unwrap();

        let err = WorkflowCatalog::new().load_dir(&dir).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidWorkflow(_)));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
