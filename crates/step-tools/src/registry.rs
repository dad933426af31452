//! Capability registry and dispatch.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::context::StepContext;
use crate::error::StepError;

/// An action a workflow step can invoke (navigate, extract, http, ...).
#[async_trait]
pub trait Capability: Send + Sync {
    /// Returns the capability's unique name.
    fn name(&self) -> &str;

    /// Execute with already-resolved parameters.
    async fn execute(
        &self,
        params: &serde_json::Value,
        ctx: &StepContext,
    ) -> Result<serde_json::Value, StepError>;
}

/// The boundary the execution engine calls for every step.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Execute `capability` with `params`, honouring `ctx.timeout_ms`.
    async fn execute(
        &self,
        capability: &str,
        params: &serde_json::Value,
        ctx: &StepContext,
    ) -> Result<serde_json::Value, StepError>;
}

/// Registry of available capabilities.
#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            capabilities: HashMap::new(),
        }
    }

    /// Register a capability, replacing any previous one with the same name.
    pub fn register<C: Capability + 'static>(&mut self, capability: C) {
        self.register_arc(Arc::new(capability));
    }

    /// Register a shared capability.
    pub fn register_arc(&mut self, capability: Arc<dyn Capability>) {
        let name = capability.name().to_string();
        self.capabilities.insert(name, capability);
    }

    /// Get a capability by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    /// Check if a capability is registered.
    pub fn has(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    /// List all registered capability names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.capabilities.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl StepExecutor for CapabilityRegistry {
    async fn execute(
        &self,
        capability: &str,
        params: &serde_json::Value,
        ctx: &StepContext,
    ) -> Result<serde_json::Value, StepError> {
        let handler = self
            .get(capability)
            .ok_or_else(|| StepError::NotFound(capability.to_string()))?;

        tracing::debug!(
            execution_id = %ctx.execution_id,
            step = %ctx.step,
            capability = %capability,
            attempt = ctx.attempt,
            "Executing capability"
        );

        match ctx.timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), handler.execute(params, ctx))
                .await
                .map_err(|_| StepError::Timeout(ms))?,
            None => handler.execute(params, ctx).await,
        }
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoCapability;

    #[async_trait]
    impl Capability for EchoCapability {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(
            &self,
            params: &serde_json::Value,
            _ctx: &StepContext,
        ) -> Result<serde_json::Value, StepError> {
            Ok(params.clone())
        }
    }

    struct SlowCapability;

    #[async_trait]
    impl Capability for SlowCapability {
        fn name(&self) -> &str {
            "slow"
        }

        async fn execute(
            &self,
            _params: &serde_json::Value,
            _ctx: &StepContext,
        ) -> Result<serde_json::Value, StepError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(serde_json::Value::Null)
        }
    }

    #[test]
    fn test_registry() {
        let mut registry = CapabilityRegistry::new();
        registry.register(EchoCapability);
        registry.register(SlowCapability);

        assert!(registry.has("echo"));
        assert!(!registry.has("nonexistent"));
        assert_eq!(registry.list(), vec!["echo", "slow"]);
    }

    #[tokio::test]
    async fn test_execute_dispatches_by_name() {
        let mut registry = CapabilityRegistry::new();
        registry.register(EchoCapability);

        let ctx = StepContext::new("e1", "s1");
        let out = registry
            .execute("echo", &serde_json::json!({"a": 1}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["a"], 1);
    }

    #[tokio::test]
    async fn test_execute_unknown_capability() {
        let registry = CapabilityRegistry::new();
        let ctx = StepContext::new("e1", "s1");
        let err = registry
            .execute("missing", &serde_json::Value::Null, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::NotFound(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        let mut registry = CapabilityRegistry::new();
        registry.register(SlowCapability);

        let ctx = StepContext::new("e1", "s1").with_timeout_ms(20);
        let err = registry
            .execute("slow", &serde_json::Value::Null, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Timeout(20)));
        assert!(err.is_transient());
    }
}
