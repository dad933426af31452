//! Execution context handed to capabilities.

use serde::{Deserialize, Serialize};

/// Context passed to a capability for one step invocation.
///
/// Parameters arrive already resolved, so the context only carries
/// identification and the per-call time limit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepContext {
    /// Execution this step belongs to.
    pub execution_id: String,

    /// Step name within the workflow.
    pub step: String,

    /// Attempt number, starting at 1.
    #[serde(default = "default_attempt")]
    pub attempt: u32,

    /// Time limit for this call in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_attempt() -> u32 {
    1
}

impl StepContext {
    /// Create a context for the first attempt of a step.
    pub fn new(execution_id: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            step: step.into(),
            attempt: 1,
            timeout_ms: None,
        }
    }

    /// Set the attempt number.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Set the per-call timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}
