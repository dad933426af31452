//! Error types for the coordinator.
//!
//! `EngineError` is what callers of the engine, lock manager and state
//! manager see. [`EngineError::http_status`] gives the status an API layer
//! should answer with.

use thiserror::Error;

use crate::store::StoreError;

/// Coordinator-level errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Workflow definition rejected before any resources were touched
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// Another runner holds or tracks this execution
    #[error("Execution already running: {execution_id}")]
    DuplicateExecution { execution_id: String },

    /// The execution lock is held by someone else
    #[error("Execution lock contended: {execution_id}")]
    LockContention { execution_id: String },

    /// A `{{var}}` placeholder in step parameters could not be resolved
    #[error("Variable resolution failed in step '{step}': {message}")]
    VariableResolution { step: String, message: String },

    /// A step failed after its retries were exhausted
    #[error("Step '{step}' failed: {message}")]
    StepExecution { step: String, message: String },

    /// Calls to a downstream capability are short-circuited
    #[error("Circuit open for '{key}'")]
    CircuitOpen { key: String },

    /// A lifecycle transition the state machine does not allow
    #[error("Invalid transition for {execution_id}: {message}")]
    InvalidTransition { execution_id: String, message: String },

    /// An execution stopped updating and was terminalized by cleanup
    #[error("Execution is stale: {0}")]
    StaleExecution(String),

    /// The whole workflow exceeded its time limit
    #[error("Execution {execution_id} timed out after {seconds}s")]
    WorkflowTimeout { execution_id: String, seconds: u64 },

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// State store error
    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Parse error (YAML, JSON)
    #[error("Parse error: {0}")]
    Parse(String),
}

impl EngineError {
    /// HTTP status an API layer should map this error to.
    ///
    /// A step failure is reported as 200: the execution is tracked
    /// asynchronously and its record carries `status=failed` and `error`.
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::DuplicateExecution { .. }
            | EngineError::LockContention { .. }
            | EngineError::InvalidTransition { .. } => 409,
            EngineError::InvalidWorkflow(_)
            | EngineError::VariableResolution { .. }
            | EngineError::Parse(_) => 400,
            EngineError::NotFound(_) => 404,
            EngineError::StepExecution { .. } | EngineError::StaleExecution(_) => 200,
            EngineError::CircuitOpen { .. } | EngineError::Store(_) => 503,
            EngineError::WorkflowTimeout { .. } => 504,
            EngineError::Serialization(_) | EngineError::Config(_) => 500,
        }
    }

    /// Whether this error means the execution is already being handled.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            EngineError::DuplicateExecution { .. } | EngineError::LockContention { .. }
        )
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(e: serde_yaml::Error) -> Self {
        EngineError::Parse(e.to_string())
    }
}

/// Result type alias for coordinator operations.
pub type EngineResult<T> = Result<T, EngineError>;
