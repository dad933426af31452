//! Step execution error types.

use thiserror::Error;

/// Errors that can occur while executing a step capability.
///
/// Every variant is either transient (worth retrying) or permanent
/// (retrying cannot help). See [`StepError::is_transient`].
#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// Capability not found in registry.
    #[error("Capability not found: {0}")]
    NotFound(String),

    /// Parameters were missing or malformed.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// A `{{var}}` placeholder could not be resolved.
    #[error("Unresolved variable in '{field}': {message}")]
    UnresolvedVariable { field: String, message: String },

    /// Template rendering error other than an unresolved variable.
    #[error("Template error: {0}")]
    Template(String),

    /// Step execution timed out.
    #[error("Execution timed out after {0} ms")]
    Timeout(u64),

    /// Downstream failed in a way that may succeed on retry.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Downstream rejected the request.
    #[error("Execution failed: {0}")]
    Failed(String),

    /// HTTP request error.
    #[error("HTTP error{}: {message}", .status.map(|s| format!(" {s}")).unwrap_or_default())]
    Http { status: Option<u16>, message: String },

    /// No pooled resource became available in time.
    #[error("Resource pool exhausted after waiting {0} ms")]
    PoolExhausted(u64),

    /// Resource pool was closed.
    #[error("Resource pool closed")]
    PoolClosed,

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),
}

impl StepError {
    /// Whether a retry has a chance of succeeding.
    ///
    /// Timeouts, connection failures, 5xx responses, 429 and pool exhaustion
    /// are transient. Validation, missing capabilities and other 4xx
    /// responses are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            StepError::Timeout(_) | StepError::Transient(_) | StepError::PoolExhausted(_) => true,
            StepError::Http { status, .. } => match status {
                None => true,
                Some(code) => *code >= 500 || *code == 429 || *code == 408,
            },
            StepError::NotFound(_)
            | StepError::InvalidParameters(_)
            | StepError::UnresolvedVariable { .. }
            | StepError::Template(_)
            | StepError::Failed(_)
            | StepError::PoolClosed
            | StepError::Json(_) => false,
        }
    }
}

impl From<serde_json::Error> for StepError {
    fn from(e: serde_json::Error) -> Self {
        StepError::Json(e.to_string())
    }
}

impl From<reqwest::Error> for StepError {
    fn from(e: reqwest::Error) -> Self {
        StepError::Http {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

impl From<minijinja::Error> for StepError {
    fn from(e: minijinja::Error) -> Self {
        StepError::Template(e.to_string())
    }
}
