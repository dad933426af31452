//! Execution lifecycle record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle status of an execution.
///
/// Transitions only move forward: `pending -> running -> completed | failed | cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Whether no further transition is allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl From<&str> for ExecutionStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "running" | "in_progress" => Self::Running,
            "completed" | "success" => Self::Completed,
            "failed" | "error" => Self::Failed,
            "cancelled" | "canceled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }
}

/// `round(100 * completed / total)`, with an empty workflow at 0.
pub fn compute_progress(completed: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let completed = completed.min(total) as u64;
    let total = total as u64;
    ((200 * completed + total) / (2 * total)) as u8
}

/// The mutable lifecycle object for one run.
///
/// Serializes to a flat camelCase JSON object. API responses and event
/// payloads depend on these field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub progress: u8,
    pub current_step: Option<String>,
    pub total_steps: u32,
    pub completed_steps: u32,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionRecord {
    /// A freshly started record: running, nothing completed.
    pub fn running(execution_id: &str, workflow_id: &str, total_steps: u32, data: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            execution_id: execution_id.to_string(),
            workflow_id: workflow_id.to_string(),
            status: ExecutionStatus::Running,
            progress: 0,
            current_step: None,
            total_steps,
            completed_steps: 0,
            data,
            started_at: now,
            updated_at: now,
            estimated_completion: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall time between start and the last update.
    pub fn duration_ms(&self) -> i64 {
        (self.updated_at - self.started_at).num_milliseconds().max(0)
    }

    /// Linear extrapolation from the elapsed time per completed step.
    pub(crate) fn estimate_completion(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.completed_steps == 0 {
            return None;
        }
        let elapsed_ms = (now - self.started_at).num_milliseconds().max(0);
        let projected_ms = elapsed_ms.saturating_mul(self.total_steps as i64) / self.completed_steps as i64;
        Some(self.started_at + chrono::Duration::milliseconds(projected_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_progress_rounds() {
        assert_eq!(compute_progress(0, 3), 0);
        assert_eq!(compute_progress(1, 3), 33);
        assert_eq!(compute_progress(2, 3), 67);
        assert_eq!(compute_progress(3, 3), 100);
        assert_eq!(compute_progress(1, 8), 13);
        assert_eq!(compute_progress(5, 3), 100);
        assert_eq!(compute_progress(0, 0), 0);
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(ExecutionStatus::from("RUNNING"), ExecutionStatus::Running);
        assert_eq!(ExecutionStatus::from("canceled"), ExecutionStatus::Cancelled);
        assert_eq!(ExecutionStatus::from("bogus"), ExecutionStatus::Pending);
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }

    #[test]
    fn test_record_wire_shape() {
        let mut record = ExecutionRecord::running("E1", "login-flow", 3, Map::new());
        record.current_step = Some("open".into());

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["executionId"], "E1");
        assert_eq!(json["workflowId"], "login-flow");
        assert_eq!(json["status"], "running");
        assert_eq!(json["totalSteps"], 3);
        assert_eq!(json["completedSteps"], 0);
        assert_eq!(json["currentStep"], "open");
        assert!(json.get("error").is_none());
        assert!(json.get("estimatedCompletion").is_none());

        let back: ExecutionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_estimate_completion() {
        let mut record = ExecutionRecord::running("E1", "wf", 4, Map::new());
        assert!(record.estimate_completion(Utc::now()).is_none());

        record.completed_steps = 1;
        let now = record.started_at + chrono::Duration::seconds(10);
        let eta = record.estimate_completion(now).unwrap();
        assert_eq!(eta, record.started_at + chrono::Duration::seconds(40));
    }
}
