//! Typed execution lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle event for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ExecutionEvent {
    Started {
        workflow_id: String,
    },
    Progress {
        completed_steps: u32,
        total_steps: u32,
        current_step: String,
    },
    Completed {
        result: Value,
    },
    Failed {
        error: String,
    },
    Cancelled {},
}

impl ExecutionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Progress { .. } => "progress",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled {} => "cancelled",
        }
    }

    /// Whether this is the last event an execution emits.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled {})
    }
}

/// An event addressed to one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ExecutionEvent,
}

/// What a subscriber connection receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BroadcastMessage {
    Event(EventEnvelope),
    Heartbeat { timestamp: DateTime<Utc> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_format() {
        let envelope = EventEnvelope {
            execution_id: "E1".into(),
            timestamp: Utc::now(),
            event: ExecutionEvent::Progress {
                completed_steps: 1,
                total_steps: 3,
                current_step: "open".into(),
            },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["executionId"], "E1");
        assert_eq!(json["completedSteps"], 1);
        assert_eq!(json["currentStep"], "open");

        let back: EventEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_cancelled_has_no_payload() {
        let json = serde_json::to_value(ExecutionEvent::Cancelled {}).unwrap();
        assert_eq!(json, json!({"type": "cancelled"}));
        assert!(ExecutionEvent::Cancelled {}.is_terminal());
        assert!(!ExecutionEvent::Started { workflow_id: "wf".into() }.is_terminal());
    }
}
