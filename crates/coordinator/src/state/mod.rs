//! Execution lifecycle tracking.
//!
//! Records live in the state store under `execution:{id}`. Running
//! executions are indexed in an active set and terminal ones in a bounded
//! history set.

mod manager;
mod record;

pub use manager::{ExecutionStatistics, StateManagerConfig, WorkflowStateManager};
pub use record::{compute_progress, ExecutionRecord, ExecutionStatus};
