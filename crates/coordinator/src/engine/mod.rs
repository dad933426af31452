//! Workflow execution.
//!
//! This module provides:
//! - Workflow definitions with sequential steps and explicit parallel groups
//! - A catalog of registered definitions
//! - The execution engine that runs them under the execution lock

mod catalog;
mod runner;
mod workflow;

pub use catalog::{load_file, WorkflowCatalog};
pub use runner::{EngineConfig, ExecutionEngine};
pub use workflow::{ParallelGroup, Step, StepNode, WorkflowDefinition};
