//! StackBrowser Coordinator
//!
//! Runs browser-automation workflows and coordinates them across instances.
//!
//! This crate provides:
//! - State store with NATS key/value and in-process backends
//! - Distributed execution lock
//! - Execution lifecycle tracking with stale cleanup and statistics
//! - Execution engine with templated steps, parallel groups and cancellation
//! - Retry with exponential backoff behind per-capability circuit breakers
//! - Typed event fan-out to subscriber connections with heartbeats

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod lock;
pub mod resilience;
pub mod result_ext;
pub mod state;
pub mod store;

pub use config::CoordinatorConfig;
pub use engine::{EngineConfig, ExecutionEngine, WorkflowCatalog, WorkflowDefinition};
pub use error::{EngineError, EngineResult};
pub use events::{EventBroadcaster, ExecutionEvent};
pub use lock::ExecutionLockManager;
pub use resilience::{CircuitBreakerRegistry, RetryPolicy};
pub use state::{ExecutionRecord, ExecutionStatus, WorkflowStateManager};
pub use store::{StateStore, StoreHealth};
