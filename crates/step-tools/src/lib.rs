//! StackBrowser Step Tools
//!
//! The step executor side of workflow execution.
//!
//! This crate provides:
//! - Capability trait, registry and the `StepExecutor` boundary
//! - Bounded resource pool with scoped checkout
//! - Built-in capabilities: navigate, extract, action, analyze, custom, http,
//!   condition, loop
//! - Template engine resolving `{{var}}` placeholders strictly

pub mod capabilities;
pub mod context;
pub mod error;
pub mod pool;
pub mod registry;
pub mod template;

pub use capabilities::default_registry;
pub use context::StepContext;
pub use error::StepError;
pub use pool::{PoolStatus, Pooled, ResourceManager, ResourcePool};
pub use registry::{Capability, CapabilityRegistry, StepExecutor};
pub use template::TemplateEngine;
