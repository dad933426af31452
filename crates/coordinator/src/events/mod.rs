//! Execution event broadcasting.

mod broadcaster;
mod types;

pub use broadcaster::{BroadcasterConfig, BroadcasterStats, EventBroadcaster, SubscriberHandle};
pub use types::{BroadcastMessage, EventEnvelope, ExecutionEvent};
