//! Built-in capabilities.

pub mod browser;
pub mod control;
pub mod http;

use std::time::Duration;

pub use browser::{browser_pool, BrowserAction, BrowserCapability, BrowserPool, BrowserSession};
pub use control::{ConditionCapability, LoopCapability};
pub use http::HttpCapability;

use crate::registry::CapabilityRegistry;

/// Build a registry with the browser actions over one shared session pool,
/// plus `http`, `condition` and `loop`.
pub fn default_registry(max_sessions: usize, checkout_timeout: Duration) -> (CapabilityRegistry, BrowserPool) {
    let pool = browser_pool(max_sessions, checkout_timeout);
    let mut registry = CapabilityRegistry::new();

    for action in BrowserAction::ALL {
        registry.register(BrowserCapability::new(action, pool.clone()));
    }
    registry.register(HttpCapability::new());
    registry.register(ConditionCapability::new());
    registry.register(LoopCapability::new());

    (registry, pool)
}
