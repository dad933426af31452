//! Shared state store.
//!
//! One [`StateStore`] interface with interchangeable backends:
//! - [`MemoryStore`]: in-process maps, single instance only
//! - [`NatsKvStore`]: NATS JetStream key/value bucket, shared across instances
//! - [`ResilientStore`]: a backend plus in-memory fallback with reconnection
//!
//! The backend is chosen once, in [`open`]. Callers only ever see
//! `Arc<dyn StateStore>`.

mod memory;
mod nats;
mod resilient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::CoordinatorConfig;

pub use memory::{MemoryStore, Snapshot, SnapshotEntry};
pub use nats::{NatsConnector, NatsKvStore};
pub use resilient::{BackendConnector, ReconnectPolicy, ResilientStore};

#[cfg(test)]
pub(crate) use resilient::testing;

/// Errors returned by store backends.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Store serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Store health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Down,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// Result of a store health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreHealth {
    pub status: HealthStatus,
    pub latency_ms: u64,
    pub backend: String,
}

impl StoreHealth {
    pub fn up(backend: &str, latency: Duration) -> Self {
        Self {
            status: HealthStatus::Up,
            latency_ms: latency.as_millis() as u64,
            backend: backend.to_string(),
        }
    }

    pub fn down(backend: &str, latency: Duration) -> Self {
        Self {
            status: HealthStatus::Down,
            latency_ms: latency.as_millis() as u64,
            backend: backend.to_string(),
        }
    }

    pub fn is_up(&self) -> bool {
        self.status == HealthStatus::Up
    }
}

/// Key/value store with TTLs and string sets.
///
/// Keys that have outlived their TTL behave exactly like absent keys.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Store `value` under `key`, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> StoreResult<()>;

    /// Fetch the value under `key`.
    async fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>>;

    /// Delete `key`. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Add `member` to the set at `set_key`.
    async fn add_to_set(&self, set_key: &str, member: &str) -> StoreResult<()>;

    /// Remove `member` from the set at `set_key`.
    async fn remove_from_set(&self, set_key: &str, member: &str) -> StoreResult<()>;

    /// All members of the set at `set_key`.
    async fn members(&self, set_key: &str) -> StoreResult<HashSet<String>>;

    /// Atomically store `value` only if `key` is absent or expired.
    /// Returns whether the value was stored.
    async fn set_if_absent(&self, key: &str, value: serde_json::Value, ttl: Duration) -> StoreResult<bool>;

    /// Probe the backend.
    async fn health_check(&self) -> StoreHealth;

    /// Physically drop keys that have outlived their TTL. Returns how many
    /// were dropped.
    async fn purge_expired(&self) -> StoreResult<usize>;
}

/// Open the store selected by configuration.
///
/// Without `nats_url` the store is in-process only. With it, the NATS
/// backend is wrapped in a [`ResilientStore`] that falls back to memory when
/// NATS is unreachable.
pub async fn open(config: &CoordinatorConfig) -> Arc<dyn StateStore> {
    match config.nats_url {
        Some(ref url) => {
            let connector = NatsConnector::new(url, &config.kv_bucket);
            let store = ResilientStore::connect(
                Arc::new(connector),
                ReconnectPolicy {
                    reprobe_interval: config.reprobe_interval(),
                    ..ReconnectPolicy::default()
                },
            )
            .await;
            Arc::new(store)
        }
        None => {
            tracing::info!("NATS not configured, using in-process state store");
            Arc::new(MemoryStore::new())
        }
    }
}
