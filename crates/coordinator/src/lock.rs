//! Distributed execution lock.
//!
//! At most one runner per execution id, across every process sharing the
//! state store. Locks carry a TTL so a crashed holder cannot block an
//! execution forever.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::result_ext::ResultExt;
use crate::store::StateStore;

/// Key prefix for execution locks.
pub const LOCK_PREFIX: &str = "lock:execution:";

/// Default lock TTL.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

fn lock_key(execution_id: &str) -> String {
    format!("{}{}", LOCK_PREFIX, execution_id)
}

/// Stored lock record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLock {
    pub execution_id: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

/// Acquires and releases execution locks in the state store.
#[derive(Clone)]
pub struct ExecutionLockManager {
    store: Arc<dyn StateStore>,
    default_ttl: Duration,
}

impl ExecutionLockManager {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self::with_ttl(store, DEFAULT_LOCK_TTL)
    }

    pub fn with_ttl(store: Arc<dyn StateStore>, default_ttl: Duration) -> Self {
        Self { store, default_ttl }
    }

    /// Try to take the lock. Returns false if it is already held.
    pub async fn acquire(
        &self,
        execution_id: &str,
        holder_id: &str,
        ttl: Option<Duration>,
    ) -> EngineResult<bool> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let lock = ExecutionLock {
            execution_id: execution_id.to_string(),
            holder_id: holder_id.to_string(),
            acquired_at: Utc::now(),
            ttl_seconds: ttl.as_secs(),
        };

        let acquired = self
            .store
            .set_if_absent(&lock_key(execution_id), serde_json::to_value(&lock)?, ttl)
            .await?;

        if acquired {
            tracing::debug!(execution_id = %execution_id, holder_id = %holder_id, "Execution lock acquired");
        } else {
            tracing::debug!(execution_id = %execution_id, holder_id = %holder_id, "Execution lock held elsewhere");
        }
        Ok(acquired)
    }

    /// Release the lock regardless of holder. Releasing a free lock is a no-op.
    pub async fn release(&self, execution_id: &str) -> EngineResult<()> {
        self.store.delete(&lock_key(execution_id)).await?;
        tracing::debug!(execution_id = %execution_id, "Execution lock released");
        Ok(())
    }

    /// Whether an unexpired lock exists.
    pub async fn is_locked(&self, execution_id: &str) -> EngineResult<bool> {
        Ok(self.store.get(&lock_key(execution_id)).await?.is_some())
    }

    /// The current lock record, if any.
    pub async fn holder(&self, execution_id: &str) -> EngineResult<Option<ExecutionLock>> {
        match self.store.get(&lock_key(execution_id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Refresh the TTL if `holder_id` still holds the lock.
    ///
    /// Check-then-set: a lock that expires between the two calls can be
    /// re-taken by the caller. Keep renewals well inside the TTL.
    pub async fn extend(&self, execution_id: &str, holder_id: &str, ttl: Duration) -> EngineResult<bool> {
        let Some(mut lock) = self.holder(execution_id).await? else {
            return Ok(false);
        };
        if lock.holder_id != holder_id {
            return Ok(false);
        }
        lock.ttl_seconds = ttl.as_secs();
        self.store
            .set(&lock_key(execution_id), serde_json::to_value(&lock)?, Some(ttl))
            .await?;
        Ok(true)
    }

    /// Run `f` while holding the lock.
    ///
    /// Fails with [`EngineError::LockContention`] without calling `f` when the
    /// lock is taken. The lock is released after `f` returns, errors or panics.
    pub async fn with_lock<T, F, Fut>(&self, execution_id: &str, holder_id: &str, f: F) -> EngineResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        if !self.acquire(execution_id, holder_id, None).await? {
            return Err(EngineError::LockContention {
                execution_id: execution_id.to_string(),
            });
        }

        let outcome = AssertUnwindSafe(f()).catch_unwind().await;

        let _ = self
            .release(execution_id)
            .await
            .log(format!("releasing lock for {}", execution_id));

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
