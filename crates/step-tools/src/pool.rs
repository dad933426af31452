//! Bounded resource pool with scoped checkout.
//!
//! Expensive resources (browser sessions, connections) are created lazily up
//! to `max_size`, handed out as [`Pooled`] guards and returned to the idle
//! list when the guard drops. A checkout waits at most `checkout_timeout`
//! for a free slot.

use async_trait::async_trait;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::StepError;

/// Creates and recycles pooled resources.
#[async_trait]
pub trait ResourceManager: Send + Sync + 'static {
    type Resource: Send + 'static;

    /// Create a fresh resource.
    async fn create(&self) -> Result<Self::Resource, StepError>;

    /// Prepare a resource for reuse. Returning `false` discards it.
    fn recycle(&self, _resource: &mut Self::Resource) -> bool {
        true
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub created: usize,
}

struct PoolInner<M: ResourceManager> {
    manager: M,
    idle: Mutex<Vec<M::Resource>>,
    permits: Arc<Semaphore>,
    max_size: usize,
    checkout_timeout: Duration,
    created: AtomicUsize,
}

/// A bounded pool of resources produced by a [`ResourceManager`].
pub struct ResourcePool<M: ResourceManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ResourceManager> Clone for ResourcePool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ResourceManager> ResourcePool<M> {
    /// Create a pool holding at most `max_size` resources.
    pub fn new(manager: M, max_size: usize, checkout_timeout: Duration) -> Self {
        let max_size = max_size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                manager,
                idle: Mutex::new(Vec::with_capacity(max_size)),
                permits: Arc::new(Semaphore::new(max_size)),
                max_size,
                checkout_timeout,
                created: AtomicUsize::new(0),
            }),
        }
    }

    /// Check out a resource, reusing an idle one when available.
    pub async fn checkout(&self) -> Result<Pooled<M>, StepError> {
        let wait_ms = self.inner.checkout_timeout.as_millis() as u64;
        let permit = tokio::time::timeout(
            self.inner.checkout_timeout,
            Arc::clone(&self.inner.permits).acquire_owned(),
        )
        .await
        .map_err(|_| StepError::PoolExhausted(wait_ms))?
        .map_err(|_| StepError::PoolClosed)?;

        let reused = self.inner.idle.lock().ok().and_then(|mut idle| idle.pop());
        let resource = match reused {
            Some(resource) => resource,
            None => {
                let resource = self.inner.manager.create().await?;
                let total = self.inner.created.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(created = total, max_size = self.inner.max_size, "Pool resource created");
                resource
            }
        };

        Ok(Pooled {
            resource: ManuallyDrop::new(resource),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Current occupancy.
    pub fn status(&self) -> PoolStatus {
        let idle = self.inner.idle.lock().map(|idle| idle.len()).unwrap_or(0);
        PoolStatus {
            max_size: self.inner.max_size,
            idle,
            in_use: self.inner.max_size - self.inner.permits.available_permits(),
            created: self.inner.created.load(Ordering::Relaxed),
        }
    }

    /// Stop handing out resources. Pending and future checkouts fail.
    pub fn close(&self) {
        self.inner.permits.close();
        if let Ok(mut idle) = self.inner.idle.lock() {
            idle.clear();
        }
    }
}

/// A checked-out resource. Returned to the pool on drop.
pub struct Pooled<M: ResourceManager> {
    resource: ManuallyDrop<M::Resource>,
    pool: Arc<PoolInner<M>>,
    _permit: OwnedSemaphorePermit,
}

impl<M: ResourceManager> Deref for Pooled<M> {
    type Target = M::Resource;

    fn deref(&self) -> &Self::Target {
        &self.resource
    }
}

impl<M: ResourceManager> DerefMut for Pooled<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.resource
    }
}

impl<M: ResourceManager> Drop for Pooled<M> {
    fn drop(&mut self) {
        // SAFETY: `resource` is never touched again after this point.
        let mut resource = unsafe { ManuallyDrop::take(&mut self.resource) };
        if self.pool.permits.is_closed() || !self.pool.manager.recycle(&mut resource) {
            return;
        }
        if let Ok(mut idle) = self.pool.idle.lock() {
            idle.push(resource);
        }
    }
}
