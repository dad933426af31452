//! Backend store with in-memory fallback.
//!
//! A failed backend call is retried after reconnecting with bounded
//! exponential backoff. When every attempt fails the store is marked
//! degraded and serves from memory: callers keep working but lose
//! cross-instance guarantees. A background probe reconnects periodically and
//! promotes the backend again once it answers a health check, first copying
//! everything written to memory in the meantime into the backend.

use async_trait::async_trait;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::memory::MemoryStore;
use super::{StateStore, StoreError, StoreHealth, StoreResult};

/// Opens a connection to a shared store backend.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Backend name for logs and health reports.
    fn name(&self) -> &str;

    /// Establish a fresh connection.
    async fn connect(&self) -> StoreResult<Arc<dyn StateStore>>;
}

/// Reconnection behaviour.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Reconnect attempts before falling back to memory.
    pub attempts: u32,
    /// Delay before the first attempt; doubles after each one.
    pub initial_backoff: Duration,
    /// How often a degraded store probes the backend.
    pub reprobe_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(50),
            reprobe_interval: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Backoff delays, e.g. 50/100/200 ms for the defaults.
    pub fn delays(&self) -> Vec<Duration> {
        (0..self.attempts)
            .map(|i| self.initial_backoff * 2u32.saturating_pow(i))
            .collect()
    }
}

struct Inner {
    connector: Arc<dyn BackendConnector>,
    primary: RwLock<Option<Arc<dyn StateStore>>>,
    fallback: Arc<MemoryStore>,
    degraded: AtomicBool,
    reconnecting: Mutex<()>,
    /// Held shared by every call and exclusively while promoting, so no
    /// write lands in memory after its contents were copied.
    gate: RwLock<()>,
    policy: ReconnectPolicy,
}

impl Inner {
    async fn connect_healthy(&self) -> StoreResult<Arc<dyn StateStore>> {
        let store = self.connector.connect().await?;
        let health = store.health_check().await;
        if health.is_up() {
            Ok(store)
        } else {
            Err(StoreError::Unavailable(format!(
                "{} backend connected but reported down",
                self.connector.name()
            )))
        }
    }

    async fn promote(&self, store: Arc<dyn StateStore>) {
        *self.primary.write().await = Some(store);
        if self.degraded.swap(false, Ordering::SeqCst) {
            tracing::info!(backend = %self.connector.name(), "State store backend restored");
        }
    }

    async fn degrade(&self, reason: &StoreError) {
        *self.primary.write().await = None;
        if !self.degraded.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                backend = %self.connector.name(),
                error = %reason,
                "State store backend unreachable, serving from memory"
            );
        }
    }

    /// Copy the fallback's live keys and sets into `store`.
    ///
    /// Keys claimed with `set_if_absent` are claimed the same way, so a claim
    /// another instance made on the backend meanwhile wins.
    async fn migrate_fallback(&self, store: &Arc<dyn StateStore>) -> StoreResult<usize> {
        let snapshot = self.fallback.snapshot().await;
        if snapshot.is_empty() {
            return Ok(0);
        }

        let mut copied = 0;
        for entry in snapshot.entries {
            match entry.ttl {
                Some(ttl) if entry.exclusive => {
                    if !store.set_if_absent(&entry.key, entry.value, ttl).await? {
                        tracing::warn!(
                            key = %entry.key,
                            "Key claimed on the backend while degraded, keeping the backend's claim"
                        );
                        continue;
                    }
                }
                ttl => store.set(&entry.key, entry.value, ttl).await?,
            }
            copied += 1;
        }
        for (set_key, members) in &snapshot.sets {
            for member in members {
                store.add_to_set(set_key, member).await?;
            }
        }
        Ok(copied)
    }

    /// One probe of a degraded backend. Returns true if promoted.
    async fn try_promote(&self) -> bool {
        if !self.degraded.load(Ordering::SeqCst) {
            return true;
        }
        let store = match self.connect_healthy().await {
            Ok(store) => store,
            Err(e) => {
                tracing::debug!(backend = %self.connector.name(), error = %e, "Backend still unreachable");
                return false;
            }
        };

        let _gate = self.gate.write().await;
        if !self.degraded.load(Ordering::SeqCst) {
            return true;
        }
        match self.migrate_fallback(&store).await {
            Ok(copied) => {
                self.fallback.clear().await;
                if copied > 0 {
                    tracing::info!(backend = %self.connector.name(), keys = copied, "Copied degraded-mode state to backend");
                }
                self.promote(store).await;
                true
            }
            Err(e) => {
                tracing::warn!(backend = %self.connector.name(), error = %e, "Copying degraded-mode state failed, staying on memory");
                false
            }
        }
    }
}

/// A [`StateStore`] over a shared backend that degrades to memory.
pub struct ResilientStore {
    inner: Arc<Inner>,
    probe: JoinHandle<()>,
}

impl ResilientStore {
    /// Connect through `connector`, starting degraded if the backend is
    /// unreachable after the backoff attempts.
    pub async fn connect(connector: Arc<dyn BackendConnector>, policy: ReconnectPolicy) -> Self {
        let inner = Arc::new(Inner {
            connector,
            primary: RwLock::new(None),
            fallback: Arc::new(MemoryStore::new()),
            degraded: AtomicBool::new(false),
            reconnecting: Mutex::new(()),
            gate: RwLock::new(()),
            policy,
        });

        let mut last_error = None;
        match inner.connect_healthy().await {
            Ok(store) => inner.promote(store).await,
            Err(e) => last_error = Some(e),
        }
        if last_error.is_some() {
            for delay in inner.policy.delays() {
                tokio::time::sleep(delay).await;
                match inner.connect_healthy().await {
                    Ok(store) => {
                        inner.promote(store).await;
                        last_error = None;
                        break;
                    }
                    Err(e) => last_error = Some(e),
                }
            }
        }
        if let Some(e) = last_error {
            inner.degrade(&e).await;
        }

        let probe = Self::start_probe(Arc::clone(&inner));
        Self { inner, probe }
    }

    /// Start the background task that promotes a recovered backend.
    fn start_probe(inner: Arc<Inner>) -> JoinHandle<()> {
        let interval = inner.policy.reprobe_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip first immediate tick

            loop {
                ticker.tick().await;
                if inner.degraded.load(Ordering::SeqCst) && !inner.try_promote().await {
                    if let Ok(purged @ 1..) = inner.fallback.purge_expired().await {
                        tracing::debug!(purged, "Purged expired keys from memory fallback");
                    }
                }
            }
        })
    }

    /// Whether calls are currently served from memory.
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::SeqCst)
    }

    /// Probe the backend now. Returns true if the backend is in use afterwards.
    pub async fn probe_now(&self) -> bool {
        self.inner.try_promote().await
    }

    async fn call<T, F, Fut>(&self, op: F) -> StoreResult<T>
    where
        F: Fn(Arc<dyn StateStore>) -> Fut + Send + Sync,
        Fut: Future<Output = StoreResult<T>> + Send,
        T: Send,
    {
        let _gate = self.inner.gate.read().await;
        if !self.is_degraded() {
            let primary = self.inner.primary.read().await.clone();
            if let Some(primary) = primary {
                match op(primary).await {
                    Ok(value) => return Ok(value),
                    Err(e @ StoreError::Serialization(_)) => return Err(e),
                    Err(e) => {
                        tracing::warn!(backend = %self.inner.connector.name(), error = %e, "State store call failed, reconnecting");
                        if let Some(value) = self.reconnect_and_retry(&op, e).await {
                            return Ok(value);
                        }
                    }
                }
            }
        }

        op(Arc::clone(&self.inner.fallback) as Arc<dyn StateStore>).await
    }

    async fn reconnect_and_retry<T, F, Fut>(&self, op: &F, mut last_error: StoreError) -> Option<T>
    where
        F: Fn(Arc<dyn StateStore>) -> Fut + Send + Sync,
        Fut: Future<Output = StoreResult<T>> + Send,
        T: Send,
    {
        let _guard = self.inner.reconnecting.lock().await;
        if self.is_degraded() {
            return None;
        }

        for (attempt, delay) in self.inner.policy.delays().into_iter().enumerate() {
            tokio::time::sleep(delay).await;
            match self.inner.connector.connect().await {
                Ok(store) => match op(Arc::clone(&store)).await {
                    Ok(value) => {
                        self.inner.promote(store).await;
                        return Some(value);
                    }
                    Err(e) => last_error = e,
                },
                Err(e) => last_error = e,
            }
            tracing::debug!(attempt = attempt + 1, error = %last_error, "Reconnect attempt failed");
        }

        self.inner.degrade(&last_error).await;
        None
    }
}

impl Drop for ResilientStore {
    fn drop(&mut self) {
        self.probe.abort();
    }
}

#[async_trait]
impl StateStore for ResilientStore {
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> StoreResult<()> {
        self.call(|s| {
            let value = value.clone();
            async move { s.set(key, value, ttl).await }
        })
        .await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        self.call(|s| async move { s.get(key).await }).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.call(|s| async move { s.delete(key).await }).await
    }

    async fn add_to_set(&self, set_key: &str, member: &str) -> StoreResult<()> {
        self.call(|s| async move { s.add_to_set(set_key, member).await })
            .await
    }

    async fn remove_from_set(&self, set_key: &str, member: &str) -> StoreResult<()> {
        self.call(|s| async move { s.remove_from_set(set_key, member).await })
            .await
    }

    async fn members(&self, set_key: &str) -> StoreResult<HashSet<String>> {
        self.call(|s| async move { s.members(set_key).await }).await
    }

    async fn set_if_absent(&self, key: &str, value: serde_json::Value, ttl: Duration) -> StoreResult<bool> {
        self.call(|s| {
            let value = value.clone();
            async move { s.set_if_absent(key, value, ttl).await }
        })
        .await
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        self.call(|s| async move { s.purge_expired().await }).await
    }

    async fn health_check(&self) -> StoreHealth {
        if self.is_degraded() {
            return StoreHealth::down(self.inner.connector.name(), Duration::ZERO);
        }
        let primary = self.inner.primary.read().await.clone();
        match primary {
            Some(primary) => primary.health_check().await,
            None => StoreHealth::down(self.inner.connector.name(), Duration::ZERO),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_backoff_delays() {
        let delays = ReconnectPolicy::default().delays();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(50),
                Duration::from_millis(100),
                Duration::from_millis(200)
            ]
        );
    }

    #[tokio::test]
    async fn test_uses_backend_when_reachable() {
        let connector = SwitchableConnector::new(true);
        let store = ResilientStore::connect(connector.clone(), fast_policy()).await;

        assert!(!store.is_degraded());
        store.set("k", json!(1), None).await.unwrap();
        assert_eq!(connector.backend.get("k").await.unwrap(), Some(json!(1)));
        assert!(store.health_check().await.is_up());
    }

    #[tokio::test]
    async fn test_starts_degraded_when_unreachable() {
        let connector = SwitchableConnector::new(false);
        let store = ResilientStore::connect(connector.clone(), fast_policy()).await;

        assert!(store.is_degraded());
        // One initial attempt plus three backoff attempts.
        assert_eq!(connector.connects.load(Ordering::SeqCst), 4);

        store.set("k", json!("v"), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!("v")));
        assert!(connector.backend.get("k").await.unwrap().is_none());

        let health = store.health_check().await;
        assert!(!health.is_up());
    }

    #[tokio::test]
    async fn test_degrades_mid_flight_and_promotes_back() {
        let connector = SwitchableConnector::new(true);
        let store = ResilientStore::connect(connector.clone(), fast_policy()).await;
        assert!(!store.is_degraded());

        // Backend goes away: the current connection keeps working against the
        // healthy memory backend, so swap in an unreachable one directly.
        connector.reachable.store(false, Ordering::SeqCst);
        *store.inner.primary.write().await = Some(Arc::new(UnreachableStore));

        assert!(store
            .set_if_absent("lock", json!("a"), Duration::from_secs(5))
            .await
            .unwrap());
        assert!(store.is_degraded());
        assert!(!store.health_check().await.is_up());

        assert!(!store.probe_now().await);

        connector.reachable.store(true, Ordering::SeqCst);
        assert!(store.probe_now().await);
        assert!(!store.is_degraded());
        assert!(store.health_check().await.is_up());
    }

    #[tokio::test]
    async fn test_promotion_copies_degraded_writes() {
        let connector = SwitchableConnector::new(false);
        let store = ResilientStore::connect(connector.clone(), fast_policy()).await;

        store.set("record", json!({"n": 1}), Some(Duration::from_secs(60))).await.unwrap();
        store.set("forever", json!(true), None).await.unwrap();
        store.add_to_set("active", "E1").await.unwrap();
        assert!(store
            .set_if_absent("lock:mine", json!("me"), Duration::from_secs(60))
            .await
            .unwrap());
        assert!(store
            .set_if_absent("lock:theirs", json!("me"), Duration::from_secs(60))
            .await
            .unwrap());
        // Another instance claimed this one on the backend meanwhile.
        connector
            .backend
            .set_if_absent("lock:theirs", json!("them"), Duration::from_secs(60))
            .await
            .unwrap();

        connector.reachable.store(true, Ordering::SeqCst);
        assert!(store.probe_now().await);

        assert_eq!(store.get("record").await.unwrap(), Some(json!({"n": 1})));
        assert_eq!(store.get("forever").await.unwrap(), Some(json!(true)));
        assert!(store.members("active").await.unwrap().contains("E1"));
        assert_eq!(store.get("lock:mine").await.unwrap(), Some(json!("me")));
        assert_eq!(store.get("lock:theirs").await.unwrap(), Some(json!("them")));
        // Migrated claims stay exclusive on the backend.
        assert!(!connector
            .backend
            .set_if_absent("lock:mine", json!("other"), Duration::from_secs(1))
            .await
            .unwrap());
        assert!(store.inner.fallback.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_background_reconnect_promotes_backend() {
        let connector = SwitchableConnector::new(false);
        let store = ResilientStore::connect(connector.clone(), fast_reconnect_policy()).await;
        assert!(store.is_degraded());
        store.set("k", json!("degraded"), None).await.unwrap();

        connector.reachable.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!store.is_degraded());
        assert!(store.health_check().await.is_up());
        assert_eq!(connector.backend.get("k").await.unwrap(), Some(json!("degraded")));
    }

    #[tokio::test]
    async fn test_background_reconnect_purges_fallback_while_degraded() {
        let connector = SwitchableConnector::new(false);
        let store = ResilientStore::connect(connector.clone(), fast_reconnect_policy()).await;
        store
            .set("cancel:execution:E9", json!(true), Some(Duration::from_millis(5)))
            .await
            .unwrap();
        assert_eq!(store.inner.fallback.snapshot().await.entries.len(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.inner.fallback.purge_expired().await.unwrap(), 0);
        assert!(store.is_degraded());
    }

    #[tokio::test]
    async fn test_purge_expired_goes_to_active_store() {
        let connector = SwitchableConnector::new(true);
        let store = ResilientStore::connect(connector.clone(), fast_policy()).await;
        store.set("short", json!(1), Some(Duration::from_millis(5))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(connector.backend.is_empty().await);
    }

    #[tokio::test]
    async fn test_reconnect_recovers_without_degrading() {
        let connector = SwitchableConnector::new(true);
        let store = ResilientStore::connect(connector.clone(), fast_policy()).await;

        // The live connection breaks but a reconnect succeeds.
        *store.inner.primary.write().await = Some(Arc::new(UnreachableStore));
        store.set("k", json!(2), None).await.unwrap();

        assert!(!store.is_degraded());
        assert_eq!(connector.backend.get("k").await.unwrap(), Some(json!(2)));
    }
}
