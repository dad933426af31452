//! In-process state store.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::{StateStore, StoreHealth, StoreResult};

#[derive(Debug, Clone)]
struct Entry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
    /// Written by `set_if_absent`.
    exclusive: bool,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    values: HashMap<String, Entry>,
    sets: HashMap<String, HashSet<String>>,
}

/// A live key captured by [`MemoryStore::snapshot`].
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    pub key: String,
    pub value: serde_json::Value,
    /// Remaining lifetime, `None` for keys that never expire.
    pub ttl: Option<Duration>,
    /// Claimed through `set_if_absent`; must be copied the same way.
    pub exclusive: bool,
}

/// Live contents of a [`MemoryStore`].
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub entries: Vec<SnapshotEntry>,
    pub sets: HashMap<String, HashSet<String>>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.sets.is_empty()
    }
}

/// State store held in process memory.
///
/// Expiry is checked lazily on access; `purge_expired` drops expired
/// entries eagerly.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy every live key and set, with the remaining TTL of each key.
    pub async fn snapshot(&self) -> Snapshot {
        let now = Instant::now();
        let inner = self.inner.read().await;
        let entries = inner
            .values
            .iter()
            .filter(|(_, e)| e.is_live(now))
            .map(|(key, e)| SnapshotEntry {
                key: key.clone(),
                value: e.value.clone(),
                ttl: e.expires_at.map(|at| at.saturating_duration_since(now)),
                exclusive: e.exclusive,
            })
            .collect();
        Snapshot {
            entries,
            sets: inner.sets.clone(),
        }
    }

    /// Drop all keys and sets.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.values.clear();
        inner.sets.clear();
    }

    /// Number of live keys, excluding sets.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let inner = self.inner.read().await;
        inner.values.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> StoreResult<()> {
        let entry = Entry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
            exclusive: false,
        };
        self.inner.write().await.values.insert(key.to_string(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        let now = Instant::now();
        let inner = self.inner.read().await;
        Ok(inner
            .values
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.write().await.values.remove(key);
        Ok(())
    }

    async fn add_to_set(&self, set_key: &str, member: &str) -> StoreResult<()> {
        self.inner
            .write()
            .await
            .sets
            .entry(set_key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn remove_from_set(&self, set_key: &str, member: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(set) = inner.sets.get_mut(set_key) {
            set.remove(member);
            if set.is_empty() {
                inner.sets.remove(set_key);
            }
        }
        Ok(())
    }

    async fn members(&self, set_key: &str) -> StoreResult<HashSet<String>> {
        Ok(self
            .inner
            .read()
            .await
            .sets
            .get(set_key)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_if_absent(&self, key: &str, value: serde_json::Value, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        if inner.values.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        inner.values.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(now + ttl),
                exclusive: true,
            },
        );
        Ok(true)
    }

    async fn health_check(&self) -> StoreHealth {
        let start = Instant::now();
        let _ = self.inner.read().await;
        StoreHealth::up("memory", start.elapsed())
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let before = inner.values.len();
        inner.values.retain(|_, entry| entry.is_live(now));
        Ok(before - inner.values.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStore::new();
        store.set("a", json!({"x": 1}), None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!({"x": 1})));

        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        store.delete("a").await.unwrap();
    }

    #[test]
    fn test_sets_ignore_duplicates() {
        let store = MemoryStore::new();
        tokio_test::block_on(async {
            store.add_to_set("s", "a").await.unwrap();
            store.add_to_set("s", "a").await.unwrap();
            store.add_to_set("s", "b").await.unwrap();
            store.remove_from_set("s", "b").await.unwrap();
            store.remove_from_set("s", "missing").await.unwrap();
        });
        let members = tokio_test::block_on(store.members("s")).unwrap();
        assert_eq!(members.len(), 1);
        assert!(members.contains("a"));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set("short", json!(1), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        store.set("long", json!(2), None).await.unwrap();
        assert!(store.get("short").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get("short").await.unwrap().is_none());
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_sets() {
        let store = MemoryStore::new();
        store.add_to_set("active", "e1").await.unwrap();
        store.add_to_set("active", "e2").await.unwrap();
        store.add_to_set("active", "e1").await.unwrap();

        let members = store.members("active").await.unwrap();
        assert_eq!(members.len(), 2);

        store.remove_from_set("active", "e1").await.unwrap();
        store.remove_from_set("active", "missing").await.unwrap();
        let members = store.members("active").await.unwrap();
        assert!(members.contains("e2") && !members.contains("e1"));
        assert!(store.members("none").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_if_absent_replaces_expired() {
        let store = MemoryStore::new();
        assert!(store
            .set_if_absent("lock", json!("a"), Duration::from_millis(20))
            .await
            .unwrap());
        assert!(!store
            .set_if_absent("lock", json!("b"), Duration::from_secs(1))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store
            .set_if_absent("lock", json!("c"), Duration::from_secs(1))
            .await
            .unwrap());
        assert_eq!(store.get("lock").await.unwrap(), Some(json!("c")));
    }

    #[tokio::test]
    async fn test_set_if_absent_is_atomic() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .set_if_absent("k", json!(i), Duration::from_secs(5))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_snapshot_keeps_live_keys_and_claims() {
        let store = MemoryStore::new();
        store.set("plain", json!(1), None).await.unwrap();
        store
            .set_if_absent("lock:execution:E1", json!("w1"), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set("gone", json!(0), Some(Duration::from_millis(5)))
            .await
            .unwrap();
        store.add_to_set("active", "E1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut snapshot = store.snapshot().await;
        snapshot.entries.sort_by(|a, b| a.key.cmp(&b.key));
        let keys: Vec<&str> = snapshot.entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["lock:execution:E1", "plain"]);

        let lock = &snapshot.entries[0];
        assert!(lock.exclusive);
        assert!(lock.ttl.is_some_and(|ttl| ttl <= Duration::from_secs(60)));
        assert!(!snapshot.entries[1].exclusive);
        assert_eq!(snapshot.entries[1].ttl, None);
        assert!(snapshot.sets["active"].contains("E1"));

        store.clear().await;
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_health_is_up() {
        let store = MemoryStore::new();
        let health = store.health_check().await;
        assert!(health.is_up());
        assert_eq!(health.backend, "memory");
    }
}
