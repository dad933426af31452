//! NATS JetStream key/value store backend.
//!
//! Bucket keys are restricted to `[-/_=.a-zA-Z0-9]`, so logical keys and set
//! members are URL-safe base64 encoded:
//! - plain values live under `k.<key>`
//! - set members live under `s.<set>.<member>`, one key per member
//!
//! Values are wrapped in an envelope carrying the expiry instant. Expired
//! envelopes read as absent; the bucket's `max_age` bounds how long they
//! physically linger.

use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::resilient::BackendConnector;
use super::{StateStore, StoreError, StoreHealth, StoreResult};

/// Upper bound on how long any key survives in the bucket.
const BUCKET_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "v")]
    value: serde_json::Value,
    /// Expiry as unix milliseconds.
    #[serde(rename = "exp", skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
}

impl Envelope {
    fn new(value: serde_json::Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Utc::now().timestamp_millis() + ttl.as_millis() as i64),
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at
            .map_or(true, |at| at > Utc::now().timestamp_millis())
    }

    fn encode(&self) -> StoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn decode(bytes: &[u8]) -> StoreResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn encode(part: &str) -> String {
    URL_SAFE_NO_PAD.encode(part.as_bytes())
}

fn decode(part: &str) -> Option<String> {
    URL_SAFE_NO_PAD
        .decode(part)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

fn value_key(key: &str) -> String {
    format!("k.{}", encode(key))
}

fn set_prefix(set_key: &str) -> String {
    format!("s.{}.", encode(set_key))
}

fn member_key(set_key: &str, member: &str) -> String {
    format!("{}{}", set_prefix(set_key), encode(member))
}

fn backend_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// State store on a JetStream key/value bucket.
#[derive(Clone)]
pub struct NatsKvStore {
    kv: kv::Store,
    bucket: String,
}

impl NatsKvStore {
    /// Open (or create) `bucket` on an existing NATS client.
    pub async fn new(client: async_nats::Client, bucket: &str) -> StoreResult<Self> {
        let js = jetstream::new(client);

        let kv = match js.get_key_value(bucket).await {
            Ok(kv) => {
                tracing::debug!(bucket = %bucket, "Using existing key/value bucket");
                kv
            }
            Err(_) => {
                let config = kv::Config {
                    bucket: bucket.to_string(),
                    history: 1,
                    max_age: BUCKET_MAX_AGE,
                    storage: jetstream::stream::StorageType::File,
                    ..Default::default()
                };
                let kv = js
                    .create_key_value(config)
                    .await
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
                tracing::info!(bucket = %bucket, "Created key/value bucket");
                kv
            }
        };

        Ok(Self {
            kv,
            bucket: bucket.to_string(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn live_entry(&self, key: &str) -> StoreResult<Option<(Envelope, u64)>> {
        let entry = self.kv.entry(key).await.map_err(backend_err)?;
        match entry {
            Some(entry) if entry.operation == kv::Operation::Put => {
                let envelope = Envelope::decode(&entry.value)?;
                Ok(Some((envelope, entry.revision)))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl StateStore for NatsKvStore {
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> StoreResult<()> {
        let payload = Envelope::new(value, ttl).encode()?;
        self.kv
            .put(value_key(key), payload.into())
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        let bytes = self.kv.get(value_key(key)).await.map_err(backend_err)?;
        match bytes {
            Some(bytes) => {
                let envelope = Envelope::decode(&bytes)?;
                Ok(envelope.is_live().then_some(envelope.value))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.kv.delete(value_key(key)).await.map_err(backend_err)
    }

    async fn add_to_set(&self, set_key: &str, member: &str) -> StoreResult<()> {
        let payload = Envelope::new(serde_json::Value::Bool(true), None).encode()?;
        self.kv
            .put(member_key(set_key, member), payload.into())
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn remove_from_set(&self, set_key: &str, member: &str) -> StoreResult<()> {
        self.kv
            .delete(member_key(set_key, member))
            .await
            .map_err(backend_err)
    }

    async fn members(&self, set_key: &str) -> StoreResult<HashSet<String>> {
        let prefix = set_prefix(set_key);
        let keys: Vec<String> = self
            .kv
            .keys()
            .await
            .map_err(backend_err)?
            .try_collect()
            .await
            .map_err(backend_err)?;

        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(decode)
            .collect())
    }

    async fn set_if_absent(&self, key: &str, value: serde_json::Value, ttl: Duration) -> StoreResult<bool> {
        let key = value_key(key);
        let payload = Envelope::new(value, Some(ttl)).encode()?;

        match self.kv.create(&key, payload.clone().into()).await {
            Ok(_) => return Ok(true),
            Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => {}
            Err(e) => return Err(backend_err(e)),
        }

        // The key exists; it only counts as held while its envelope is live.
        match self.live_entry(&key).await? {
            Some((envelope, _)) if envelope.is_live() => Ok(false),
            Some((_, revision)) => match self.kv.update(&key, payload.into(), revision).await {
                Ok(_) => Ok(true),
                Err(e) if e.kind() == kv::UpdateErrorKind::WrongLastRevision => Ok(false),
                Err(e) => Err(backend_err(e)),
            },
            // Deleted between create and entry; let the next caller retry.
            None => Ok(false),
        }
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        let keys: Vec<String> = self
            .kv
            .keys()
            .await
            .map_err(backend_err)?
            .try_collect()
            .await
            .map_err(backend_err)?;

        let mut purged = 0;
        for key in keys.iter().filter(|k| k.starts_with("k.")) {
            let Some((envelope, revision)) = self.live_entry(key).await? else {
                continue;
            };
            if envelope.is_live() {
                continue;
            }
            // Revision-checked: a key re-claimed since the read survives.
            match self.kv.delete_expect_revision(key, Some(revision)).await {
                Ok(()) => purged += 1,
                Err(e) => tracing::debug!(key = %key, error = %e, "Expired key changed before purge"),
            }
        }
        Ok(purged)
    }

    async fn health_check(&self) -> StoreHealth {
        let start = Instant::now();
        match self.kv.status().await {
            Ok(_) => StoreHealth::up("nats", start.elapsed()),
            Err(e) => {
                tracing::warn!(error = %e, bucket = %self.bucket, "NATS key/value health check failed");
                StoreHealth::down("nats", start.elapsed())
            }
        }
    }
}

/// Connects to NATS and opens the state bucket.
#[derive(Debug, Clone)]
pub struct NatsConnector {
    url: String,
    bucket: String,
    connect_timeout: Duration,
}

impl NatsConnector {
    pub fn new(url: &str, bucket: &str) -> Self {
        Self {
            url: url.to_string(),
            bucket: bucket.to_string(),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

#[async_trait]
impl BackendConnector for NatsConnector {
    fn name(&self) -> &str {
        "nats"
    }

    async fn connect(&self) -> StoreResult<Arc<dyn StateStore>> {
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(self.connect_timeout)
            .connect(self.url.as_str())
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        tracing::info!(url = %self.url, "Connected to NATS");

        let store = NatsKvStore::new(client, &self.bucket).await?;
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_use_bucket_alphabet() {
        let key = value_key("lock:execution:E1/α");
        assert!(key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_=./".contains(c)));
        assert!(key.starts_with("k."));
    }

    #[test]
    fn test_member_key_round_trip() {
        let key = member_key("executions:active", "exec-42");
        let member = key.strip_prefix(&set_prefix("executions:active")).unwrap();
        assert_eq!(decode(member).as_deref(), Some("exec-42"));
    }

    #[test]
    fn test_envelope_expiry() {
        let live = Envelope::new(serde_json::json!(1), Some(Duration::from_secs(60)));
        assert!(live.is_live());

        let forever = Envelope::new(serde_json::json!(1), None);
        assert!(forever.is_live());

        let expired = Envelope {
            value: serde_json::json!(1),
            expires_at: Some(Utc::now().timestamp_millis() - 1),
        };
        assert!(!expired.is_live());

        let decoded = Envelope::decode(&live.encode().unwrap()).unwrap();
        assert_eq!(decoded.expires_at, live.expires_at);
    }

    #[tokio::test]
    async fn test_connector_reports_unreachable_server() {
        let connector = NatsConnector {
            url: "nats://127.0.0.1:1".to_string(),
            bucket: "test".to_string(),
            connect_timeout: Duration::from_millis(200),
        };
        let err = connector.connect().await.err().unwrap();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
