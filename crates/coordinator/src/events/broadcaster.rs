//! Fan-out of execution events to subscriber connections.
//!
//! One connection may watch many executions and one execution may have many
//! connections. Delivery is best-effort and at most once: events are sent
//! with `try_send`, a full buffer drops the event for that connection and a
//! closed receiver removes the connection. Nothing is replayed, so a late
//! subscriber must read the execution record for the current state.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use super::types::{BroadcastMessage, EventEnvelope, ExecutionEvent};
use crate::config::CoordinatorConfig;

/// Broadcaster settings.
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Per-connection message buffer
    pub buffer: usize,
    pub heartbeat_interval: Duration,
    /// Consecutive undelivered heartbeats before a connection is dropped
    pub max_missed: u32,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            buffer: 64,
            heartbeat_interval: Duration::from_secs(30),
            max_missed: 3,
        }
    }
}

impl From<&CoordinatorConfig> for BroadcasterConfig {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            buffer: config.subscriber_buffer,
            heartbeat_interval: config.heartbeat_interval(),
            max_missed: config.heartbeat_max_missed,
        }
    }
}

/// Identifies one subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberHandle(u64);

impl std::fmt::Display for SubscriberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Subscriber counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcasterStats {
    pub total_subscribers: usize,
    pub subscriptions_by_execution: BTreeMap<String, usize>,
}

struct Connection {
    tx: mpsc::Sender<BroadcastMessage>,
    missed: u32,
    executions: HashSet<String>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<SubscriberHandle, Connection>,
    subscriptions: HashMap<String, HashSet<SubscriberHandle>>,
}

impl Registry {
    fn remove_connection(&mut self, handle: SubscriberHandle) -> bool {
        let Some(connection) = self.connections.remove(&handle) else {
            return false;
        };
        for execution_id in connection.executions {
            self.drop_subscription(&execution_id, handle);
        }
        true
    }

    fn drop_subscription(&mut self, execution_id: &str, handle: SubscriberHandle) {
        if let Some(handles) = self.subscriptions.get_mut(execution_id) {
            handles.remove(&handle);
            if handles.is_empty() {
                self.subscriptions.remove(execution_id);
            }
        }
    }
}

/// Typed publish/subscribe hub for execution events.
#[derive(Clone)]
pub struct EventBroadcaster {
    registry: Arc<Mutex<Registry>>,
    next_id: Arc<AtomicU64>,
    config: BroadcasterConfig,
}

impl EventBroadcaster {
    pub fn new(config: BroadcasterConfig) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            config,
        }
    }

    /// Open a connection. Messages arrive on the returned receiver.
    pub async fn connect(&self) -> (SubscriberHandle, mpsc::Receiver<BroadcastMessage>) {
        let handle = SubscriberHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.config.buffer.max(1));
        self.registry.lock().await.connections.insert(
            handle,
            Connection {
                tx,
                missed: 0,
                executions: HashSet::new(),
            },
        );
        tracing::debug!(subscriber = %handle, "Subscriber connected");
        (handle, rx)
    }

    /// Watch `execution_id` on `handle`. Returns false for an unknown handle.
    pub async fn subscribe(&self, execution_id: &str, handle: SubscriberHandle) -> bool {
        let mut registry = self.registry.lock().await;
        let Some(connection) = registry.connections.get_mut(&handle) else {
            return false;
        };
        connection.executions.insert(execution_id.to_string());
        registry
            .subscriptions
            .entry(execution_id.to_string())
            .or_default()
            .insert(handle);
        tracing::debug!(subscriber = %handle, execution_id = %execution_id, "Subscribed");
        true
    }

    pub async fn unsubscribe(&self, execution_id: &str, handle: SubscriberHandle) {
        let mut registry = self.registry.lock().await;
        if let Some(connection) = registry.connections.get_mut(&handle) {
            connection.executions.remove(execution_id);
        }
        registry.drop_subscription(execution_id, handle);
    }

    /// Close a connection and drop all its subscriptions.
    pub async fn disconnect(&self, handle: SubscriberHandle) {
        if self.registry.lock().await.remove_connection(handle) {
            tracing::debug!(subscriber = %handle, "Subscriber disconnected");
        }
    }

    /// Send `event` to every subscriber of `execution_id`.
    ///
    /// Returns how many connections accepted it.
    pub async fn publish(&self, execution_id: &str, event: ExecutionEvent) -> usize {
        let message = BroadcastMessage::Event(EventEnvelope {
            execution_id: execution_id.to_string(),
            timestamp: Utc::now(),
            event,
        });

        let mut registry = self.registry.lock().await;
        let Some(handles) = registry.subscriptions.get(execution_id) else {
            return 0;
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for handle in handles {
            let Some(connection) = registry.connections.get(handle) else {
                continue;
            };
            match connection.tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(subscriber = %handle, execution_id = %execution_id, "Subscriber buffer full, event dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(*handle),
            }
        }

        for handle in closed {
            registry.remove_connection(handle);
            tracing::debug!(subscriber = %handle, "Removed closed subscriber");
        }
        delivered
    }

    /// Send one heartbeat to every connection.
    ///
    /// Connections that could not take it accumulate a miss; reaching
    /// `max_missed` removes them. Returns how many were removed.
    pub async fn heartbeat_tick(&self) -> usize {
        let message = BroadcastMessage::Heartbeat { timestamp: Utc::now() };
        let max_missed = self.config.max_missed.max(1);

        let mut registry = self.registry.lock().await;
        let mut dead = Vec::new();
        for (handle, connection) in registry.connections.iter_mut() {
            match connection.tx.try_send(message.clone()) {
                Ok(()) => connection.missed = 0,
                Err(TrySendError::Full(_)) => {
                    connection.missed += 1;
                    if connection.missed >= max_missed {
                        dead.push(*handle);
                    }
                }
                Err(TrySendError::Closed(_)) => dead.push(*handle),
            }
        }

        for handle in &dead {
            registry.remove_connection(*handle);
            tracing::info!(subscriber = %handle, "Dropped unresponsive subscriber");
        }
        dead.len()
    }

    /// Run [`Self::heartbeat_tick`] every `heartbeat_interval`.
    pub fn start_heartbeat(&self) -> JoinHandle<()> {
        let broadcaster = self.clone();
        let interval = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip first immediate tick

            loop {
                ticker.tick().await;
                let removed = broadcaster.heartbeat_tick().await;
                tracing::trace!(removed, "Heartbeat sent");
            }
        })
    }

    pub async fn stats(&self) -> BroadcasterStats {
        let registry = self.registry.lock().await;
        BroadcasterStats {
            total_subscribers: registry.connections.len(),
            subscriptions_by_execution: registry
                .subscriptions
                .iter()
                .map(|(id, handles)| (id.clone(), handles.len()))
                .collect(),
        }
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(BroadcasterConfig::default())
    }
}
