//! Coordinator configuration.

use serde::Deserialize;
use std::time::Duration;

/// Coordinator configuration loaded from environment variables.
///
/// Environment variables are prefixed with `STACKBROWSER_`:
/// - `STACKBROWSER_NATS_URL`: NATS server for the shared state store (optional;
///   without it the store is in-process only)
/// - `STACKBROWSER_KV_BUCKET`: JetStream key/value bucket name
/// - `STACKBROWSER_WORKER_ID`: Identifier used as lock holder
/// - `STACKBROWSER_LOCK_TTL_SECONDS`, `STACKBROWSER_WORKFLOW_TIMEOUT_SECONDS`,
///   `STACKBROWSER_STEP_TIMEOUT_SECONDS`, `STACKBROWSER_PARALLEL_LIMIT`
/// - `STACKBROWSER_HEARTBEAT_INTERVAL_SECONDS`, `STACKBROWSER_HEARTBEAT_MAX_MISSED`
/// - `STACKBROWSER_STALE_AFTER_SECONDS`, `STACKBROWSER_CLEANUP_INTERVAL_SECONDS`
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// NATS URL (optional)
    #[serde(default)]
    pub nats_url: Option<String>,

    /// JetStream key/value bucket
    #[serde(default = "default_kv_bucket")]
    pub kv_bucket: String,

    /// Lock holder identity for this process
    #[serde(default = "default_worker_id")]
    pub worker_id: String,

    /// Execution lock TTL in seconds
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_seconds: u64,

    /// Whole-workflow timeout in seconds
    #[serde(default = "default_workflow_timeout")]
    pub workflow_timeout_seconds: u64,

    /// Per-step executor timeout in seconds
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,

    /// Default concurrency for parallel step groups
    #[serde(default = "default_parallel_limit")]
    pub parallel_limit: usize,

    /// Subscriber heartbeat interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,

    /// Missed heartbeats before a subscriber is dropped
    #[serde(default = "default_heartbeat_max_missed")]
    pub heartbeat_max_missed: u32,

    /// Per-subscriber event buffer
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    /// Age without updates after which a running execution is stale
    #[serde(default = "default_stale_after")]
    pub stale_after_seconds: u64,

    /// Interval of the stale execution sweep
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,

    /// Terminal execution records kept
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// TTL of execution records in the store
    #[serde(default = "default_record_ttl")]
    pub record_ttl_seconds: u64,

    /// How often a degraded store re-probes its backend
    #[serde(default = "default_reprobe_interval")]
    pub reprobe_interval_seconds: u64,

    /// Concurrent browser sessions
    #[serde(default = "default_browser_pool_size")]
    pub browser_pool_size: usize,

    /// Wait for a free browser session before failing the step
    #[serde(default = "default_pool_checkout_timeout")]
    pub pool_checkout_timeout_ms: u64,

    /// Emit JSON logs
    #[serde(default)]
    pub log_json: bool,
}

fn default_kv_bucket() -> String {
    "stackbrowser_state".to_string()
}

fn default_worker_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

fn default_lock_ttl() -> u64 {
    300
}

fn default_workflow_timeout() -> u64 {
    300
}

fn default_step_timeout() -> u64 {
    60
}

fn default_parallel_limit() -> usize {
    5
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_heartbeat_max_missed() -> u32 {
    3
}

fn default_subscriber_buffer() -> usize {
    64
}

fn default_stale_after() -> u64 {
    3600
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_history_limit() -> usize {
    100
}

fn default_record_ttl() -> u64 {
    86400
}

fn default_reprobe_interval() -> u64 {
    10
}

fn default_browser_pool_size() -> usize {
    4
}

fn default_pool_checkout_timeout() -> u64 {
    5000
}

impl CoordinatorConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `STACKBROWSER_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("STACKBROWSER_").from_env::<CoordinatorConfig>()
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_seconds)
    }

    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.workflow_timeout_seconds)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.record_ttl_seconds)
    }

    pub fn reprobe_interval(&self) -> Duration {
        Duration::from_secs(self.reprobe_interval_seconds)
    }

    pub fn pool_checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_checkout_timeout_ms)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            nats_url: None,
            kv_bucket: default_kv_bucket(),
            worker_id: default_worker_id(),
            lock_ttl_seconds: default_lock_ttl(),
            workflow_timeout_seconds: default_workflow_timeout(),
            step_timeout_seconds: default_step_timeout(),
            parallel_limit: default_parallel_limit(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            heartbeat_max_missed: default_heartbeat_max_missed(),
            subscriber_buffer: default_subscriber_buffer(),
            stale_after_seconds: default_stale_after(),
            cleanup_interval_seconds: default_cleanup_interval(),
            history_limit: default_history_limit(),
            record_ttl_seconds: default_record_ttl(),
            reprobe_interval_seconds: default_reprobe_interval(),
            browser_pool_size: default_browser_pool_size(),
            pool_checkout_timeout_ms: default_pool_checkout_timeout(),
            log_json: false,
        }
    }
}
