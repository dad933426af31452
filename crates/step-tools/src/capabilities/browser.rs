//! Browser capabilities backed by pooled sessions.
//!
//! Every invocation checks a session out of the shared [`ResourcePool`] and
//! returns it when the call finishes, whatever the outcome. The rendering
//! engine behind a session is out of scope here; a session tracks the page
//! it is on and how often it has been used so it can be retired.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::context::StepContext;
use crate::error::StepError;
use crate::pool::{ResourceManager, ResourcePool};
use crate::registry::Capability;

/// Sessions are retired after this many checkouts.
pub const DEFAULT_MAX_SESSION_USES: u32 = 50;

/// A headless browser session.
#[derive(Debug, Clone)]
pub struct BrowserSession {
    pub id: String,
    pub current_url: Option<String>,
    pub uses: u32,
    pub created_at: DateTime<Utc>,
}

/// Creates and recycles [`BrowserSession`]s.
#[derive(Debug, Clone)]
pub struct SessionManager {
    max_uses: u32,
}

impl SessionManager {
    pub fn new(max_uses: u32) -> Self {
        Self { max_uses }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSION_USES)
    }
}

#[async_trait]
impl ResourceManager for SessionManager {
    type Resource = BrowserSession;

    async fn create(&self) -> Result<BrowserSession, StepError> {
        let session = BrowserSession {
            id: uuid::Uuid::new_v4().to_string(),
            current_url: None,
            uses: 0,
            created_at: Utc::now(),
        };
        tracing::debug!(session_id = %session.id, "Browser session started");
        Ok(session)
    }

    fn recycle(&self, session: &mut BrowserSession) -> bool {
        session.uses += 1;
        session.current_url = None;
        if session.uses >= self.max_uses {
            tracing::debug!(session_id = %session.id, uses = session.uses, "Retiring browser session");
            return false;
        }
        true
    }
}

/// Shared pool of browser sessions.
pub type BrowserPool = ResourcePool<SessionManager>;

/// Create a browser session pool.
pub fn browser_pool(max_sessions: usize, checkout_timeout: Duration) -> BrowserPool {
    ResourcePool::new(SessionManager::default(), max_sessions, checkout_timeout)
}

/// The browser action a capability performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserAction {
    Navigate,
    Extract,
    Action,
    Analyze,
    Custom,
}

impl BrowserAction {
    pub const ALL: [BrowserAction; 5] = [
        BrowserAction::Navigate,
        BrowserAction::Extract,
        BrowserAction::Action,
        BrowserAction::Analyze,
        BrowserAction::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserAction::Navigate => "navigate",
            BrowserAction::Extract => "extract",
            BrowserAction::Action => "action",
            BrowserAction::Analyze => "analyze",
            BrowserAction::Custom => "custom",
        }
    }
}

impl std::fmt::Display for BrowserAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One browser capability (navigate, extract, ...) over a shared pool.
pub struct BrowserCapability {
    action: BrowserAction,
    pool: BrowserPool,
}

impl BrowserCapability {
    pub fn new(action: BrowserAction, pool: BrowserPool) -> Self {
        Self { action, pool }
    }
}

fn required_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, StepError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| StepError::InvalidParameters(format!("missing '{}'", key)))
}

fn optional_str<'a>(params: &'a serde_json::Value, key: &str, default: &'a str) -> &'a str {
    params.get(key).and_then(|v| v.as_str()).unwrap_or(default)
}

#[async_trait]
impl Capability for BrowserCapability {
    fn name(&self) -> &str {
        self.action.as_str()
    }

    async fn execute(
        &self,
        params: &serde_json::Value,
        ctx: &StepContext,
    ) -> Result<serde_json::Value, StepError> {
        let mut session = self.pool.checkout().await?;

        tracing::debug!(
            execution_id = %ctx.execution_id,
            step = %ctx.step,
            action = %self.action,
            session_id = %session.id,
            "Running browser action"
        );

        let output = match self.action {
            BrowserAction::Navigate => {
                let url = required_str(params, "url")?;
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(StepError::InvalidParameters(format!(
                        "url must be http(s): {}",
                        url
                    )));
                }
                session.current_url = Some(url.to_string());
                serde_json::json!({ "url": url, "success": true })
            }
            BrowserAction::Extract => {
                let selector = required_str(params, "selector")?;
                serde_json::json!({
                    "selector": selector,
                    "extractType": optional_str(params, "extractType", "text"),
                    "data": [],
                })
            }
            BrowserAction::Action => {
                let action_type = required_str(params, "actionType")?;
                serde_json::json!({ "actionType": action_type, "success": true })
            }
            BrowserAction::Analyze => serde_json::json!({
                "analysisType": optional_str(params, "analysisType", ""),
                "result": params.get("data").cloned().unwrap_or_else(|| serde_json::json!({})),
            }),
            BrowserAction::Custom => {
                let handler = required_str(params, "handler")?;
                serde_json::json!({ "handler": handler, "success": true })
            }
        };

        Ok(output)
    }
}
