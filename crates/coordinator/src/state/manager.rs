//! Workflow state manager.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use super::record::{compute_progress, ExecutionRecord, ExecutionStatus};
use crate::config::CoordinatorConfig;
use crate::error::{EngineError, EngineResult};
use crate::result_ext::ResultExt;
use crate::store::StateStore;

const RECORD_PREFIX: &str = "execution:";
const ACTIVE_SET: &str = "executions:active";
const HISTORY_SET: &str = "executions:history";

/// Error stored on records terminalized by [`WorkflowStateManager::cleanup_stale`].
pub const STALE_ERROR: &str = "stale";

fn record_key(execution_id: &str) -> String {
    format!("{}{}", RECORD_PREFIX, execution_id)
}

/// State manager settings.
#[derive(Debug, Clone)]
pub struct StateManagerConfig {
    /// TTL applied to every record write
    pub record_ttl: Duration,
    /// Terminal records kept before the oldest are evicted
    pub history_limit: usize,
}

impl Default for StateManagerConfig {
    fn default() -> Self {
        Self {
            record_ttl: Duration::from_secs(86_400),
            history_limit: 100,
        }
    }
}

impl From<&CoordinatorConfig> for StateManagerConfig {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            record_ttl: config.record_ttl(),
            history_limit: config.history_limit,
        }
    }
}

/// Aggregate view over active and retained executions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStatistics {
    pub total_tracked: usize,
    pub by_status: BTreeMap<String, usize>,
    pub avg_duration_ms: u64,
}

/// Owns the lifecycle record of every execution.
///
/// Only the execution engine mutates records. Updates to a terminal record
/// are ignored so a late or duplicate write cannot resurrect a finished run.
#[derive(Clone)]
pub struct WorkflowStateManager {
    store: Arc<dyn StateStore>,
    config: StateManagerConfig,
}

impl WorkflowStateManager {
    pub fn new(store: Arc<dyn StateStore>, config: StateManagerConfig) -> Self {
        Self { store, config }
    }

    /// Create a running record for `execution_id`.
    ///
    /// Fails with [`EngineError::DuplicateExecution`] if a non-terminal record
    /// already exists. A terminal record is replaced.
    pub async fn start_tracking(
        &self,
        execution_id: &str,
        workflow_id: &str,
        total_steps: u32,
        initial_data: Option<Map<String, Value>>,
    ) -> EngineResult<ExecutionRecord> {
        if let Some(existing) = self.fetch(execution_id).await? {
            if !existing.is_terminal() {
                return Err(EngineError::DuplicateExecution {
                    execution_id: execution_id.to_string(),
                });
            }
            self.store.remove_from_set(HISTORY_SET, execution_id).await?;
        }

        let record = ExecutionRecord::running(execution_id, workflow_id, total_steps, initial_data.unwrap_or_default());
        self.save(&record).await?;
        self.store.add_to_set(ACTIVE_SET, execution_id).await?;

        tracing::info!(
            execution_id = %execution_id,
            workflow_id = %workflow_id,
            total_steps,
            "Tracking execution"
        );
        Ok(record)
    }

    /// Record step progress and merge `additional_data` into the record.
    ///
    /// A terminal record is returned unchanged.
    pub async fn update_progress(
        &self,
        execution_id: &str,
        completed_steps: u32,
        current_step: &str,
        additional_data: Option<Map<String, Value>>,
    ) -> EngineResult<ExecutionRecord> {
        let mut record = self.require(execution_id).await?;
        if record.is_terminal() {
            tracing::debug!(
                execution_id = %execution_id,
                status = %record.status,
                "Ignoring progress update on terminal execution"
            );
            return Ok(record);
        }

        let mut completed = completed_steps;
        if completed > record.total_steps {
            tracing::warn!(
                execution_id = %execution_id,
                completed_steps,
                total_steps = record.total_steps,
                "Completed steps exceed total, clamping"
            );
            completed = record.total_steps;
        }

        let now = Utc::now();
        record.completed_steps = completed;
        record.current_step = Some(current_step.to_string());
        record.progress = compute_progress(completed, record.total_steps);
        if let Some(data) = additional_data {
            record.data.extend(data);
        }
        record.updated_at = now;
        record.estimated_completion = record.estimate_completion(now);

        self.save(&record).await?;
        tracing::debug!(
            execution_id = %execution_id,
            step = %current_step,
            completed_steps = completed,
            progress = record.progress,
            "Execution progress"
        );
        Ok(record)
    }

    /// Move the execution to a terminal status.
    ///
    /// Progress becomes 100 on `completed` and stays frozen otherwise. A
    /// record that is already terminal is returned unchanged.
    pub async fn complete(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: Option<String>,
        final_data: Option<Map<String, Value>>,
    ) -> EngineResult<ExecutionRecord> {
        if !status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                execution_id: execution_id.to_string(),
                message: format!("'{}' is not a terminal status", status),
            });
        }

        let mut record = self.require(execution_id).await?;
        if record.is_terminal() {
            tracing::debug!(
                execution_id = %execution_id,
                status = %record.status,
                requested = %status,
                "Ignoring completion of terminal execution"
            );
            return Ok(record);
        }

        record.status = status;
        if status == ExecutionStatus::Completed {
            record.progress = 100;
        }
        record.error = error;
        if let Some(data) = final_data {
            record.data.extend(data);
        }
        record.updated_at = Utc::now();
        record.estimated_completion = None;

        self.save(&record).await?;
        self.store.remove_from_set(ACTIVE_SET, execution_id).await?;
        self.store.add_to_set(HISTORY_SET, execution_id).await?;

        match status {
            ExecutionStatus::Completed => tracing::info!(
                execution_id = %execution_id,
                duration_ms = record.duration_ms(),
                "Execution completed"
            ),
            _ => tracing::warn!(
                execution_id = %execution_id,
                status = %status,
                error = ?record.error,
                "Execution ended"
            ),
        }

        let _ = self
            .enforce_history_limit()
            .await
            .log("enforcing execution history limit");
        Ok(record)
    }

    pub async fn fetch(&self, execution_id: &str) -> EngineResult<Option<ExecutionRecord>> {
        match self.store.get(&record_key(execution_id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Ids in the active set, sorted.
    pub async fn list_active(&self) -> EngineResult<Vec<String>> {
        let mut ids: Vec<String> = self.store.members(ACTIVE_SET).await?.into_iter().collect();
        ids.sort();
        Ok(ids)
    }

    /// Records for the active set. Ids whose record has expired are skipped.
    pub async fn list_active_detailed(&self) -> EngineResult<Vec<ExecutionRecord>> {
        let mut records = Vec::new();
        for id in self.list_active().await? {
            if let Some(record) = self.fetch(&id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Fail every active execution not updated within `max_age`.
    ///
    /// Returns how many records were terminalized. Active-set entries whose
    /// record is gone or already terminal are dropped without being counted.
    pub async fn cleanup_stale(&self, max_age: Duration) -> EngineResult<usize> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| EngineError::Config(format!("stale window out of range: {}", e)))?;
        let cutoff = Utc::now() - max_age;
        let mut cleaned = 0;

        for id in self.store.members(ACTIVE_SET).await? {
            let record = match self.fetch(&id).await? {
                Some(record) => record,
                None => {
                    tracing::debug!(execution_id = %id, "Dropping active entry without record");
                    self.store.remove_from_set(ACTIVE_SET, &id).await?;
                    continue;
                }
            };

            if record.is_terminal() {
                self.store.remove_from_set(ACTIVE_SET, &id).await?;
                continue;
            }

            if record.updated_at < cutoff {
                let stale = EngineError::StaleExecution(id.clone());
                tracing::warn!(
                    execution_id = %id,
                    updated_at = %record.updated_at,
                    error = %stale,
                    "Terminalizing stale execution"
                );
                self.complete(&id, ExecutionStatus::Failed, Some(STALE_ERROR.to_string()), None)
                    .await?;
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            tracing::info!(cleaned, "Stale execution cleanup finished");
        }
        Ok(cleaned)
    }

    /// Counts by status over active and retained executions.
    pub async fn statistics(&self) -> EngineResult<ExecutionStatistics> {
        let mut ids: HashSet<String> = self.store.members(ACTIVE_SET).await?;
        ids.extend(self.store.members(HISTORY_SET).await?);

        let mut stats = ExecutionStatistics::default();
        let mut total_duration_ms: i64 = 0;
        let mut terminal = 0i64;

        for id in ids {
            let Some(record) = self.fetch(&id).await? else {
                continue;
            };
            stats.total_tracked += 1;
            *stats.by_status.entry(record.status.to_string()).or_insert(0) += 1;
            if record.is_terminal() {
                total_duration_ms += record.duration_ms();
                terminal += 1;
            }
        }

        if terminal > 0 {
            stats.avg_duration_ms = (total_duration_ms / terminal) as u64;
        }
        Ok(stats)
    }

    async fn require(&self, execution_id: &str) -> EngineResult<ExecutionRecord> {
        self.fetch(execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution_id)))
    }

    async fn save(&self, record: &ExecutionRecord) -> EngineResult<()> {
        self.store
            .set(
                &record_key(&record.execution_id),
                serde_json::to_value(record)?,
                Some(self.config.record_ttl),
            )
            .await?;
        Ok(())
    }

    /// Evict the oldest terminal records by `updatedAt` beyond the limit.
    async fn enforce_history_limit(&self) -> EngineResult<()> {
        let ids = self.store.members(HISTORY_SET).await?;
        if ids.len() <= self.config.history_limit {
            return Ok(());
        }

        let mut retained = Vec::with_capacity(ids.len());
        for id in ids {
            match self.fetch(&id).await? {
                Some(record) => retained.push((record.updated_at, id)),
                None => self.store.remove_from_set(HISTORY_SET, &id).await?,
            }
        }
        if retained.len() <= self.config.history_limit {
            return Ok(());
        }

        retained.sort();
        let excess = retained.len() - self.config.history_limit;
        for (_, id) in retained.into_iter().take(excess) {
            self.store.delete(&record_key(&id)).await?;
            self.store.remove_from_set(HISTORY_SET, &id).await?;
            tracing::debug!(execution_id = %id, "Evicted execution from history");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn manager() -> WorkflowStateManager {
        WorkflowStateManager::new(Arc::new(MemoryStore::new()), StateManagerConfig::default())
    }

    fn data(value: Value) -> Option<Map<String, Value>> {
        match value {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_start_tracking() {
        let states = manager();
        let record = states
            .start_tracking("E1", "wf", 3, data(json!({"user": "ada"})))
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Running);
        assert_eq!(record.progress, 0);
        assert_eq!(record.completed_steps, 0);
        assert_eq!(record.data["user"], "ada");
        assert_eq!(states.list_active().await.unwrap(), vec!["E1".to_string()]);
        assert_eq!(states.fetch("E1").await.unwrap().unwrap(), record);
    }

    #[tokio::test]
    async fn test_start_tracking_rejects_live_duplicate() {
        let states = manager();
        states.start_tracking("E1", "wf", 2, None).await.unwrap();

        let err = states.start_tracking("E1", "wf", 2, None).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateExecution { .. }));

        states
            .complete("E1", ExecutionStatus::Completed, None, None)
            .await
            .unwrap();
        let rerun = states.start_tracking("E1", "wf", 2, None).await.unwrap();
        assert_eq!(rerun.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn test_update_progress_merges_and_estimates() {
        let states = manager();
        states
            .start_tracking("E1", "wf", 3, data(json!({"a": 1, "b": 1})))
            .await
            .unwrap();

        let record = states
            .update_progress("E1", 1, "first", data(json!({"b": 2, "c": 3})))
            .await
            .unwrap();
        assert_eq!(record.progress, 33);
        assert_eq!(record.current_step.as_deref(), Some("first"));
        assert_eq!(record.data["a"], 1);
        assert_eq!(record.data["b"], 2);
        assert_eq!(record.data["c"], 3);
        assert!(record.estimated_completion.unwrap() >= record.started_at);

        let record = states.update_progress("E1", 2, "second", None).await.unwrap();
        assert_eq!(record.progress, 67);
    }

    #[tokio::test]
    async fn test_update_progress_clamps() {
        let states = manager();
        states.start_tracking("E1", "wf", 2, None).await.unwrap();
        let record = states.update_progress("E1", 5, "x", None).await.unwrap();
        assert_eq!(record.completed_steps, 2);
        assert_eq!(record.progress, 100);
    }

    #[tokio::test]
    async fn test_update_progress_unknown_execution() {
        let states = manager();
        let err = states.update_progress("nope", 1, "x", None).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_terminal_record_is_frozen() {
        let states = manager();
        states.start_tracking("E1", "wf", 4, None).await.unwrap();
        states.update_progress("E1", 1, "one", None).await.unwrap();
        let failed = states
            .complete("E1", ExecutionStatus::Failed, Some("boom".into()), None)
            .await
            .unwrap();
        assert_eq!(failed.progress, 25);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(states.list_active().await.unwrap().is_empty());

        let after_update = states
            .update_progress("E1", 3, "three", data(json!({"late": true})))
            .await
            .unwrap();
        assert_eq!(after_update, failed);

        let after_complete = states
            .complete("E1", ExecutionStatus::Completed, None, None)
            .await
            .unwrap();
        assert_eq!(after_complete, failed);
        assert_eq!(states.fetch("E1").await.unwrap().unwrap(), failed);
    }

    #[tokio::test]
    async fn test_complete_sets_progress_and_merges_final_data() {
        let states = manager();
        states.start_tracking("E1", "wf", 3, None).await.unwrap();
        let record = states
            .complete("E1", ExecutionStatus::Completed, None, data(json!({"out": "ok"})))
            .await
            .unwrap();
        assert_eq!(record.progress, 100);
        assert_eq!(record.data["out"], "ok");
    }

    #[tokio::test]
    async fn test_complete_rejects_non_terminal_status() {
        let states = manager();
        states.start_tracking("E1", "wf", 1, None).await.unwrap();
        let err = states
            .complete("E1", ExecutionStatus::Running, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_cleanup_stale_is_idempotent() {
        let states = manager();
        let mut old = states.start_tracking("OLD", "wf", 2, None).await.unwrap();
        old.updated_at = Utc::now() - chrono::Duration::hours(2);
        states.save(&old).await.unwrap();
        states.start_tracking("FRESH", "wf", 2, None).await.unwrap();

        let first = states.cleanup_stale(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(first, 1);
        let second = states.cleanup_stale(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(second, 0);

        let stale = states.fetch("OLD").await.unwrap().unwrap();
        assert_eq!(stale.status, ExecutionStatus::Failed);
        assert_eq!(stale.error.as_deref(), Some(STALE_ERROR));
        assert_eq!(states.list_active().await.unwrap(), vec!["FRESH".to_string()]);
    }

    #[tokio::test]
    async fn test_cleanup_drops_dangling_entries() {
        let store = Arc::new(MemoryStore::new());
        let states = WorkflowStateManager::new(store.clone(), StateManagerConfig::default());
        store.add_to_set(ACTIVE_SET, "ghost").await.unwrap();

        assert_eq!(states.cleanup_stale(Duration::from_secs(1)).await.unwrap(), 0);
        assert!(states.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_statistics() {
        let states = manager();
        states.start_tracking("A", "wf", 1, None).await.unwrap();
        states.start_tracking("B", "wf", 1, None).await.unwrap();
        states.start_tracking("C", "wf", 1, None).await.unwrap();
        states.complete("B", ExecutionStatus::Completed, None, None).await.unwrap();
        states
            .complete("C", ExecutionStatus::Failed, Some("x".into()), None)
            .await
            .unwrap();

        let stats = states.statistics().await.unwrap();
        assert_eq!(stats.total_tracked, 3);
        assert_eq!(stats.by_status.get("running"), Some(&1));
        assert_eq!(stats.by_status.get("completed"), Some(&1));
        assert_eq!(stats.by_status.get("failed"), Some(&1));

        let json = serde_json::to_value(&stats).unwrap();
        assert!(json.get("avgDurationMs").is_some());
        assert_eq!(json["totalTracked"], 3);
    }

    #[tokio::test]
    async fn test_history_evicts_oldest_by_updated_at() {
        let states = WorkflowStateManager::new(
            Arc::new(MemoryStore::new()),
            StateManagerConfig {
                history_limit: 2,
                ..StateManagerConfig::default()
            },
        );

        for id in ["H1", "H2", "H3"] {
            states.start_tracking(id, "wf", 1, None).await.unwrap();
            states.complete(id, ExecutionStatus::Completed, None, None).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(states.fetch("H1").await.unwrap().is_none());
        assert!(states.fetch("H2").await.unwrap().is_some());
        assert!(states.fetch("H3").await.unwrap().is_some());
        assert_eq!(states.statistics().await.unwrap().total_tracked, 2);
    }
}
