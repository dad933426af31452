//! Execution engine.
//!
//! Drives one workflow run under the execution lock:
//!
//! ```text
//! validate -> lock -> startTracking -> started event
//!   for each step (or parallel group):
//!     cancel check -> resolve {{vars}} -> protect(capability, execute)
//!     -> merge output under step name -> updateProgress -> progress event
//!   -> complete(completed|failed|cancelled) -> terminal event -> unlock
//! ```

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use stackbrowser_tools::{StepContext, StepError, StepExecutor, TemplateEngine};

use super::catalog::WorkflowCatalog;
use super::workflow::{Step, StepNode, WorkflowDefinition};
use crate::config::CoordinatorConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBroadcaster, ExecutionEvent};
use crate::lock::ExecutionLockManager;
use crate::resilience::{CircuitBreakerRegistry, ProtectError, RetryPolicy};
use crate::result_ext::ResultExt;
use crate::state::{ExecutionRecord, ExecutionStatus, StateManagerConfig, WorkflowStateManager};
use crate::store::StateStore;

const CANCEL_PREFIX: &str = "cancel:execution:";

fn cancel_key(execution_id: &str) -> String {
    format!("{}{}", CANCEL_PREFIX, execution_id)
}

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lock holder identity of this process
    pub worker_id: String,
    pub lock_ttl: Duration,
    /// Deadline for a whole run
    pub workflow_timeout: Duration,
    /// Default per-step executor timeout
    pub step_timeout: Duration,
    /// Default concurrency of parallel groups
    pub parallel_limit: usize,
    /// Used by steps without their own `retryPolicy`
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("engine-{}", uuid::Uuid::new_v4().simple()),
            lock_ttl: Duration::from_secs(300),
            workflow_timeout: Duration::from_secs(300),
            step_timeout: Duration::from_secs(60),
            parallel_limit: 5,
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&CoordinatorConfig> for EngineConfig {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            lock_ttl: config.lock_ttl(),
            workflow_timeout: config.workflow_timeout(),
            step_timeout: config.step_timeout(),
            parallel_limit: config.parallel_limit,
            retry: RetryPolicy::default(),
        }
    }
}

/// How the step loop ended.
enum Outcome {
    Completed(Map<String, Value>),
    Cancelled,
    /// `error` ends the run; `step_errors` holds `{"error": ..}` for every
    /// step that failed fatally.
    Failed {
        error: EngineError,
        step_errors: Map<String, Value>,
    },
}

impl Outcome {
    fn failed(error: EngineError) -> Self {
        Outcome::Failed {
            error,
            step_errors: Map::new(),
        }
    }
}

/// What the loop does after a step result is recorded.
enum Flow {
    Continue,
    Abort(EngineError),
}

/// Orchestrates workflow runs.
pub struct ExecutionEngine {
    config: EngineConfig,
    store: Arc<dyn StateStore>,
    locks: ExecutionLockManager,
    states: WorkflowStateManager,
    events: EventBroadcaster,
    breakers: CircuitBreakerRegistry,
    catalog: WorkflowCatalog,
    executor: Arc<dyn StepExecutor>,
    templates: TemplateEngine,
    cancelled: Mutex<HashSet<String>>,
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn StateStore>, executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            locks: ExecutionLockManager::with_ttl(Arc::clone(&store), config.lock_ttl),
            states: WorkflowStateManager::new(Arc::clone(&store), StateManagerConfig::default()),
            events: EventBroadcaster::default(),
            breakers: CircuitBreakerRegistry::new(),
            catalog: WorkflowCatalog::new(),
            templates: TemplateEngine::new(),
            cancelled: Mutex::new(HashSet::new()),
            config,
            store,
            executor,
        }
    }

    pub fn with_state_config(mut self, state_config: StateManagerConfig) -> Self {
        self.states = WorkflowStateManager::new(Arc::clone(&self.store), state_config);
        self
    }

    pub fn with_broadcaster(mut self, events: EventBroadcaster) -> Self {
        self.events = events;
        self
    }

    pub fn with_catalog(mut self, catalog: WorkflowCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn states(&self) -> &WorkflowStateManager {
        &self.states
    }

    pub fn locks(&self) -> &ExecutionLockManager {
        &self.locks
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn catalog(&self) -> &WorkflowCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Run the registered workflow `workflow_id`.
    pub async fn start(
        &self,
        workflow_id: &str,
        execution_id: Option<String>,
        variables: Map<String, Value>,
    ) -> EngineResult<ExecutionRecord> {
        let definition = self
            .catalog
            .get(workflow_id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("workflow {}", workflow_id)))?;
        self.run(&definition, execution_id, variables).await
    }

    /// Run `definition` to a terminal state.
    ///
    /// Returns the final record when the run completes or is cancelled. A
    /// failed step returns the step error after the record has been marked
    /// failed. Contention on the execution id returns
    /// [`EngineError::DuplicateExecution`] without touching any state.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        execution_id: Option<String>,
        variables: Map<String, Value>,
    ) -> EngineResult<ExecutionRecord> {
        definition.validate()?;
        let execution_id = execution_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let result = self
            .locks
            .with_lock(&execution_id, &self.config.worker_id, || {
                self.execute(definition, &execution_id, variables)
            })
            .await;

        match result {
            Err(EngineError::LockContention { execution_id }) => {
                tracing::info!(execution_id = %execution_id, "Execution already running elsewhere");
                Err(EngineError::DuplicateExecution { execution_id })
            }
            other => other,
        }
    }

    /// Request cooperative cancellation. The running step finishes first.
    ///
    /// Returns whether a non-terminal execution with this id exists.
    pub async fn cancel(&self, execution_id: &str) -> EngineResult<bool> {
        self.cancelled.lock().await.insert(execution_id.to_string());
        self.store
            .set(&cancel_key(execution_id), json!(true), Some(self.config.lock_ttl))
            .await?;

        let active = matches!(
            self.states.fetch(execution_id).await?,
            Some(record) if !record.is_terminal()
        );
        if !active {
            // Nothing to stop; a later run with this id must not start cancelled.
            self.clear_cancel(execution_id).await;
        }
        tracing::info!(execution_id = %execution_id, active, "Cancellation requested");
        Ok(active)
    }

    async fn execute(
        &self,
        definition: &WorkflowDefinition,
        execution_id: &str,
        variables: Map<String, Value>,
    ) -> EngineResult<ExecutionRecord> {
        let mut data = definition.variables.clone();
        data.extend(variables);
        let total_steps = definition.total_steps();

        self.states
            .start_tracking(execution_id, &definition.id, total_steps, Some(data.clone()))
            .await?;
        self.events
            .publish(
                execution_id,
                ExecutionEvent::Started {
                    workflow_id: definition.id.clone(),
                },
            )
            .await;

        let drive = self.drive(definition, execution_id, data, total_steps);
        let outcome = match tokio::time::timeout(self.config.workflow_timeout, drive).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(error)) => Outcome::failed(error),
            Err(_) => Outcome::failed(EngineError::WorkflowTimeout {
                execution_id: execution_id.to_string(),
                seconds: self.config.workflow_timeout.as_secs(),
            }),
        };

        self.clear_cancel(execution_id).await;
        self.finish(execution_id, outcome).await
    }

    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        execution_id: &str,
        mut data: Map<String, Value>,
        total_steps: u32,
    ) -> EngineResult<Outcome> {
        let mut completed = 0u32;

        for node in &definition.steps {
            if self.cancel_requested(execution_id).await {
                return Ok(Outcome::Cancelled);
            }

            let results = match node {
                StepNode::Step(step) => {
                    let result = self.run_step(execution_id, step, &data).await;
                    vec![(step, result)]
                }
                StepNode::Parallel(group) => {
                    let limit = group.max_concurrency.unwrap_or(self.config.parallel_limit).max(1);
                    let context = &data;
                    tracing::debug!(
                        execution_id = %execution_id,
                        steps = group.parallel.len(),
                        limit,
                        "Running parallel group"
                    );
                    let pending: Vec<BoxFuture<'_, (&Step, EngineResult<Value>)>> = group
                        .parallel
                        .iter()
                        .map(|step| async move { (step, self.run_step(execution_id, step, context).await) }.boxed())
                        .collect();
                    stream::iter(pending).buffered(limit).collect::<Vec<_>>().await
                }
            };

            // Every member of a group has run, so all of them are recorded
            // before a fatal failure ends the run.
            let mut first_error = None;
            let mut step_errors = Map::new();
            for (step, result) in results {
                let flow = self
                    .record_step(execution_id, step, result, &mut data, &mut completed, total_steps)
                    .await?;
                if let Flow::Abort(error) = flow {
                    step_errors.insert(step.name.clone(), json!({ "error": error.to_string() }));
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
            if let Some(error) = first_error {
                return Ok(Outcome::Failed { error, step_errors });
            }
        }

        Ok(Outcome::Completed(data))
    }

    /// Resolve parameters and call the executor behind the capability's breaker.
    async fn run_step(&self, execution_id: &str, step: &Step, context: &Map<String, Value>) -> EngineResult<Value> {
        let params = self
            .templates
            .render_value(&step.parameters, context)
            .map_err(|e| match e {
                StepError::UnresolvedVariable { field, message } => EngineError::VariableResolution {
                    step: step.name.clone(),
                    message: format!("{}: {}", field, message),
                },
                other => EngineError::StepExecution {
                    step: step.name.clone(),
                    message: other.to_string(),
                },
            })?;

        let policy = step.retry_policy.as_ref().unwrap_or(&self.config.retry);
        let timeout_ms = step
            .timeout_ms
            .unwrap_or(self.config.step_timeout.as_millis() as u64);
        let step_timeout = Duration::from_millis(timeout_ms);
        let executor = self.executor.as_ref();
        let params = &params;

        tracing::debug!(
            execution_id = %execution_id,
            step = %step.name,
            capability = %step.capability,
            "Dispatching step"
        );

        self.breakers
            .protect(&step.capability, policy, move |attempt| {
                let ctx = StepContext::new(execution_id, step.name.as_str())
                    .with_attempt(attempt)
                    .with_timeout_ms(timeout_ms);
                async move {
                    // The executor is asked to honour the timeout; enforce it here as well.
                    tokio::time::timeout(step_timeout, executor.execute(&step.capability, params, &ctx))
                        .await
                        .unwrap_or(Err(StepError::Timeout(timeout_ms)))
                }
            })
            .await
            .map_err(|e| match e {
                ProtectError::CircuitOpen { key } => EngineError::CircuitOpen { key },
                failed @ ProtectError::Failed { .. } => EngineError::StepExecution {
                    step: step.name.clone(),
                    message: failed.to_string(),
                },
            })
    }

    /// Merge one step result into the run and decide whether to go on.
    async fn record_step(
        &self,
        execution_id: &str,
        step: &Step,
        result: EngineResult<Value>,
        data: &mut Map<String, Value>,
        completed: &mut u32,
        total_steps: u32,
    ) -> EngineResult<Flow> {
        let output = match result {
            Ok(output) => output,
            Err(error) => {
                let tolerated = step.continue_on_error
                    || (matches!(error, EngineError::VariableResolution { .. }) && !step.required);
                if !tolerated {
                    tracing::warn!(
                        execution_id = %execution_id,
                        step = %step.name,
                        error = %error,
                        "Step failed"
                    );
                    return Ok(Flow::Abort(error));
                }
                tracing::warn!(
                    execution_id = %execution_id,
                    step = %step.name,
                    error = %error,
                    "Step failed, continuing"
                );
                json!({ "error": error.to_string() })
            }
        };

        *completed += 1;
        data.insert(step.name.clone(), output.clone());

        let mut update = Map::new();
        update.insert(step.name.clone(), output);
        self.states
            .update_progress(execution_id, *completed, &step.name, Some(update))
            .await?;
        self.events
            .publish(
                execution_id,
                ExecutionEvent::Progress {
                    completed_steps: *completed,
                    total_steps,
                    current_step: step.name.clone(),
                },
            )
            .await;
        Ok(Flow::Continue)
    }

    async fn finish(&self, execution_id: &str, outcome: Outcome) -> EngineResult<ExecutionRecord> {
        match outcome {
            Outcome::Completed(data) => {
                let result = Value::Object(data.clone());
                let record = self
                    .states
                    .complete(execution_id, ExecutionStatus::Completed, None, Some(data))
                    .await?;
                self.events
                    .publish(execution_id, ExecutionEvent::Completed { result })
                    .await;
                Ok(record)
            }
            Outcome::Cancelled => {
                let record = self
                    .states
                    .complete(execution_id, ExecutionStatus::Cancelled, None, None)
                    .await?;
                self.events.publish(execution_id, ExecutionEvent::Cancelled {}).await;
                Ok(record)
            }
            Outcome::Failed { error, step_errors } => {
                let message = error.to_string();
                let final_data = (!step_errors.is_empty()).then_some(step_errors);
                let _ = self
                    .states
                    .complete(execution_id, ExecutionStatus::Failed, Some(message.clone()), final_data)
                    .await
                    .log(format!("marking {} failed", execution_id));
                self.events
                    .publish(execution_id, ExecutionEvent::Failed { error: message })
                    .await;
                Err(error)
            }
        }
    }

    async fn cancel_requested(&self, execution_id: &str) -> bool {
        if self.cancelled.lock().await.contains(execution_id) {
            return true;
        }
        // Cancellation from another instance arrives through the store.
        matches!(self.store.get(&cancel_key(execution_id)).await, Ok(Some(_)))
    }

    async fn clear_cancel(&self, execution_id: &str) {
        self.cancelled.lock().await.remove(execution_id);
        let _ = self
            .store
            .delete(&cancel_key(execution_id))
            .await
            .log(format!("clearing cancel marker for {}", execution_id));
    }
}
